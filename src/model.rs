//! # Data Model
//!
//! Core data structures for visitor identity resolution: bucket keys,
//! fingerprint vectors, and the per-bucket observation records.

use serde::{Deserialize, Serialize};
use std::fmt;
use time::{Duration, OffsetDateTime};

/// Coarse grouping key derived from stable, low-volatility device attributes.
///
/// Two events with different bucket keys are never compared against each
/// other; the key exists purely to bound the fuzzy-match search space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey(String);

impl BucketKey {
    /// Create a bucket key from an already-normalized key string.
    pub fn new(raw: String) -> Self {
        Self(raw)
    }

    /// Reconstruct a bucket key from its stored byte representation.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// High-entropy, possibly-noisy hashes describing a client.
///
/// Any subset of components may be empty (absent signal). Component names
/// mirror the wire format emitted by the tracking pixel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Canvas-render hash
    #[serde(rename = "cnv", default)]
    pub canvas: String,
    /// Audio-stack hash
    #[serde(rename = "aud", default)]
    pub audio: String,
    /// WebGL-renderer hash
    #[serde(rename = "gl", default)]
    pub webgl: String,
    /// Transport/TLS handshake hash
    #[serde(rename = "tls", default)]
    pub tls: String,
}

impl Fingerprint {
    /// True when no component carries a signal.
    pub fn is_empty(&self) -> bool {
        self.canvas.is_empty()
            && self.audio.is_empty()
            && self.webgl.is_empty()
            && self.tls.is_empty()
    }
}

/// One observation of one visitor identifier within one bucket.
///
/// Immutable once created; buckets hold ordered lists of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    #[serde(rename = "vid")]
    pub visitor_id: String,
    #[serde(rename = "fp")]
    pub fingerprint: Fingerprint,
    #[serde(rename = "t", with = "time::serde::timestamp")]
    pub observed_at: OffsetDateTime,
}

impl IdentityRecord {
    pub fn new(visitor_id: String, fingerprint: Fingerprint, observed_at: OffsetDateTime) -> Self {
        Self {
            visitor_id,
            fingerprint,
            observed_at,
        }
    }

    /// Age of this observation relative to `now`.
    pub fn age(&self, now: OffsetDateTime) -> Duration {
        now - self.observed_at
    }

    /// True when this observation is older than `ttl` at time `now`.
    pub fn is_expired(&self, now: OffsetDateTime, ttl: Duration) -> bool {
        self.age(now) > ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(unix: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(unix).unwrap()
    }

    #[test]
    fn test_fingerprint_is_empty() {
        assert!(Fingerprint::default().is_empty());

        let fp = Fingerprint {
            canvas: "c0ffee".to_string(),
            ..Default::default()
        };
        assert!(!fp.is_empty());

        let fp = Fingerprint {
            tls: "t1".to_string(),
            ..Default::default()
        };
        assert!(!fp.is_empty());
    }

    #[test]
    fn test_record_expiry() {
        let record = IdentityRecord::new("v1".to_string(), Fingerprint::default(), ts(1_000));
        let ttl = Duration::seconds(60);

        assert!(!record.is_expired(ts(1_000), ttl));
        // Boundary: age == ttl is still valid
        assert!(!record.is_expired(ts(1_060), ttl));
        assert!(record.is_expired(ts(1_061), ttl));
    }

    #[test]
    fn test_bucket_key_byte_roundtrip() {
        let key = BucketKey::new("Europe/Berlin|MacIntel|de-DE|2560x1440|8|2.00|24".to_string());
        let restored = BucketKey::from_bytes(key.as_bytes());
        assert_eq!(key, restored);
    }

    #[test]
    fn test_record_serde_wire_names() {
        let record = IdentityRecord::new(
            "v42".to_string(),
            Fingerprint {
                canvas: "abc".to_string(),
                ..Default::default()
            },
            ts(1_700_000_000),
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["vid"], "v42");
        assert_eq!(json["fp"]["cnv"], "abc");
        assert_eq!(json["t"], 1_700_000_000i64);
    }
}
