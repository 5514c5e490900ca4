//! # Signal Extraction
//!
//! Narrows a raw, loosely-typed tracking event into the signals the
//! resolution cache operates on: a stable bucket key, a high-entropy
//! fingerprint vector, and a candidate visitor identifier.
//!
//! Extraction is "soft": any scalar is coerced to a display string rather
//! than failing, and missing or malformed input only ever produces empty
//! values that lead to a skip.

use crate::model::{BucketKey, Fingerprint};
use serde_json::{Map, Value};

/// Signals extracted from one raw event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signals {
    pub bucket_key: BucketKey,
    pub fingerprint: Fingerprint,
    pub visitor_id: String,
}

/// Extract resolution signals from a raw event.
///
/// Returns `None` (skip, no resolution attempted) when the event lacks a
/// device sub-object, the bucket key would be built from empty stable
/// fields, no fingerprint component is set, or no visitor identifier can
/// be derived.
pub fn extract(event: &Value) -> Option<Signals> {
    let device = event.get("device")?.as_object()?;

    let bucket_key = build_bucket_key(device)?;
    let fingerprint = extract_fingerprint(event, device)?;
    let visitor_id = extract_visitor_id(event)?;

    Some(Signals {
        bucket_key,
        fingerprint,
        visitor_id,
    })
}

/// Construct a stable grouping key from low-volatility device signals
/// (timezone, platform, language, etc.), excluding volatile ones like IP
/// or user-agent versions.
fn build_bucket_key(device: &Map<String, Value>) -> Option<BucketKey> {
    let timezone = coerce_str(device.get("timezone"));
    let platform = coerce_str(device.get("platform"));

    // Protection against empty keys
    if timezone.is_empty() && platform.is_empty() {
        return None;
    }

    let language = coerce_str(device.get("language"));
    let concurrency = coerce_str(device.get("hardwareConcurrency"));

    // Screen resolution normalization: larger dimension first, so
    // portrait/landscape reporting does not split a device in two.
    let mut w = coerce_f64(device.get("screenWidth"));
    let mut h = coerce_f64(device.get("screenHeight"));
    if h > w {
        std::mem::swap(&mut w, &mut h);
    }
    let screen_res = format!("{w:.0}x{h:.0}");

    let pixel_ratio = coerce_f64(device.get("pixelRatio"));
    let color_depth = coerce_f64(device.get("colorDepth"));

    Some(BucketKey::new(format!(
        "{timezone}|{platform}|{language}|{screen_res}|{concurrency}|{pixel_ratio:.2}|{color_depth:.0}"
    )))
}

/// Extract the high-entropy fingerprint (canvas, audio, WebGL, TLS).
///
/// Returns `None` if no component carries a signal.
fn extract_fingerprint(event: &Value, device: &Map<String, Value>) -> Option<Fingerprint> {
    let fp_data = device.get("fingerprint")?.as_object()?;

    let fingerprint = Fingerprint {
        canvas: coerce_str(fp_data.get("canvas")),
        audio: coerce_str(fp_data.get("audio")),
        webgl: coerce_str(fp_data.get("webgl")),
        tls: coerce_str(event.get("server").and_then(|s| s.get("tls_fingerprint"))),
    };

    if fingerprint.is_empty() {
        return None;
    }
    Some(fingerprint)
}

/// Best available identifier: `visitor_id`, falling back to `device_id`.
fn extract_visitor_id(event: &Value) -> Option<String> {
    let mut vid = coerce_str(event.get("visitor_id"));
    if vid.is_empty() {
        vid = coerce_str(event.get("device_id"));
    }
    if vid.is_empty() {
        return None;
    }
    Some(vid)
}

/// Soft cast to a display string. Scalars render naturally; null and
/// structured values render empty.
fn coerce_str(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                let f = n.as_f64().unwrap_or(0.0);
                if f.fract() == 0.0 && f.is_finite() {
                    format!("{f:.0}")
                } else {
                    f.to_string()
                }
            }
        }
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

/// Soft cast to f64; non-numeric input yields 0.
fn coerce_f64(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}
