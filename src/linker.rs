//! # Candidate Linker
//!
//! The pure read-modify-write step applied to one bucket's record list:
//! prune expired observations, score the survivors against the current
//! fingerprint, append the current observation, and report the best
//! qualifying match. Stores call this under their own per-bucket locking.

use crate::config::LinkerTuning;
use crate::model::{Fingerprint, IdentityRecord};
use crate::similarity::aggregate_score;
use time::OffsetDateTime;

/// Prune, match, and append within one bucket.
///
/// Mutates `records` in place: expired entries are dropped, the current
/// observation is appended, and the list is truncated oldest-first to the
/// configured per-bucket cap. Returns the visitor id of the best candidate
/// whose aggregate score reaches the threshold, excluding candidates that
/// carry the current visitor id. Ties keep the first record that reached
/// the maximum score.
pub fn link_observation(
    records: &mut Vec<IdentityRecord>,
    visitor_id: &str,
    fingerprint: &Fingerprint,
    now: OffsetDateTime,
    tuning: &LinkerTuning,
) -> Option<String> {
    let mut kept = Vec::with_capacity(records.len() + 1);
    let mut best_match: Option<String> = None;
    let mut max_score = 0.0;

    for record in records.drain(..) {
        if record.is_expired(now, tuning.ttl) {
            continue;
        }

        if record.visitor_id != visitor_id {
            let score = aggregate_score(fingerprint, &record.fingerprint);
            if score > max_score && score >= tuning.similarity_threshold {
                max_score = score;
                best_match = Some(record.visitor_id.clone());
            }
        }

        kept.push(record);
    }

    kept.push(IdentityRecord::new(
        visitor_id.to_string(),
        fingerprint.clone(),
        now,
    ));

    let cap = tuning.max_records_per_bucket;
    if cap > 0 && kept.len() > cap {
        let excess = kept.len() - cap;
        kept.drain(..excess);
    }

    *records = kept;
    best_match
}
