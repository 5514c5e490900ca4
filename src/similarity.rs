//! # Similarity Engine
//!
//! N-gram Jaccard similarity over fingerprint hash strings. Tolerates small
//! hash drift (minor renderer or driver version changes) that exact-match
//! comparison would miss.

use crate::model::Fingerprint;
use rustc_hash::FxHashSet;

/// Size of contiguous n-grams used for Jaccard similarity.
pub const NGRAM_SIZE: usize = 3;

/// Minimum aggregate score for two fingerprints to be considered a match.
///
/// Compared against the sum of per-component similarities (range
/// `[0, 4]`), not a normalized percentage.
pub const SIMILARITY_THRESHOLD: f64 = 0.75;

/// Jaccard similarity coefficient for two hash strings using n-grams.
///
/// Returns a value between 0.0 (completely different) and 1.0 (identical).
pub fn jaccard_similarity(a: &str, b: &str, n: usize) -> f64 {
    if a == b {
        return 1.0;
    }
    if a.len() < n || b.len() < n {
        return 0.0;
    }

    let set_a: FxHashSet<&[u8]> = a.as_bytes().windows(n).collect();
    let set_b: FxHashSet<&[u8]> = b.as_bytes().windows(n).collect();

    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.len() + set_b.len() - intersection;
    if union == 0 {
        return 0.0;
    }

    intersection as f64 / union as f64
}

/// Check if two hash strings are similar under the Jaccard threshold.
///
/// Empty strings never match anything, regardless of threshold.
pub fn fuzzy_match(a: &str, b: &str, threshold: f64) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    jaccard_similarity(a, b, NGRAM_SIZE) >= threshold
}

/// Sum of per-component similarities across two fingerprint vectors.
///
/// A component that is empty on either side contributes 0.0; components are
/// never skipped, simply scored. The result lives in `[0, 4]` and callers
/// compare it against an absolute cutoff.
pub fn aggregate_score(a: &Fingerprint, b: &Fingerprint) -> f64 {
    component_similarity(&a.tls, &b.tls)
        + component_similarity(&a.canvas, &b.canvas)
        + component_similarity(&a.webgl, &b.webgl)
        + component_similarity(&a.audio, &b.audio)
}

fn component_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    jaccard_similarity(a, b, NGRAM_SIZE)
}
