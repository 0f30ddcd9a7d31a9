//! Simulated per-user interest vectors and engagement scores.
//!
//! Interest data has no durable source in the core, so both signals are
//! derived deterministically from a SHA-256 of the user id: the same user
//! always gets the same vector, distinct users get independent-looking
//! ones, and tests are reproducible without fixtures.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

/// The fixed interest dimensions users are scored over.
pub const INTEREST_DIMENSIONS: [&str; 8] = [
    "technology",
    "music",
    "sports",
    "art",
    "gaming",
    "science",
    "travel",
    "food",
];

/// Raw affinity threshold below which a dimension is dropped.
const MIN_AFFINITY: f64 = 0.25;

/// Deterministic, L1-normalized interest vector for a user.
///
/// Dimensions with weak affinity are absent; the remaining weights sum to
/// 1.0. A user whose hash clears the threshold nowhere still gets their
/// single strongest dimension, so every user has at least one interest.
#[must_use]
pub fn interest_vector(user_id: &str) -> HashMap<&'static str, f64> {
    let digest = Sha256::digest(user_id.as_bytes());

    let mut raw: Vec<(&'static str, f64)> = INTEREST_DIMENSIONS
        .iter()
        .enumerate()
        .map(|(i, dim)| (*dim, f64::from(digest[i]) / 255.0))
        .collect();

    let mut kept: Vec<(&'static str, f64)> = raw
        .iter()
        .copied()
        .filter(|(_, w)| *w >= MIN_AFFINITY)
        .collect();
    if kept.is_empty() {
        raw.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        kept.push(raw[0]);
    }

    let total: f64 = kept.iter().map(|(_, w)| w).sum();
    kept.into_iter().map(|(dim, w)| (dim, w / total)).collect()
}

/// Deterministic engagement score in `[0, 1]` for a user.
#[must_use]
pub fn engagement_score(user_id: &str) -> f64 {
    let digest = Sha256::digest(user_id.as_bytes());
    let bits = u64::from_be_bytes([
        digest[8], digest[9], digest[10], digest[11], digest[12], digest[13], digest[14], digest[15],
    ]);
    bits as f64 / u64::MAX as f64
}

/// Similarity of two L1-normalized vectors: sum of per-dimension minima.
///
/// Equals 1.0 for identical vectors and 0.0 for disjoint support; for
/// positive normalized weights this tracks the dot-product ordering.
#[must_use]
pub fn similarity(a: &HashMap<&'static str, f64>, b: &HashMap<&'static str, f64>) -> f64 {
    a.iter()
        .filter_map(|(dim, wa)| b.get(dim).map(|wb| wa.min(*wb)))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_is_deterministic() {
        assert_eq!(interest_vector("u1"), interest_vector("u1"));
    }

    #[test]
    fn test_vector_is_normalized() {
        for user in ["u1", "alice", "bob_2024", "x"] {
            let total: f64 = interest_vector(user).values().sum();
            assert!((total - 1.0).abs() < 1e-9, "vector for {user} sums to {total}");
        }
    }

    #[test]
    fn test_every_user_has_an_interest() {
        for i in 0..50 {
            assert!(!interest_vector(&format!("user_{i}")).is_empty());
        }
    }

    #[test]
    fn test_engagement_in_unit_range() {
        for i in 0..50 {
            let score = engagement_score(&format!("user_{i}"));
            assert!((0.0..=1.0).contains(&score));
        }
    }

    #[test]
    fn test_self_similarity_is_one() {
        let v = interest_vector("u1");
        assert!((similarity(&v, &v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_similarity_is_symmetric() {
        let a = interest_vector("u1");
        let b = interest_vector("u2");
        assert!((similarity(&a, &b) - similarity(&b, &a)).abs() < 1e-12);
    }
}
