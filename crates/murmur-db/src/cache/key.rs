//! Cache key derivation.
//!
//! The outer key is a SHA-256 fingerprint of the statement text; the full
//! cache key appends the bind parameters in order. Parameter order is
//! significant and must match the bind order — `WHERE a=$1 AND b=$2`
//! called with swapped values is a different key on purpose.

use sha2::{Digest, Sha256};

/// Deterministic fingerprint of a statement text.
#[must_use]
pub fn fingerprint(query: &str) -> String {
    let digest = Sha256::digest(query.as_bytes());
    // 16 bytes of hex keeps keys short while staying collision-safe for
    // the statement population of one process.
    hex_prefix(&digest, 16)
}

/// Full cache key: fingerprint plus ordered parameters.
#[must_use]
pub fn cache_key(fingerprint: &str, params: &[String]) -> String {
    let mut key = String::with_capacity(fingerprint.len() + params.iter().map(|p| p.len() + 1).sum::<usize>());
    key.push_str(fingerprint);
    for param in params {
        key.push('|');
        key.push_str(param);
    }
    key
}

fn hex_prefix(bytes: &[u8], take: usize) -> String {
    bytes.iter().take(take).map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_deterministic() {
        assert_eq!(fingerprint("SELECT 1"), fingerprint("SELECT 1"));
        assert_ne!(fingerprint("SELECT 1"), fingerprint("SELECT 2"));
        assert_eq!(fingerprint("SELECT 1").len(), 32);
    }

    #[test]
    fn test_cache_key_orders_params() {
        let fp = fingerprint("q");
        let ab = cache_key(&fp, &["a".into(), "b".into()]);
        let ba = cache_key(&fp, &["b".into(), "a".into()]);
        assert_ne!(ab, ba, "parameter order is significant");
    }

    #[test]
    fn test_cache_key_without_params_is_fingerprint() {
        let fp = fingerprint("q");
        assert_eq!(cache_key(&fp, &[]), fp);
    }
}
