//! Canonical serialization for deterministic hashing.
//!
//! Verdict fingerprints and policy parameter hashes are computed over a
//! canonical byte representation so that replaying a verification yields
//! bit-identical identifiers.
//!
//! ## Determinism Guarantees
//!
//! - Stable field order: struct fields serialize in declaration order
//! - Stable Vec order: vectors serialize in index order
//! - No HashMap allowed: use BTreeMap for maps in hashed data
//! - Floats are quantized to integers before they reach this layer

use serde::Serialize;
use xxhash_rust::xxh64::xxh64;

/// Serialize a value to canonical JSON bytes for hashing.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).expect("canonical serialization failed")
}

/// Compute the canonical hash of a serializable value.
pub fn canonical_hash<T: Serialize>(value: &T) -> u64 {
    let bytes = to_canonical_bytes(value);
    xxh64(&bytes, 0)
}

/// Compute the canonical hash and return it as a hex string.
pub fn canonical_hash_hex<T: Serialize>(value: &T) -> String {
    format!("{:016x}", canonical_hash(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct TestStruct {
        name: String,
        value: i32,
    }

    #[test]
    fn test_determinism() {
        let s = TestStruct {
            name: "test".to_string(),
            value: 42,
        };

        let h1 = canonical_hash(&s);
        let h2 = canonical_hash(&s);
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_different_values_differ() {
        let a = TestStruct {
            name: "a".to_string(),
            value: 1,
        };
        let b = TestStruct {
            name: "a".to_string(),
            value: 2,
        };
        assert_ne!(canonical_hash(&a), canonical_hash(&b));
    }
}
