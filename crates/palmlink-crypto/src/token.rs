//! Token hashing and constant-time comparison.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Length of a [`hash_token`] digest in hex characters.
pub const TOKEN_HASH_HEX_LEN: usize = 64;

/// One-way hash of an auth token, as lowercase hex SHA-256.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Compare two byte strings without early exit on the first differing byte.
///
/// Slices of different length compare unequal.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_hash_token_is_stable_hex() {
        let hash = hash_token("token-1");
        assert_eq!(hash.len(), TOKEN_HASH_HEX_LEN);
        assert_eq!(hash, hash_token("token-1"));
        assert_ne!(hash, hash_token("token-2"));
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(!constant_time_eq(b"", b"a"));
    }

    proptest! {
        #[test]
        fn prop_hash_length_is_independent_of_input(token in ".{0,256}") {
            prop_assert_eq!(hash_token(&token).len(), TOKEN_HASH_HEX_LEN);
        }

        #[test]
        fn prop_eq_matches_slice_equality(a in proptest::collection::vec(any::<u8>(), 0..64),
                                          b in proptest::collection::vec(any::<u8>(), 0..64)) {
            prop_assert_eq!(constant_time_eq(&a, &b), a == b);
        }
    }
}
