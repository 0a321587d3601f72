//! Deterministic bucket naming.

use crate::traits::BUCKET_PREFIX;
use sha2::{Digest, Sha256};

/// Hex characters of the digest kept in the bucket name.
const BUCKET_HASH_LEN: usize = 48;

/// Derive the bucket name for a scope under a given access key.
///
/// `ferry-` followed by the first 48 hex characters of
/// `sha256(scope || 0x00 || access_key_id)`. The result is 54 characters of
/// lowercase ASCII, which every S3-compatible service accepts.
pub fn bucket_name(scope: &str, access_key_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(scope.as_bytes());
    hasher.update([0u8]);
    hasher.update(access_key_id.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{BUCKET_PREFIX}{}", &digest[..BUCKET_HASH_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_name_is_deterministic() {
        let a = bucket_name("alice", "AKID");
        let b = bucket_name("alice", "AKID");
        assert_eq!(a, b);
        assert_eq!(a.len(), 54);
        assert!(a.starts_with("ferry-"));
        assert!(a[6..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_bucket_name_separates_scope_and_key() {
        assert_ne!(bucket_name("alice", "AKID"), bucket_name("bob", "AKID"));
        assert_ne!(bucket_name("alice", "AKID"), bucket_name("alice", "OTHER"));
        // The separator keeps ("ab", "c") and ("a", "bc") apart.
        assert_ne!(bucket_name("ab", "c"), bucket_name("a", "bc"));
    }
}
