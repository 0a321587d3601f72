//! Digest helpers shared by the server and the transfer clients.
//!
//! Parts are identified by the MD5 of their bytes, which is also what
//! S3-compatible storage reports as the ETag of a single-request PUT.
//! Whole files are verified with SHA-256.

use crate::error::{Error, Result};
use md5::Md5;
use sha2::{Digest, Sha256};

/// Incremental MD5 of a part's bytes.
#[derive(Clone, Default)]
pub struct PartHasher(Md5);

impl PartHasher {
    pub fn new() -> Self {
        Self(Md5::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Lowercase hex digest.
    pub fn finalize_hex(self) -> String {
        hex::encode(self.0.finalize())
    }
}

/// Incremental SHA-256 of a whole file.
#[derive(Clone, Default)]
pub struct FileHasher(Sha256);

impl FileHasher {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Lowercase hex digest.
    pub fn finalize_hex(self) -> String {
        hex::encode(self.0.finalize())
    }
}

/// MD5 of `data` as lowercase hex.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// SHA-256 of `data` as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Strip the quotes storage services put around ETags and lowercase the rest.
pub fn normalize_etag(etag: &str) -> String {
    etag.trim()
        .trim_start_matches("W/")
        .trim_matches('"')
        .to_ascii_lowercase()
}

/// Validate a hex digest of `len` bytes and return it lowercased.
pub fn validate_hex_digest(s: &str, len: usize) -> Result<String> {
    if s.len() != len * 2 {
        return Err(Error::InvalidHash(format!(
            "expected {} hex chars, got {}",
            len * 2,
            s.len()
        )));
    }
    if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::InvalidHash(format!("not a hex digest: {s}")));
    }
    Ok(s.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digests() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let mut hasher = PartHasher::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize_hex(), md5_hex(b"hello world"));

        let mut hasher = FileHasher::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize_hex(), sha256_hex(b"hello world"));
    }

    #[test]
    fn test_normalize_etag() {
        assert_eq!(
            normalize_etag("\"D41D8CD98F00B204E9800998ECF8427E\""),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        assert_eq!(normalize_etag("W/\"abc\""), "abc");
        assert_eq!(normalize_etag("abc"), "abc");
    }

    #[test]
    fn test_validate_hex_digest() {
        assert_eq!(validate_hex_digest("ABCDEF", 3).unwrap(), "abcdef");
        assert!(validate_hex_digest("abcde", 3).is_err());
        assert!(validate_hex_digest("abcdeg", 3).is_err());
    }
}
