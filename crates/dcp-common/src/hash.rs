//! Digest utilities for document URIs

use sha1::{Digest, Sha1};

/// Compute the lowercase hex SHA-1 digest of a byte string.
pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Hash a document URI for indexed lookup.
///
/// The ingest-state table stores this next to the full URI; the column is
/// VARCHAR(40), which is exactly one SHA-1 digest in hex. Lookups go through
/// the hash index first and then compare the full URI, so collisions are
/// tolerated but must be rare.
pub fn uri_hash(uri: &str) -> String {
    sha1_hex(uri.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha1_hex_known_vector() {
        assert_eq!(sha1_hex(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_uri_hash_shape() {
        let h = uri_hash("http://example.com/doc/1");
        assert_eq!(h.len(), 40);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(h.chars().all(|c| !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_uri_hash_distinguishes_uris() {
        assert_ne!(uri_hash("http://a"), uri_hash("http://b"));
        assert_eq!(uri_hash("http://a"), uri_hash("http://a"));
    }
}
