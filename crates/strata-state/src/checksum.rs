//! Content checksums for snapshot change detection.

use sha2::{Digest, Sha256};

/// Fingerprint of a unit's content.
///
/// The first eight bytes of the SHA-256 digest, little endian.
pub fn content_checksum(content: &[u8]) -> u64 {
    let digest = Sha256::digest(content);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_stable_and_content_sensitive() {
        let a = content_checksum(b"bundle-a v1");
        assert_eq!(a, content_checksum(b"bundle-a v1"));
        assert_ne!(a, content_checksum(b"bundle-a v2"));
    }
}
