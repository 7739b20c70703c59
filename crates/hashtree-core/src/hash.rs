//! Hashing utilities using SHA256

use sha2::{Digest, Sha256};

use crate::types::{Cid, Hash};

/// Compute SHA256 hash of data
pub fn sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Verify that data matches expected hash
pub fn verify(hash: &Hash, data: &[u8]) -> bool {
    sha256(data) == *hash
}

/// Content identifier of a raw blob: its hash plus its size
pub fn cid(data: &[u8]) -> Cid {
    Cid::blob(sha256(data), data.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{to_hex, LinkType};

    #[test]
    fn test_sha256_empty() {
        let hash = sha256(&[]);
        assert_eq!(
            to_hex(&hash),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_sha256_hello_world() {
        let hash = sha256(b"hello world");
        assert_eq!(
            to_hex(&hash),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_verify() {
        let data = b"test data";
        let hash = sha256(data);
        assert!(verify(&hash, data));
        assert!(!verify(&hash, b"different data"));
    }

    #[test]
    fn test_cid_is_deterministic() {
        let a = cid(b"same bytes");
        let b = cid(b"same bytes");
        assert_eq!(a, b);
        assert_eq!(a.kind, LinkType::Blob);
        assert_eq!(a.size, 10);
        assert_ne!(a.hash, cid(b"other bytes").hash);
    }
}
