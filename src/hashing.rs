//! Uniform interface over the SHA-2 family for buffers and file streams.
//!
//! Both anti-tampering modes speak hex: the stored artifact is always the
//! lowercase hex of the digest, fixed-width per algorithm, so a hash file
//! can be indexed by `block * hex_width`.

use serde::Deserialize;
use sha2::{Digest, Sha256, Sha512};
use strum::{Display, EnumString};
use subtle::ConstantTimeEq;

/// Digest algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Digest length in bytes.
    #[must_use]
    pub const fn digest_size(self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }

    /// Width of one hex-encoded digest, in bytes.
    #[must_use]
    pub const fn hex_width(self) -> usize {
        self.digest_size() * 2
    }

    /// One-shot digest of a buffer.
    #[must_use]
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    /// One-shot digest of a buffer, hex-encoded lowercase.
    #[must_use]
    pub fn digest_hex(self, data: &[u8]) -> String {
        hex::encode(self.digest(data))
    }

    /// Starts an incremental hash for streaming a file through.
    #[must_use]
    pub fn hasher(self) -> StreamHasher {
        match self {
            Self::Sha256 => StreamHasher::Sha256(Sha256::new()),
            Self::Sha512 => StreamHasher::Sha512(Sha512::new()),
        }
    }
}

/// Incremental hasher over either algorithm.
pub enum StreamHasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl StreamHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    /// Consumes the hasher and returns the lowercase hex digest.
    #[must_use]
    pub fn finalize_hex(self) -> String {
        match self {
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// Constant-time equality of two hex digests.
///
/// Width mismatches compare unequal without inspecting content.
#[must_use]
pub fn hex_digests_match(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            HashAlgorithm::Sha256.digest_hex(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_stream_matches_oneshot() {
        for alg in [HashAlgorithm::Sha256, HashAlgorithm::Sha512] {
            let mut hasher = alg.hasher();
            hasher.update(b"hel");
            hasher.update(b"lo");
            assert_eq!(hasher.finalize_hex(), alg.digest_hex(b"hello"));
        }
    }

    #[test]
    fn test_hex_width() {
        assert_eq!(HashAlgorithm::Sha256.hex_width(), 64);
        assert_eq!(HashAlgorithm::Sha512.hex_width(), 128);
        let hex = HashAlgorithm::Sha512.digest_hex(b"x");
        assert_eq!(hex.len(), HashAlgorithm::Sha512.hex_width());
    }

    #[test]
    fn test_digest_comparison() {
        let a = HashAlgorithm::Sha256.digest_hex(b"a");
        let b = HashAlgorithm::Sha256.digest_hex(b"b");
        assert!(hex_digests_match(&a, &a));
        assert!(!hex_digests_match(&a, &b));
        assert!(!hex_digests_match(&a, &a[..32]));
    }
}
