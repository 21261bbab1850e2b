//! Digest algorithms available for payload hashing.
//!
//! The algorithm is resolved once from its configured name when the
//! [`PayloadStore`](crate::PayloadStore) is built, never at upload time.

use crate::error::{StorageError, StorageResult};
use sha2::digest::DynDigest;
use std::fmt;
use std::str::FromStr;

/// A supported payload digest algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    /// SHA-224.
    Sha224,
    /// SHA-256.
    Sha256,
    /// SHA-384.
    Sha384,
    /// SHA-512.
    Sha512,
}

impl HashAlgorithm {
    /// All supported algorithms.
    pub const ALL: [HashAlgorithm; 4] = [
        HashAlgorithm::Sha224,
        HashAlgorithm::Sha256,
        HashAlgorithm::Sha384,
        HashAlgorithm::Sha512,
    ];

    /// Returns the configuration name of the algorithm.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Sha224 => "sha224",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    /// Creates a fresh incremental hasher.
    #[must_use]
    pub fn hasher(self) -> PayloadHasher {
        let inner: Box<dyn DynDigest + Send> = match self {
            HashAlgorithm::Sha224 => Box::new(sha2::Sha224::default()),
            HashAlgorithm::Sha256 => Box::new(sha2::Sha256::default()),
            HashAlgorithm::Sha384 => Box::new(sha2::Sha384::default()),
            HashAlgorithm::Sha512 => Box::new(sha2::Sha512::default()),
        };
        PayloadHasher {
            algorithm: self,
            inner,
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = StorageError;

    fn from_str(s: &str) -> StorageResult<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "");
        Self::ALL
            .into_iter()
            .find(|alg| alg.name() == normalized)
            .ok_or_else(|| StorageError::UnknownHashAlgorithm(s.to_string()))
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Incremental digest over an uploaded byte stream.
pub struct PayloadHasher {
    algorithm: HashAlgorithm,
    inner: Box<dyn DynDigest + Send>,
}

impl PayloadHasher {
    /// Feeds more bytes into the digest.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finishes the digest and renders it as `algorithm:hex`.
    #[must_use]
    pub fn finish(self) -> String {
        let digest = self.inner.finalize();
        format!("{}:{}", self.algorithm, hex::encode(digest))
    }
}

impl fmt::Debug for PayloadHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadHasher")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_names() {
        assert_eq!("sha256".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha256);
        assert_eq!("SHA-512".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha512);
        assert!(matches!(
            "md4".parse::<HashAlgorithm>(),
            Err(StorageError::UnknownHashAlgorithm(_))
        ));
    }

    #[test]
    fn sha256_known_vector() {
        let mut hasher = HashAlgorithm::Sha256.hasher();
        hasher.update(b"ab");
        hasher.update(b"c");
        assert_eq!(
            hasher.finish(),
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
