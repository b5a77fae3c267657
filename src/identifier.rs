//! Blob identifiers and content hashing
//!
//! A blob identifier is the lowercase hex digest of the payload bytes. The
//! first two characters name the shard directory the blob lives in.

use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Length of a shard directory name
pub const SHARD_PREFIX_LEN: usize = 2;

/// Content hash function used to derive identifiers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Blake3,
}

impl HashAlgorithm {
    /// Number of hex characters in a digest produced by this algorithm
    pub fn hex_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 64,
            HashAlgorithm::Blake3 => blake3::OUT_LEN * 2,
        }
    }

    /// Start an incremental hash
    pub fn hasher(&self) -> ContentHasher {
        match self {
            HashAlgorithm::Sha256 => ContentHasher::Sha256(Sha256::new()),
            HashAlgorithm::Blake3 => ContentHasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    /// Hash a complete payload in one call
    pub fn digest(&self, data: &[u8]) -> BlobId {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Blake3 => "blake3",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "blake3" => Ok(HashAlgorithm::Blake3),
            other => Err(StorageError::Config(format!(
                "unknown hash algorithm {:?} (expected sha256 or blake3)",
                other
            ))),
        }
    }
}

/// Incremental content hasher fed chunk by chunk while an upload streams in
pub enum ContentHasher {
    Sha256(Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl ContentHasher {
    pub fn update(&mut self, chunk: &[u8]) {
        match self {
            ContentHasher::Sha256(h) => h.update(chunk),
            ContentHasher::Blake3(h) => {
                h.update(chunk);
            }
        }
    }

    pub fn finalize(self) -> BlobId {
        let hex = match self {
            ContentHasher::Sha256(h) => hex::encode(h.finalize()),
            ContentHasher::Blake3(h) => h.finalize().to_hex().to_string(),
        };
        BlobId(hex)
    }
}

/// A validated blob identifier
///
/// Only ever holds `[0-9a-f]` characters of the configured digest length, so
/// it is safe to join onto filesystem paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobId(String);

impl BlobId {
    /// Parse an externally supplied identifier.
    ///
    /// Rejects anything that can never be produced by `algorithm`: wrong
    /// length, uppercase, path separators, dots, non-ASCII.
    pub fn parse(raw: &str, algorithm: HashAlgorithm) -> Result<Self, StorageError> {
        let valid = raw.len() == algorithm.hex_len()
            && raw.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));

        if !valid {
            return Err(StorageError::InvalidIdentifier(raw.to_string()));
        }

        Ok(BlobId(raw.to_string()))
    }

    /// Shard directory name (first two hex characters)
    pub fn shard(&self) -> &str {
        &self.0[..SHARD_PREFIX_LEN]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
