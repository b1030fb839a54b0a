pub mod fs;
pub mod memory;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as Sha2Digest, Sha256};
use thiserror::Error;

use crate::domain::artifact::SamplerArtifact;

/// SHA-256 digest used as a content address for artifacts and payloads.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Compute the SHA-256 digest of `data`.
    pub fn compute(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hash);
        Self(bytes)
    }

    /// Digest of several fields, each length-prefixed so that field
    /// boundaries cannot be shifted to produce a colliding concatenation.
    pub fn compute_fields<'a>(fields: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = Sha256::new();
        for field in fields {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field);
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hasher.finalize());
        Self(bytes)
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex-encoded string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex chars, for log lines.
    pub fn short(&self) -> String {
        self.to_hex().chars().take(12).collect()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}

impl FromStr for Digest {
    type Err = StoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| StoreError::InvalidDigest(s.to_string()))?;
        if bytes.len() != 32 {
            return Err(StoreError::InvalidDigest(s.to_string()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        hex.parse().map_err(serde::de::Error::custom)
    }
}

/// Errors from artifact store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact not found: {0}")]
    NotFound(Digest),

    /// The entry exists but cannot be trusted: unreadable manifest, missing
    /// payload, or a digest that no longer matches.
    #[error("artifact {key} is corrupt: {reason}")]
    Corrupt { key: Digest, reason: String },

    #[error("invalid digest hex: {0}")]
    InvalidDigest(String),

    #[error("manifest serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Keyed artifact store. Values are the artifact payload plus its manifest.
pub trait ArtifactStore: Send + Sync {
    /// Persist `artifact` under its key. Idempotent: an existing entry for
    /// the same key is left untouched.
    fn put(&self, artifact: &SamplerArtifact) -> Result<()>;

    /// Load and verify the artifact stored under `key`.
    fn get(&self, key: &Digest) -> Result<SamplerArtifact>;

    /// Check whether an entry exists without reading the payload.
    fn exists(&self, key: &Digest) -> Result<bool>;

    /// Remove the entry for `key`. Removing a missing entry is not an error.
    fn remove(&self, key: &Digest) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_display_fromstr_roundtrip() {
        let d = Digest::compute(b"data { int J; }");
        let hex = d.to_string();
        assert_eq!(hex.len(), 64);
        let parsed: Digest = hex.parse().unwrap();
        assert_eq!(d, parsed);
    }

    #[test]
    fn digest_fromstr_invalid_hex() {
        assert!("not-valid-hex".parse::<Digest>().is_err());
    }

    #[test]
    fn digest_fromstr_wrong_length() {
        assert!("abcd".parse::<Digest>().is_err());
    }

    #[test]
    fn field_digest_is_boundary_sensitive() {
        let a = Digest::compute_fields([b"ab".as_slice(), b"c".as_slice()]);
        let b = Digest::compute_fields([b"a".as_slice(), b"bc".as_slice()]);
        assert_ne!(a, b);
    }

    #[test]
    fn digest_serializes_as_hex_string() {
        let d = Digest::compute(b"payload");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{}\"", d.to_hex()));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn field_digest_deterministic() {
        let a = Digest::compute_fields([b"model".as_slice(), b"2.33.1".as_slice()]);
        let b = Digest::compute_fields([b"model".as_slice(), b"2.33.1".as_slice()]);
        assert_eq!(a, b);
    }
}
