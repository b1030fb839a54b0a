//! Compiled sampler artifacts and their manifests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::model_spec::ModelSpec;
use super::schema::{ParamDecl, VarDecl};
use crate::store::{Digest, StoreError};

/// Metadata persisted next to an artifact payload. Records the schema used
/// to validate future data bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub key: Digest,
    pub model_name: String,
    pub engine_version: String,
    pub target_triple: String,
    pub payload_digest: Digest,
    pub payload_len: u64,
    pub data_schema: Vec<VarDecl>,
    pub param_schema: Vec<ParamDecl>,
    pub created_at: DateTime<Utc>,
}

/// An opaque compiled sampler. Read-only once built; shared between chain
/// runners behind an `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerArtifact {
    manifest: ArtifactManifest,
    payload: Vec<u8>,
}

impl SamplerArtifact {
    /// Wrap freshly compiled `payload` for `spec`.
    pub fn new(
        spec: &ModelSpec,
        engine_version: &str,
        target_triple: &str,
        payload: Vec<u8>,
    ) -> Self {
        let manifest = ArtifactManifest {
            key: spec.artifact_key(engine_version, target_triple),
            model_name: spec.name().to_string(),
            engine_version: engine_version.to_string(),
            target_triple: target_triple.to_string(),
            payload_digest: Digest::compute(&payload),
            payload_len: payload.len() as u64,
            data_schema: spec.data_schema().to_vec(),
            param_schema: spec.param_schema().to_vec(),
            created_at: Utc::now(),
        };
        Self { manifest, payload }
    }

    /// Reassemble an artifact read back from a store, verifying it against
    /// the key it was requested under.
    pub fn from_parts(
        expected_key: &Digest,
        manifest: ArtifactManifest,
        payload: Vec<u8>,
    ) -> Result<Self, StoreError> {
        let artifact = Self { manifest, payload };
        artifact.verify(expected_key)?;
        Ok(artifact)
    }

    /// Check that the manifest belongs to `expected_key` and that the payload
    /// still hashes to the recorded digest.
    pub fn verify(&self, expected_key: &Digest) -> Result<(), StoreError> {
        if self.manifest.key != *expected_key {
            return Err(StoreError::Corrupt {
                key: *expected_key,
                reason: format!("manifest is keyed {}", self.manifest.key),
            });
        }
        if self.payload.len() as u64 != self.manifest.payload_len {
            return Err(StoreError::Corrupt {
                key: *expected_key,
                reason: format!(
                    "payload is {} bytes, manifest records {}",
                    self.payload.len(),
                    self.manifest.payload_len
                ),
            });
        }
        if Digest::compute(&self.payload) != self.manifest.payload_digest {
            return Err(StoreError::Corrupt {
                key: *expected_key,
                reason: "payload digest mismatch".to_string(),
            });
        }
        Ok(())
    }

    pub fn key(&self) -> &Digest {
        &self.manifest.key
    }

    pub fn manifest(&self) -> &ArtifactManifest {
        &self.manifest
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn data_schema(&self) -> &[VarDecl] {
        &self.manifest.data_schema
    }

    pub fn param_schema(&self) -> &[ParamDecl] {
        &self.manifest.param_schema
    }
}
