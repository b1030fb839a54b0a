use std::collections::HashMap;
use std::sync::Mutex;

use super::{ArtifactStore, Digest, Result, StoreError};
use crate::domain::artifact::{ArtifactManifest, SamplerArtifact};

/// In-memory artifact store backed by a `HashMap<key, (manifest, payload)>`.
///
/// Entries are stored as parts and verified on read, like the filesystem
/// store, so tests can corrupt them through [`MemoryArtifactStore::tamper`].
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    entries: Mutex<HashMap<Digest, (ArtifactManifest, Vec<u8>)>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite the stored payload for `key`, leaving the manifest as is.
    pub fn tamper(&self, key: &Digest, payload: Vec<u8>) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(key) {
            entry.1 = payload;
        }
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn put(&self, artifact: &SamplerArtifact) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        entries
            .entry(*artifact.key())
            .or_insert_with(|| (artifact.manifest().clone(), artifact.payload().to_vec()));
        Ok(())
    }

    fn get(&self, key: &Digest) -> Result<SamplerArtifact> {
        let (manifest, payload) = self
            .entries
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or(StoreError::NotFound(*key))?;
        SamplerArtifact::from_parts(key, manifest, payload)
    }

    fn exists(&self, key: &Digest) -> Result<bool> {
        Ok(self.entries.lock().unwrap().contains_key(key))
    }

    fn remove(&self, key: &Digest) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}
