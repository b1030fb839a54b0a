use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::{ArtifactStore, Digest, Result, StoreError};
use crate::domain::artifact::{ArtifactManifest, SamplerArtifact};

const MANIFEST_FILE: &str = "manifest.json";
const PAYLOAD_FILE: &str = "payload.bin";

/// Filesystem-backed artifact store with git-style 2-char sharding.
///
/// Layout: `<root>/artifacts/<first 2 hex chars>/<remaining hex chars>/{manifest.json,payload.bin}`.
/// The manifest is written last and marks the entry as committed.
pub struct FsArtifactStore {
    artifacts_dir: PathBuf,
}

impl FsArtifactStore {
    /// Create a new `FsArtifactStore` rooted at `root`. Creates `root/artifacts/` if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let artifacts_dir = root.as_ref().join("artifacts");
        fs::create_dir_all(&artifacts_dir)?;
        Ok(Self { artifacts_dir })
    }

    /// Directory holding the entry for `key`.
    pub fn entry_dir(&self, key: &Digest) -> PathBuf {
        let hex = key.to_hex();
        self.artifacts_dir.join(&hex[..2]).join(&hex[2..])
    }

    fn write_atomic(dir: &Path, name: &str, data: &[u8]) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(dir.join(name)).map_err(|e| e.error)?;
        Ok(())
    }

    fn corrupt(key: &Digest, reason: impl Into<String>) -> StoreError {
        StoreError::Corrupt {
            key: *key,
            reason: reason.into(),
        }
    }
}

impl ArtifactStore for FsArtifactStore {
    fn put(&self, artifact: &SamplerArtifact) -> Result<()> {
        let dir = self.entry_dir(artifact.key());
        if dir.join(MANIFEST_FILE).exists() {
            return Ok(());
        }
        fs::create_dir_all(&dir)?;

        Self::write_atomic(&dir, PAYLOAD_FILE, artifact.payload())?;
        let manifest = serde_json::to_vec_pretty(artifact.manifest())?;
        Self::write_atomic(&dir, MANIFEST_FILE, &manifest)?;
        Ok(())
    }

    fn get(&self, key: &Digest) -> Result<SamplerArtifact> {
        let dir = self.entry_dir(key);
        let manifest_bytes = match fs::read(dir.join(MANIFEST_FILE)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(*key))
            }
            Err(e) => return Err(StoreError::Io(e)),
        };
        let manifest: ArtifactManifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| Self::corrupt(key, format!("unreadable manifest: {e}")))?;
        let payload = match fs::read(dir.join(PAYLOAD_FILE)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Self::corrupt(key, "payload missing"))
            }
            Err(e) => return Err(StoreError::Io(e)),
        };
        SamplerArtifact::from_parts(key, manifest, payload)
    }

    fn exists(&self, key: &Digest) -> Result<bool> {
        Ok(self.entry_dir(key).join(MANIFEST_FILE).exists())
    }

    fn remove(&self, key: &Digest) -> Result<()> {
        match fs::remove_dir_all(self.entry_dir(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}
