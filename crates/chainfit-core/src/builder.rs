//! Model builder: turns a [`ModelSpec`] into a stored [`SamplerArtifact`]
//! by way of an external toolchain.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::instrument;

use crate::domain::{BuildError, ModelSpec, SamplerArtifact};
use crate::metrics::METRICS;
use crate::obs;
use crate::store::ArtifactStore;

/// Output of a successful compile.
#[derive(Debug, Clone)]
pub struct CompiledModel {
    /// Loadable sampler bytes (an executable for CmdStan).
    pub payload: Vec<u8>,
    /// Toolchain output worth keeping, e.g. compiler warnings.
    pub log: String,
}

/// Modeling-language compiler and linker.
#[async_trait]
pub trait ModelToolchain: Send + Sync {
    /// Version of the sampling engine the toolchain targets.
    fn engine_version(&self) -> &str;

    /// Platform triple artifacts are built for.
    fn target_triple(&self) -> &str;

    /// Compile `spec` using `workdir` as scratch space.
    async fn compile(&self, spec: &ModelSpec, workdir: &Path) -> Result<CompiledModel, BuildError>;
}

/// `<arch>-<os>` of the running process.
pub fn host_triple() -> String {
    format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS)
}

/// Builds artifacts and writes them to the store.
pub struct ModelBuilder {
    toolchain: Arc<dyn ModelToolchain>,
    store: Arc<dyn ArtifactStore>,
    timeout: Option<Duration>,
}

impl ModelBuilder {
    pub fn new(toolchain: Arc<dyn ModelToolchain>, store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            toolchain,
            store,
            timeout: None,
        }
    }

    /// Bound the wall-clock time of a single compile.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn toolchain(&self) -> &Arc<dyn ModelToolchain> {
        &self.toolchain
    }

    /// Compile `spec` and persist the artifact.
    #[instrument(skip_all, fields(model = %spec.name()))]
    pub async fn build(&self, spec: &ModelSpec) -> Result<SamplerArtifact, BuildError> {
        spec.validate()?;

        let engine_version = self.toolchain.engine_version().to_string();
        let target = self.toolchain.target_triple().to_string();
        let key = spec.artifact_key(&engine_version, &target);
        obs::emit_build_started(spec.name(), &key);

        let start = Instant::now();
        let workdir = tempfile::Builder::new().prefix("chainfit-build-").tempdir()?;
        let compile = self.toolchain.compile(spec, workdir.path());
        let compiled = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, compile)
                .await
                .map_err(|_| BuildError::TimedOut(limit))?,
            None => compile.await,
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        let compiled = match compiled {
            Ok(compiled) => compiled,
            Err(err) => {
                obs::emit_build_finished(spec.name(), &key, duration_ms, false);
                return Err(err);
            }
        };
        if !compiled.log.trim().is_empty() {
            tracing::debug!(model = %spec.name(), log = %compiled.log, "toolchain output");
        }

        let artifact = SamplerArtifact::new(spec, &engine_version, &target, compiled.payload);
        self.store.put(&artifact)?;
        METRICS.inc_builds();
        obs::emit_build_finished(spec.name(), &key, duration_ms, true);
        Ok(artifact)
    }
}
