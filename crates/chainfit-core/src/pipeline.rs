//! End-to-end fit: build or reuse the sampler, validate data, run chains,
//! merge.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, instrument};

use crate::cache::ArtifactCache;
use crate::config::FitConfig;
use crate::domain::{validate_data, DataBinding, FitError, ModelSpec, Result};
use crate::engine::SamplingEngine;
use crate::fit::FitResult;
use crate::merge::{merge, MergeOptions};
use crate::metrics::METRICS;
use crate::orchestrator::{CancelHandle, ChainOrchestrator};

/// Wires an artifact cache and a sampling engine into `fit`.
pub struct FitPipeline {
    cache: Arc<ArtifactCache>,
    engine: Arc<dyn SamplingEngine>,
}

impl FitPipeline {
    pub fn new(cache: Arc<ArtifactCache>, engine: Arc<dyn SamplingEngine>) -> Self {
        Self { cache, engine }
    }

    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    /// Fit `model` to `data`.
    pub async fn fit(
        &self,
        model: &ModelSpec,
        data: DataBinding,
        config: &FitConfig,
    ) -> Result<FitResult> {
        self.fit_with_cancel(model, data, config, CancelHandle::new())
            .await
    }

    /// Like [`Self::fit`], stopping every chain once `cancel` fires. Chains
    /// stopped this way are reported as failures; the fit still succeeds if
    /// any chain completed.
    #[instrument(skip_all, fields(model = %model.name(), chains = config.chains))]
    pub async fn fit_with_cancel(
        &self,
        model: &ModelSpec,
        data: DataBinding,
        config: &FitConfig,
        cancel: CancelHandle,
    ) -> Result<FitResult> {
        config
            .validate()
            .map_err(|e| FitError::Config(e.to_string()))?;
        let start = Instant::now();

        let artifact = self.cache.get_or_build(model).await?;
        validate_data(artifact.data_schema(), &data)?;

        let base_seed = config.seed.unwrap_or_else(|| {
            let seed = rand::random();
            info!(seed, "no seed configured, drew a random base seed");
            seed
        });
        let specs = config.chain_specs(&artifact, &Arc::new(data), base_seed);

        let orchestrator = ChainOrchestrator::new(Arc::clone(&self.engine), config.orchestrator())
            .with_cancel(cancel);
        let outcomes = orchestrator.run_all(specs.clone()).await;

        let fit = merge(
            specs,
            outcomes,
            &MergeOptions {
                permutation_seed: config.permutation_seed,
            },
        )?;
        info!(
            fit_id = %fit.fit_id(),
            failed_chains = fit.failures().len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "fit complete"
        );
        METRICS.flush();
        Ok(fit)
    }
}
