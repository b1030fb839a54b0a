//! Per-chain run configuration.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::artifact::SamplerArtifact;
use super::schema::DataBinding;
use crate::store::Digest;

/// NUTS adaptation settings handed to the engine. Defaults follow CmdStan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptConfig {
    pub engaged: bool,
    /// Target acceptance statistic.
    pub delta: f64,
    pub gamma: f64,
    pub kappa: f64,
    pub t0: f64,
    pub init_buffer: u32,
    pub term_buffer: u32,
    pub window: u32,
    pub max_treedepth: u32,
    /// Initial step size.
    pub stepsize: f64,
    pub stepsize_jitter: f64,
}

impl Default for AdaptConfig {
    fn default() -> Self {
        Self {
            engaged: true,
            delta: 0.8,
            gamma: 0.05,
            kappa: 0.75,
            t0: 10.0,
            init_buffer: 75,
            term_buffer: 50,
            window: 25,
            max_treedepth: 10,
            stepsize: 1.0,
            stepsize_jitter: 0.0,
        }
    }
}

/// How the engine initializes unconstrained parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InitStrategy {
    /// Uniform on `(-radius, radius)` in unconstrained space.
    Random { radius: f64 },
    Zero,
}

impl Default for InitStrategy {
    fn default() -> Self {
        InitStrategy::Random { radius: 2.0 }
    }
}

/// Everything one chain run needs. Immutable once the run starts.
#[derive(Debug, Clone)]
pub struct ChainSpec {
    /// Zero-based chain index; outcomes are ordered by it.
    pub chain_id: usize,
    pub artifact: Arc<SamplerArtifact>,
    pub data: Arc<DataBinding>,
    pub seed: u64,
    pub num_warmup: usize,
    pub num_samples: usize,
    /// Keep every `thin`-th iteration of each phase.
    pub thin: usize,
    pub adapt: AdaptConfig,
    pub init: InitStrategy,
}

impl ChainSpec {
    /// Total engine iterations for this chain.
    pub fn total_iterations(&self) -> usize {
        self.num_warmup + self.num_samples
    }

    /// Draws retained from a phase of `iterations` iterations.
    pub fn retained(&self, iterations: usize) -> usize {
        let thin = self.thin.max(1);
        iterations.div_ceil(thin)
    }

    /// Serializable record of this spec for provenance reports.
    pub fn provenance(&self) -> ChainProvenance {
        ChainProvenance {
            chain_id: self.chain_id,
            artifact_key: *self.artifact.key(),
            seed: self.seed,
            num_warmup: self.num_warmup,
            num_samples: self.num_samples,
            thin: self.thin,
            adapt: self.adapt.clone(),
            init: self.init.clone(),
        }
    }
}

/// Provenance view of a [`ChainSpec`], without the artifact payload or data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainProvenance {
    pub chain_id: usize,
    pub artifact_key: Digest,
    pub seed: u64,
    pub num_warmup: usize,
    pub num_samples: usize,
    pub thin: usize,
    pub adapt: AdaptConfig,
    pub init: InitStrategy,
}
