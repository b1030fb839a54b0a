//! Per-chain results: draws, per-iteration sampler diagnostics, failures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::DataBindingError;

/// Sampler-level diagnostics reported by the engine for one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IterationDiagnostics {
    /// Log density up to a constant (`lp__`).
    pub lp: f64,
    pub accept_stat: f64,
    pub step_size: f64,
    pub tree_depth: u32,
    pub n_leapfrog: u32,
    pub divergent: bool,
    /// Hamiltonian energy (`energy__`).
    pub energy: f64,
}

/// Draws from one successful chain, split by phase.
///
/// Each row is aligned with `columns`. Warmup rows are kept but never
/// contribute to inference unless explicitly requested.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainDraws {
    pub chain_id: usize,
    pub columns: Vec<String>,
    pub warmup: Vec<Vec<f64>>,
    pub sampling: Vec<Vec<f64>>,
    pub warmup_diagnostics: Vec<IterationDiagnostics>,
    pub sampling_diagnostics: Vec<IterationDiagnostics>,
    /// Step size after adaptation, if the engine reports one.
    pub step_size: Option<f64>,
    pub warmup_elapsed: Duration,
    pub sampling_elapsed: Duration,
}

impl ChainDraws {
    pub fn new(chain_id: usize, columns: Vec<String>) -> Self {
        Self {
            chain_id,
            columns,
            warmup: Vec::new(),
            sampling: Vec::new(),
            warmup_diagnostics: Vec::new(),
            sampling_diagnostics: Vec::new(),
            step_size: None,
            warmup_elapsed: Duration::ZERO,
            sampling_elapsed: Duration::ZERO,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.warmup.is_empty() && self.sampling.is_empty()
    }

    /// Number of divergent transitions after warmup.
    pub fn divergences(&self) -> usize {
        self.sampling_diagnostics
            .iter()
            .filter(|d| d.divergent)
            .count()
    }
}

/// Why a chain failed. Engine-specific errors are normalized into this at
/// the runner boundary.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FailureReason {
    #[error("data binding rejected: {0}")]
    DataBinding(DataBindingError),

    #[error("invalid seed: {0}")]
    InvalidSeed(String),

    #[error("engine crashed: {0}")]
    EngineCrash(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("engine error at iteration {iteration}: {message}")]
    EngineError { iteration: usize, message: String },

    #[error("engine stopped after {produced} of {expected} iterations")]
    EndedEarly { produced: usize, expected: usize },

    #[error("engine output is missing declared columns: {missing:?}")]
    OutputSchema { missing: Vec<String> },

    #[error("cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("chain worker panicked: {0}")]
    Panicked(String),
}

/// A chain that produced no usable result.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("chain {chain_id} failed: {reason}")]
pub struct ChainFailure {
    pub chain_id: usize,
    pub reason: FailureReason,
    /// Draws collected before the failure, if any.
    pub partial: Option<ChainDraws>,
}

/// Outcome of exactly one chain run.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainOutcome {
    Success(ChainDraws),
    Failure(ChainFailure),
}

impl ChainOutcome {
    pub fn failure(chain_id: usize, reason: FailureReason, partial: Option<ChainDraws>) -> Self {
        ChainOutcome::Failure(ChainFailure {
            chain_id,
            reason,
            partial: partial.filter(|p| !p.is_empty()),
        })
    }

    pub fn chain_id(&self) -> usize {
        match self {
            ChainOutcome::Success(draws) => draws.chain_id,
            ChainOutcome::Failure(failure) => failure.chain_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ChainOutcome::Success(_))
    }

    pub fn as_success(&self) -> Option<&ChainDraws> {
        match self {
            ChainOutcome::Success(draws) => Some(draws),
            ChainOutcome::Failure(_) => None,
        }
    }

    pub fn as_failure(&self) -> Option<&ChainFailure> {
        match self {
            ChainOutcome::Success(_) => None,
            ChainOutcome::Failure(failure) => Some(failure),
        }
    }
}
