//! Contract of the external sampling engine.
//!
//! The chain runner is the only caller. An engine is started once per chain
//! and then pulled one iteration at a time, so the runner can stop between
//! iterations.

use crate::domain::{AdaptConfig, DataBinding, InitStrategy, IterationDiagnostics, SamplerArtifact};
use crate::runner::StopSignal;

/// Inputs for one engine invocation.
#[derive(Debug, Clone, Copy)]
pub struct EngineRequest<'a> {
    pub chain_id: usize,
    pub data: &'a DataBinding,
    pub seed: u64,
    pub num_warmup: usize,
    pub num_samples: usize,
    pub adapt: &'a AdaptConfig,
    pub init: &'a InitStrategy,
    /// Stop conditions of the calling runner. Sessions that block waiting
    /// on an external process keep a clone and give up with
    /// [`EngineErrorKind::Interrupted`] once it fires.
    pub stop: &'a StopSignal,
}

/// One iteration as reported by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineDraw {
    /// Values aligned with [`EngineSession::column_names`].
    pub values: Vec<f64>,
    pub diagnostics: IterationDiagnostics,
}

/// Coarse classification of engine failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    InvalidSeed,
    Crashed,
    ResourceExhausted,
    /// Recoverable-looking error the engine still could not get past.
    Runtime,
    /// The session observed its stop signal while waiting.
    Interrupted,
}

/// Engine-level error. Normalized into a `FailureReason` by the runner.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A sampling engine able to run compiled artifacts.
pub trait SamplingEngine: Send + Sync {
    /// Start a chain. Blocks until the engine is ready to yield draws.
    fn start(
        &self,
        artifact: &SamplerArtifact,
        request: &EngineRequest<'_>,
    ) -> Result<Box<dyn EngineSession>, EngineError>;
}

/// A running chain.
pub trait EngineSession: Send {
    /// Output columns, fixed for the life of the session.
    fn column_names(&self) -> &[String];

    /// Next iteration, `Ok(None)` once the engine has nothing more to yield.
    fn next_draw(&mut self) -> Result<Option<EngineDraw>, EngineError>;

    /// Step size after adaptation, once known.
    fn adapted_step_size(&self) -> Option<f64> {
        None
    }
}
