//! Error taxonomy for model building, data binding, and fitting.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::outcome::ChainFailure;
use super::schema::ElemType;
use crate::store::StoreError;

/// One diagnostic reported by the modeling-language compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerDiagnostic {
    pub message: String,
    pub line: Option<usize>,
    pub column: Option<usize>,
    /// Offending source construct, when the toolchain identifies one.
    pub construct: Option<String>,
}

impl fmt::Display for CompilerDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(col)) => write!(f, "line {line}, column {col}: ")?,
            (Some(line), None) => write!(f, "line {line}: ")?,
            _ => {}
        }
        f.write_str(&self.message)?;
        if let Some(construct) = &self.construct {
            write!(f, " (at `{construct}`)")?;
        }
        Ok(())
    }
}

fn render_diagnostics(diagnostics: &[CompilerDiagnostic]) -> String {
    diagnostics
        .iter()
        .map(|d| format!("  {d}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Errors from compiling a model into a sampler artifact.
///
/// Compile failures are deterministic and are never retried. The type is
/// `Clone` so one failed build can be handed to every caller waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BuildError {
    #[error("model '{model}' failed to compile:\n{}", render_diagnostics(.diagnostics))]
    Compile {
        model: String,
        diagnostics: Vec<CompilerDiagnostic>,
        /// Raw toolchain output.
        output: String,
    },

    #[error("invalid model spec: {0}")]
    InvalidModelSpec(String),

    #[error("toolchain unavailable: {0}")]
    ToolchainUnavailable(String),

    #[error("toolchain timed out after {0:?}")]
    TimedOut(Duration),

    #[error("artifact store error: {0}")]
    Store(Arc<StoreError>),

    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<StoreError> for BuildError {
    fn from(err: StoreError) -> Self {
        BuildError::Store(Arc::new(err))
    }
}

impl From<std::io::Error> for BuildError {
    fn from(err: std::io::Error) -> Self {
        BuildError::Io(Arc::new(err))
    }
}

/// Caller-supplied data does not match the declared data schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DataBindingError {
    #[error("missing required data variable '{name}'")]
    MissingKey { name: String },

    #[error("data variable '{name}' expected {expected}, found {found}")]
    WrongType {
        name: String,
        expected: ElemType,
        found: String,
    },

    #[error("data variable '{name}' expected shape {expected:?}, found {found}")]
    WrongShape {
        name: String,
        expected: Vec<usize>,
        found: String,
    },

    #[error("dimension '{dim}' of '{name}' does not resolve to a non-negative integer")]
    UnresolvedDim { name: String, dim: String },
}

/// Errors surfaced by the fit pipeline and the draw merger.
#[derive(Debug, thiserror::Error)]
pub enum FitError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("data binding error: {0}")]
    DataBinding(#[from] DataBindingError),

    #[error("all {} chains failed", .failures.len())]
    NoSuccessfulChains { failures: Vec<ChainFailure> },

    #[error("schema mismatch across chains: {0}")]
    SchemaMismatch(String),

    #[error("invalid fit configuration: {0}")]
    Config(String),

    #[error("artifact store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for fit operations.
pub type Result<T> = std::result::Result<T, FitError>;
