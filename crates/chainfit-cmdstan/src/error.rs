//! Error types for the CmdStan adapters

use std::path::PathBuf;

use chainfit_core::{BuildError, EngineError, EngineErrorKind};
use thiserror::Error;

/// Errors raised while locating CmdStan or talking to its executables.
#[derive(Error, Debug)]
pub enum CmdStanError {
    /// No usable CmdStan installation
    #[error("CmdStan not found (set CMDSTAN or install under ~/.cmdstan): {0}")]
    NotFound(String),

    /// Installation present but its version could not be read
    #[error("could not determine CmdStan version from {0}")]
    UnknownVersion(PathBuf),

    /// Sampler output did not follow the Stan CSV layout
    #[error("malformed Stan CSV: {0}")]
    Csv(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while writing data files
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CmdStanError>;

impl From<CmdStanError> for BuildError {
    fn from(err: CmdStanError) -> Self {
        match err {
            CmdStanError::Io(io) => BuildError::from(io),
            other => BuildError::ToolchainUnavailable(other.to_string()),
        }
    }
}

impl From<CmdStanError> for EngineError {
    fn from(err: CmdStanError) -> Self {
        EngineError::new(EngineErrorKind::Crashed, err.to_string())
    }
}
