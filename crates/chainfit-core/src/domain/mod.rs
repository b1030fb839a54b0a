//! Domain models for chainfit.
//!
//! Canonical definitions for the core entities:
//! - `ModelSpec`: immutable model source plus declared schemas
//! - `SamplerArtifact`: compiled sampler keyed by model identity
//! - `ChainSpec`: configuration of one chain run
//! - `ChainOutcome`: draws or a structured failure, once per chain

pub mod artifact;
pub mod chain_spec;
pub mod error;
pub mod model_spec;
pub mod outcome;
pub mod schema;

pub use artifact::{ArtifactManifest, SamplerArtifact};
pub use chain_spec::{AdaptConfig, ChainProvenance, ChainSpec, InitStrategy};
pub use error::{BuildError, CompilerDiagnostic, DataBindingError, FitError, Result};
pub use model_spec::ModelSpec;
pub use outcome::{ChainDraws, ChainFailure, ChainOutcome, FailureReason, IterationDiagnostics};
pub use schema::{
    base_name, flatten_columns, validate_data, DataBinding, Dim, ElemType, ParamDecl, VarDecl,
};
