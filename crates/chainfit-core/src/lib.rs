//! chainfit core library
//!
//! Compiles Stan models once into content-addressed sampler artifacts, runs
//! independent chains concurrently, and merges their draws into a
//! [`FitResult`] with split R-hat, effective sample size and HMC checks.
//!
//! The external compiler and sampler sit behind [`ModelToolchain`] and
//! [`SamplingEngine`]; `chainfit-cmdstan` implements both for CmdStan, and
//! [`fakes`] provides in-process versions for tests.

pub mod builder;
pub mod cache;
pub mod config;
pub mod diagnostics;
pub mod domain;
pub mod draws;
pub mod engine;
pub mod fakes;
pub mod fit;
pub mod merge;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod pipeline;
pub mod reporting;
pub mod runner;
pub mod store;
pub mod telemetry;

pub use builder::{host_triple, CompiledModel, ModelBuilder, ModelToolchain};
pub use cache::{ArtifactCache, CacheStats};
pub use config::{CacheConfig, ConfigError, FitConfig};
pub use diagnostics::{Diagnostics, HmcCheckReport, SamplerTrace, Summary, SummaryRow};
pub use domain::{
    AdaptConfig, ArtifactManifest, BuildError, ChainDraws, ChainFailure, ChainOutcome,
    ChainProvenance, ChainSpec, CompilerDiagnostic, DataBinding, DataBindingError, Dim, ElemType,
    FailureReason, FitError, InitStrategy, IterationDiagnostics, ModelSpec, ParamDecl,
    SamplerArtifact, VarDecl,
};
pub use draws::{DrawTable, Extraction, ParamDraws};
pub use engine::{
    EngineDraw, EngineError, EngineErrorKind, EngineRequest, EngineSession, SamplingEngine,
};
pub use fit::{ExtractOptions, FitResult};
pub use merge::{merge, MergeOptions};
pub use metrics::METRICS;
pub use orchestrator::{CancelHandle, ChainOrchestrator, OrchestratorConfig};
pub use pipeline::FitPipeline;
pub use reporting::{render_summary_table, write_summary_json, FitReport};
pub use runner::{ChainRunner, StopSignal};
pub use store::fs::FsArtifactStore;
pub use store::memory::MemoryArtifactStore;
pub use store::{ArtifactStore, Digest, StoreError};
pub use telemetry::init_tracing;

/// chainfit version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
