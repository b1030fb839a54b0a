//! CmdStan adapters for chainfit
//!
//! [`CmdStanToolchain`] compiles Stan programs with CmdStan's makefile and
//! [`CmdStanEngine`] runs the resulting executables, streaming draws out of
//! the Stan CSV they write.

pub mod csv;
pub mod engine;
pub mod error;
pub mod stanc;
pub mod toolchain;

pub use csv::{parse_stan_csv, StanCsv};
pub use engine::{CmdStanEngine, CmdStanEngineConfig};
pub use error::{CmdStanError, Result};
pub use stanc::parse_diagnostics;
pub use toolchain::{CmdStanConfig, CmdStanToolchain, CMDSTAN_ENV};
