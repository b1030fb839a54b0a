//! Convergence diagnostics computed from merged draws.
//!
//! - `rhat`: split R-hat
//! - `ess`: multi-chain effective sample size
//! - `summary`: per-column posterior summary
//! - `hmc`: divergence, tree depth, E-BFMI and convergence checks
//!
//! Everything here is a pure function of the draw table and the per-chain
//! sampler traces, so diagnostics are reproducible from a stored fit.

pub mod ess;
pub mod hmc;
pub mod rhat;
pub mod summary;

use serde::Serialize;

use crate::domain::IterationDiagnostics;
use crate::draws::DrawTable;

pub use ess::ess;
pub use hmc::{e_bfmi, HmcCheckReport};
pub use rhat::split_rhat;
pub use summary::{Summary, SummaryRow, LP_COLUMN, QUANTILES};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiagnosticsError {
    #[error("chain {chain} has {found} draws, expected {expected}")]
    UnequalLengths {
        chain: usize,
        expected: usize,
        found: usize,
    },
}

/// Sampler output of one chain after warmup, as needed by the checks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplerTrace {
    pub chain_id: usize,
    pub max_treedepth: u32,
    pub step_size: Option<f64>,
    pub iterations: Vec<IterationDiagnostics>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamDiagnostics {
    pub name: String,
    pub r_hat: f64,
    pub ess: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainSamplerStats {
    pub chain_id: usize,
    pub draws: usize,
    pub divergences: usize,
    pub treedepth_hits: usize,
    pub mean_accept_stat: f64,
    pub e_bfmi: f64,
    pub step_size: Option<f64>,
}

impl ChainSamplerStats {
    fn from_trace(trace: &SamplerTrace) -> Self {
        let iterations = &trace.iterations;
        let accept: Vec<f64> = iterations.iter().map(|d| d.accept_stat).collect();
        let energy: Vec<f64> = iterations.iter().map(|d| d.energy).collect();
        Self {
            chain_id: trace.chain_id,
            draws: iterations.len(),
            divergences: iterations.iter().filter(|d| d.divergent).count(),
            treedepth_hits: iterations
                .iter()
                .filter(|d| d.tree_depth >= trace.max_treedepth)
                .count(),
            mean_accept_stat: mean(&accept),
            e_bfmi: e_bfmi(&energy),
            step_size: trace.step_size,
        }
    }
}

/// Per-parameter and per-chain diagnostics of a fit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostics {
    pub params: Vec<ParamDiagnostics>,
    pub chains: Vec<ChainSamplerStats>,
}

impl Diagnostics {
    pub fn compute(table: &DrawTable, traces: &[SamplerTrace]) -> Result<Self, DiagnosticsError> {
        let params = table
            .columns()
            .iter()
            .enumerate()
            .map(|(col, name)| {
                let chains = table.column_by_chain(col);
                Ok(ParamDiagnostics {
                    name: name.clone(),
                    r_hat: split_rhat(&chains)?,
                    ess: ess(&chains)?,
                })
            })
            .collect::<Result<Vec<_>, DiagnosticsError>>()?;
        let chains = traces.iter().map(ChainSamplerStats::from_trace).collect();
        Ok(Self { params, chains })
    }

    pub fn param(&self, name: &str) -> Option<&ParamDiagnostics> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Divergent transitions after warmup, all chains.
    pub fn divergences(&self) -> usize {
        self.chains.iter().map(|c| c.divergences).sum()
    }

    pub fn treedepth_hits(&self) -> usize {
        self.chains.iter().map(|c| c.treedepth_hits).sum()
    }
}

/// Summary rows for every column of `table` followed by `lp__`.
pub fn summarize(table: &DrawTable, traces: &[SamplerTrace]) -> Result<Summary, DiagnosticsError> {
    let mut rows = Vec::with_capacity(table.columns().len() + 1);
    for (col, name) in table.columns().iter().enumerate() {
        rows.push(SummaryRow::from_chains(name, &table.column_by_chain(col))?);
    }
    let lp: Vec<Vec<f64>> = traces
        .iter()
        .map(|t| t.iterations.iter().map(|d| d.lp).collect())
        .collect();
    rows.push(SummaryRow::from_chains(LP_COLUMN, &lp)?);
    Ok(Summary {
        chains: table.num_chains(),
        draws_per_chain: table.num_iterations(),
        rows,
    })
}

/// Common length of `chains`, or the first chain that differs.
pub(crate) fn check_lengths(chains: &[Vec<f64>]) -> Result<usize, DiagnosticsError> {
    let expected = chains.first().map_or(0, Vec::len);
    match chains.iter().position(|c| c.len() != expected) {
        Some(chain) => Err(DiagnosticsError::UnequalLengths {
            chain,
            expected,
            found: chains[chain].len(),
        }),
        None => Ok(expected),
    }
}

pub(crate) fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return f64::NAN;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Unbiased (divide by `n - 1`) variance; `NaN` below two values.
pub(crate) fn sample_variance(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return f64::NAN;
    }
    let m = mean(xs);
    xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diag(tree_depth: u32, divergent: bool, energy: f64) -> IterationDiagnostics {
        IterationDiagnostics {
            lp: -energy,
            accept_stat: 0.9,
            step_size: 0.5,
            tree_depth,
            n_leapfrog: 7,
            divergent,
            energy,
        }
    }

    #[test]
    fn chain_stats_count_divergences_and_saturation() {
        let trace = SamplerTrace {
            chain_id: 2,
            max_treedepth: 10,
            step_size: Some(0.5),
            iterations: vec![
                diag(3, false, 1.0),
                diag(10, false, 3.0),
                diag(4, true, 0.5),
                diag(11, true, 2.0),
            ],
        };
        let stats = ChainSamplerStats::from_trace(&trace);
        assert_eq!(stats.divergences, 2);
        assert_eq!(stats.treedepth_hits, 2);
        assert_eq!(stats.mean_accept_stat, 0.9);
        assert!(stats.e_bfmi.is_finite());
    }

    #[test]
    fn single_chain_variance_has_no_between_term() {
        // sample_variance of one mean is NaN and must not leak into ESS.
        let chain: Vec<f64> = (0..40).map(|i| ((i * 7) % 11) as f64).collect();
        assert!(ess(&[chain]).unwrap().is_finite());
    }
}
