//! The immutable result of a fit.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::diagnostics::{Diagnostics, HmcCheckReport, SamplerTrace, Summary};
use crate::domain::{ChainFailure, ChainProvenance, ChainSpec};
use crate::draws::{group_by_param, DrawTable, Extraction, ParamDraws};
use crate::store::Digest;

/// How [`FitResult::extract_with`] lays out draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractOptions {
    /// Pool chains into one vector per column, in merge-time permuted order.
    pub permuted: bool,
    /// Prepend warmup draws to each chain. Ignored when `permuted` is set.
    pub include_warmup: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            permuted: true,
            include_warmup: false,
        }
    }
}

/// Draws, diagnostics and provenance of one fit. Read-only.
#[derive(Debug, Clone)]
pub struct FitResult {
    pub(crate) fit_id: Uuid,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) model_name: String,
    pub(crate) artifact_key: Digest,
    pub(crate) draws: DrawTable,
    pub(crate) warmup: DrawTable,
    pub(crate) traces: Vec<SamplerTrace>,
    pub(crate) diagnostics: Diagnostics,
    pub(crate) summary: Summary,
    pub(crate) specs: Vec<ChainSpec>,
    pub(crate) failures: Vec<ChainFailure>,
    pub(crate) permutation: Vec<usize>,
    pub(crate) permutation_seed: u64,
}

impl FitResult {
    pub fn fit_id(&self) -> Uuid {
        self.fit_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn artifact_key(&self) -> &Digest {
        &self.artifact_key
    }

    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Failed chains, ascending by chain id.
    pub fn failures(&self) -> &[ChainFailure] {
        &self.failures
    }

    /// Specs of every chain launched, successful or not.
    pub fn chain_specs(&self) -> &[ChainSpec] {
        &self.specs
    }

    pub fn provenance(&self) -> Vec<ChainProvenance> {
        self.specs.iter().map(ChainSpec::provenance).collect()
    }

    /// Post-warmup draws of the successful chains.
    pub fn draws(&self) -> &DrawTable {
        &self.draws
    }

    /// Retained warmup draws, same chains and columns as [`Self::draws`].
    pub fn warmup_draws(&self) -> &DrawTable {
        &self.warmup
    }

    pub fn sampler_traces(&self) -> &[SamplerTrace] {
        &self.traces
    }

    /// Seed of the permutation used by permuted extraction.
    pub fn permutation_seed(&self) -> u64 {
        self.permutation_seed
    }

    pub fn extract(&self, permuted: bool) -> Extraction {
        self.extract_with(ExtractOptions {
            permuted,
            include_warmup: false,
        })
    }

    pub fn extract_with(&self, options: ExtractOptions) -> Extraction {
        let columns = self.draws.columns().iter().enumerate();
        if options.permuted {
            let draws = columns
                .map(|(col, name)| {
                    let pooled = self.draws.pooled(col);
                    let shuffled = self.permutation.iter().map(|&i| pooled[i]).collect();
                    (name.clone(), shuffled)
                })
                .collect();
            return Extraction::Permuted { draws };
        }

        let draws: BTreeMap<String, Vec<Vec<f64>>> = columns
            .map(|(col, name)| {
                let sampling = self.draws.column_by_chain(col);
                let chains = if options.include_warmup {
                    self.warmup
                        .column_by_chain(col)
                        .into_iter()
                        .zip(sampling)
                        .map(|(mut warm, post)| {
                            warm.extend(post);
                            warm
                        })
                        .collect()
                } else {
                    sampling
                };
                (name.clone(), chains)
            })
            .collect();
        Extraction::ByChain {
            chain_ids: self.draws.chain_ids().to_vec(),
            draws,
        }
    }

    /// Permuted draws grouped by parameter name, e.g. `theta` as
    /// `draws × J`. Rows line up with [`Self::extract`]`(true)`.
    pub fn extract_params(&self) -> BTreeMap<String, ParamDraws> {
        let pooled: Vec<Vec<f64>> = (0..self.draws.columns().len())
            .map(|col| {
                let pooled = self.draws.pooled(col);
                self.permutation.iter().map(|&i| pooled[i]).collect()
            })
            .collect();
        group_by_param(self.draws.columns(), &pooled)
    }

    /// Run the standard HMC checks over this fit.
    pub fn check_hmc(&self) -> HmcCheckReport {
        HmcCheckReport::from_diagnostics(&self.diagnostics)
    }
}
