//! Merge per-chain outcomes into a [`FitResult`].

use chrono::Utc;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::diagnostics::{summarize, Diagnostics, DiagnosticsError, SamplerTrace};
use crate::domain::{AdaptConfig, ChainDraws, ChainOutcome, ChainSpec, FitError, Result};
use crate::draws::DrawTable;
use crate::fit::FitResult;
use crate::obs;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOptions {
    /// Seed of the pooled-draw permutation; drawn at random when unset.
    pub permutation_seed: Option<u64>,
}

impl From<DiagnosticsError> for FitError {
    fn from(err: DiagnosticsError) -> Self {
        FitError::SchemaMismatch(err.to_string())
    }
}

/// Combine `outcomes` of the chains described by `specs`.
///
/// Only successful chains contribute draws; failures are kept for
/// provenance. Fails with [`FitError::NoSuccessfulChains`] when nothing
/// succeeded and [`FitError::SchemaMismatch`] when the successful chains
/// disagree on columns or draw counts.
#[instrument(skip_all, fields(chains = outcomes.len()))]
pub fn merge(
    specs: Vec<ChainSpec>,
    outcomes: Vec<ChainOutcome>,
    options: &MergeOptions,
) -> Result<FitResult> {
    let mut successes: Vec<ChainDraws> = Vec::new();
    let mut failures = Vec::new();
    for outcome in outcomes {
        match outcome {
            ChainOutcome::Success(draws) => successes.push(draws),
            ChainOutcome::Failure(failure) => failures.push(failure),
        }
    }
    successes.sort_by_key(|d| d.chain_id);
    failures.sort_by_key(|f| f.chain_id);

    let Some(reference) = successes.first() else {
        return Err(FitError::NoSuccessfulChains { failures });
    };
    check_consistent(reference, &successes[1..])?;
    let spec_of = |chain_id: usize| specs.iter().find(|s| s.chain_id == chain_id);
    let first_spec = spec_of(reference.chain_id).ok_or_else(|| {
        FitError::SchemaMismatch(format!("no chain spec for chain {}", reference.chain_id))
    })?;
    let model_name = first_spec.artifact.manifest().model_name.clone();
    let artifact_key = *first_spec.artifact.key();

    let columns = reference.columns.clone();
    let mut chain_ids = Vec::with_capacity(successes.len());
    let mut sampling = Vec::with_capacity(successes.len());
    let mut warmup = Vec::with_capacity(successes.len());
    let mut traces = Vec::with_capacity(successes.len());
    for draws in successes {
        let max_treedepth = spec_of(draws.chain_id)
            .map_or(AdaptConfig::default().max_treedepth, |s| s.adapt.max_treedepth);
        chain_ids.push(draws.chain_id);
        traces.push(SamplerTrace {
            chain_id: draws.chain_id,
            max_treedepth,
            step_size: draws.step_size,
            iterations: draws.sampling_diagnostics,
        });
        sampling.push(draws.sampling);
        warmup.push(draws.warmup);
    }
    let draws = DrawTable::new(columns.clone(), chain_ids.clone(), sampling);
    let warmup = DrawTable::new(columns, chain_ids, warmup);

    let diagnostics = Diagnostics::compute(&draws, &traces)?;
    let summary = summarize(&draws, &traces)?;

    let permutation_seed = options.permutation_seed.unwrap_or_else(|| {
        let seed = rand::random();
        info!(seed, "no permutation seed configured, drew one");
        seed
    });
    let mut permutation: Vec<usize> = (0..draws.total_draws()).collect();
    permutation.shuffle(&mut ChaCha8Rng::seed_from_u64(permutation_seed));

    obs::emit_merge_completed(draws.num_chains(), draws.num_iterations(), failures.len());

    let fit = FitResult {
        fit_id: Uuid::new_v4(),
        created_at: Utc::now(),
        model_name,
        artifact_key,
        draws,
        warmup,
        traces,
        diagnostics,
        summary,
        specs,
        failures,
        permutation,
        permutation_seed,
    };
    let check = fit.check_hmc();
    if !check.passed() {
        check.log();
    }
    Ok(fit)
}

fn check_consistent(reference: &ChainDraws, others: &[ChainDraws]) -> Result<()> {
    for draws in others {
        if draws.columns != reference.columns {
            return Err(FitError::SchemaMismatch(format!(
                "chain {} columns {:?} differ from chain {} columns {:?}",
                draws.chain_id, draws.columns, reference.chain_id, reference.columns
            )));
        }
        if draws.sampling.len() != reference.sampling.len() {
            return Err(FitError::SchemaMismatch(format!(
                "chain {} has {} draws, chain {} has {}",
                draws.chain_id,
                draws.sampling.len(),
                reference.chain_id,
                reference.sampling.len()
            )));
        }
        if draws.warmup.len() != reference.warmup.len() {
            return Err(FitError::SchemaMismatch(format!(
                "chain {} has {} warmup draws, chain {} has {}",
                draws.chain_id,
                draws.warmup.len(),
                reference.chain_id,
                reference.warmup.len()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::domain::{
        DataBinding, FailureReason, InitStrategy, IterationDiagnostics, ModelSpec, ParamDecl,
        SamplerArtifact,
    };
    use crate::fit::ExtractOptions;

    fn spec(chain_id: usize) -> ChainSpec {
        let model = ModelSpec::new("m", "model { }")
            .with_param(ParamDecl::scalar("a"))
            .with_param(ParamDecl::scalar("b"));
        ChainSpec {
            chain_id,
            artifact: Arc::new(SamplerArtifact::new(&model, "v", "t", b"x".to_vec())),
            data: Arc::new(DataBinding::new()),
            seed: chain_id as u64,
            num_warmup: 2,
            num_samples: 10,
            thin: 1,
            adapt: AdaptConfig::default(),
            init: InitStrategy::default(),
        }
    }

    fn draws(chain_id: usize, n: usize) -> ChainDraws {
        let mut d = ChainDraws::new(chain_id, vec!["a".into(), "b".into()]);
        for i in 0..n {
            let x = ((i * 7 + chain_id * 3) % 10) as f64;
            d.sampling.push(vec![x, -x]);
            d.sampling_diagnostics.push(IterationDiagnostics {
                lp: -x,
                accept_stat: 0.8,
                step_size: 0.4,
                tree_depth: 3,
                n_leapfrog: 7,
                divergent: false,
                energy: x + (i % 3) as f64,
            });
        }
        d.warmup = vec![vec![100.0 + chain_id as f64, 0.0]; 2];
        d
    }

    fn opts() -> MergeOptions {
        MergeOptions {
            permutation_seed: Some(11),
        }
    }

    #[test]
    fn merges_successes_and_keeps_failures() {
        let outcomes = vec![
            ChainOutcome::Success(draws(2, 10)),
            ChainOutcome::failure(1, FailureReason::EngineCrash("boom".into()), None),
            ChainOutcome::Success(draws(0, 10)),
        ];
        let fit = merge(vec![spec(0), spec(1), spec(2)], outcomes, &opts()).unwrap();
        assert_eq!(fit.draws().chain_ids(), &[0, 2]);
        assert_eq!(fit.draws().total_draws(), 20);
        assert_eq!(fit.failures().len(), 1);
        assert_eq!(fit.failures()[0].chain_id, 1);
        assert_eq!(fit.chain_specs().len(), 3);
        assert_eq!(fit.diagnostics().params.len(), 2);
        assert!(fit.summary().row("lp__").is_some());
    }

    #[test]
    fn zero_successes_is_an_error_carrying_failures() {
        let outcomes = vec![
            ChainOutcome::failure(0, FailureReason::Cancelled, None),
            ChainOutcome::failure(1, FailureReason::Cancelled, None),
        ];
        match merge(vec![spec(0), spec(1)], outcomes, &opts()) {
            Err(FitError::NoSuccessfulChains { failures }) => assert_eq!(failures.len(), 2),
            other => panic!("expected NoSuccessfulChains, got {other:?}"),
        }
    }

    #[test]
    fn differing_lengths_are_schema_mismatch() {
        let outcomes = vec![
            ChainOutcome::Success(draws(0, 10)),
            ChainOutcome::Success(draws(1, 9)),
        ];
        assert!(matches!(
            merge(vec![spec(0), spec(1)], outcomes, &opts()),
            Err(FitError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn differing_columns_are_schema_mismatch() {
        let mut odd = draws(1, 10);
        odd.columns = vec!["a".into(), "c".into()];
        let outcomes = vec![ChainOutcome::Success(draws(0, 10)), ChainOutcome::Success(odd)];
        assert!(matches!(
            merge(vec![spec(0), spec(1)], outcomes, &opts()),
            Err(FitError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn permuted_extraction_is_stable_and_complete() {
        let outcomes = vec![
            ChainOutcome::Success(draws(0, 10)),
            ChainOutcome::Success(draws(1, 10)),
        ];
        let fit = merge(vec![spec(0), spec(1)], outcomes, &opts()).unwrap();
        let first = fit.extract(true);
        assert_eq!(first, fit.extract(true));

        let mut pooled = first.pooled("a").unwrap().to_vec();
        let mut expected = fit.draws().pooled(0);
        assert_eq!(pooled.len(), 20);
        pooled.sort_by(f64::total_cmp);
        expected.sort_by(f64::total_cmp);
        assert_eq!(pooled, expected);
    }

    #[test]
    fn same_permutation_seed_same_order() {
        let run = || {
            let outcomes = vec![
                ChainOutcome::Success(draws(0, 10)),
                ChainOutcome::Success(draws(1, 10)),
            ];
            merge(vec![spec(0), spec(1)], outcomes, &opts())
                .unwrap()
                .extract(true)
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn by_chain_extraction_optionally_includes_warmup() {
        let outcomes = vec![
            ChainOutcome::Success(draws(0, 10)),
            ChainOutcome::Success(draws(1, 10)),
        ];
        let fit = merge(vec![spec(0), spec(1)], outcomes, &opts()).unwrap();

        let post = fit.extract(false);
        assert_eq!(post.by_chain("a").unwrap()[1].len(), 10);

        let with_warmup = fit.extract_with(ExtractOptions {
            permuted: false,
            include_warmup: true,
        });
        let chain1 = &with_warmup.by_chain("a").unwrap()[1];
        assert_eq!(chain1.len(), 12);
        assert_eq!(chain1[0], 101.0);

        // Warmup never leaks into pooled draws.
        let pooled = fit.extract_with(ExtractOptions {
            permuted: true,
            include_warmup: true,
        });
        assert_eq!(pooled.pooled("a").unwrap().len(), 20);
    }
}
