//! Single-chain runner.
//!
//! Drives one engine session to completion and normalizes whatever the
//! engine does into exactly one [`ChainOutcome`]. The runner never panics on
//! engine misbehaviour and checks for cancellation and timeout at every
//! iteration boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, instrument};

use crate::domain::{
    flatten_columns, validate_data, ChainDraws, ChainOutcome, ChainSpec, FailureReason,
};
use crate::engine::{EngineError, EngineErrorKind, EngineRequest, SamplingEngine};

/// Conditions under which a running chain must stop early.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    cancel: Option<watch::Receiver<bool>>,
    halt: Arc<AtomicBool>,
    deadline: Option<(Instant, Duration)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop once `rx` observes `true`.
    pub fn with_cancel(mut self, rx: watch::Receiver<bool>) -> Self {
        self.cancel = Some(rx);
        self
    }

    /// Stop once `limit` has elapsed from now. A limit too far in the
    /// future to represent never fires.
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.deadline = Instant::now()
            .checked_add(limit)
            .map(|deadline| (deadline, limit));
        self
    }

    /// Ask the chain to stop at its next iteration boundary.
    pub fn halt(&self) {
        self.halt.store(true, Ordering::SeqCst);
    }

    /// Whether the chain should stop now.
    pub fn should_stop(&self) -> bool {
        self.check().is_some()
    }

    fn check(&self) -> Option<FailureReason> {
        if let Some((deadline, limit)) = self.deadline {
            if Instant::now() >= deadline {
                return Some(FailureReason::TimedOut(limit));
            }
        }
        let cancelled = self.halt.load(Ordering::SeqCst)
            || self.cancel.as_ref().is_some_and(|rx| *rx.borrow());
        cancelled.then_some(FailureReason::Cancelled)
    }
}

/// Runs one chain against a sampling engine.
#[derive(Clone)]
pub struct ChainRunner {
    engine: Arc<dyn SamplingEngine>,
}

impl ChainRunner {
    pub fn new(engine: Arc<dyn SamplingEngine>) -> Self {
        Self { engine }
    }

    /// Run `spec` with no cancellation or timeout.
    pub fn run(&self, spec: &ChainSpec) -> ChainOutcome {
        self.run_with(spec, &StopSignal::new())
    }

    /// Run `spec` until completion, failure or `stop`. Blocking.
    #[instrument(skip_all, fields(chain_id = spec.chain_id, seed = spec.seed))]
    pub fn run_with(&self, spec: &ChainSpec, stop: &StopSignal) -> ChainOutcome {
        let artifact = &spec.artifact;
        let fail = |reason, partial| ChainOutcome::failure(spec.chain_id, reason, partial);

        if let Err(err) = validate_data(artifact.data_schema(), &spec.data) {
            return fail(FailureReason::DataBinding(err), None);
        }
        let expected = match flatten_columns(artifact.param_schema(), &spec.data) {
            Ok(columns) => columns,
            Err(err) => return fail(FailureReason::DataBinding(err), None),
        };
        if let Some(reason) = stop.check() {
            return fail(reason, None);
        }

        let request = EngineRequest {
            chain_id: spec.chain_id,
            data: &spec.data,
            seed: spec.seed,
            num_warmup: spec.num_warmup,
            num_samples: spec.num_samples,
            adapt: &spec.adapt,
            init: &spec.init,
            stop,
        };
        let mut session = match self.engine.start(artifact, &request) {
            Ok(session) => session,
            Err(err) => return fail(normalize(err, 0, stop), None),
        };

        let engine_columns = session.column_names().to_vec();
        let mut projection = Vec::with_capacity(expected.len());
        let mut missing = Vec::new();
        for column in &expected {
            match engine_columns.iter().position(|c| c == column) {
                Some(idx) => projection.push(idx),
                None => missing.push(column.clone()),
            }
        }
        if !missing.is_empty() {
            return fail(FailureReason::OutputSchema { missing }, None);
        }

        let thin = spec.thin.max(1);
        let total = spec.total_iterations();
        let mut draws = ChainDraws::new(spec.chain_id, expected);
        let mut phase_start = Instant::now();

        for iteration in 0..total {
            if let Some(reason) = stop.check() {
                return fail(reason, Some(draws));
            }
            if iteration == spec.num_warmup && iteration > 0 {
                draws.warmup_elapsed = phase_start.elapsed();
                phase_start = Instant::now();
            }

            let draw = match session.next_draw() {
                Ok(Some(draw)) => draw,
                Ok(None) => {
                    return fail(
                        FailureReason::EndedEarly {
                            produced: iteration,
                            expected: total,
                        },
                        Some(draws),
                    )
                }
                Err(err) => return fail(normalize(err, iteration, stop), Some(draws)),
            };
            if draw.values.len() != engine_columns.len() {
                let reason = FailureReason::EngineError {
                    iteration,
                    message: format!(
                        "draw has {} values for {} columns",
                        draw.values.len(),
                        engine_columns.len()
                    ),
                };
                return fail(reason, Some(draws));
            }

            let warmup = iteration < spec.num_warmup;
            let index_in_phase = if warmup {
                iteration
            } else {
                iteration - spec.num_warmup
            };
            if index_in_phase % thin != 0 {
                continue;
            }

            let row: Vec<f64> = projection.iter().map(|&i| draw.values[i]).collect();
            if warmup {
                draws.warmup.push(row);
                draws.warmup_diagnostics.push(draw.diagnostics);
            } else {
                draws.sampling.push(row);
                draws.sampling_diagnostics.push(draw.diagnostics);
            }
        }

        if spec.num_samples == 0 {
            draws.warmup_elapsed = phase_start.elapsed();
        } else {
            draws.sampling_elapsed = phase_start.elapsed();
        }
        draws.step_size = session.adapted_step_size();
        debug!(
            retained = draws.sampling.len(),
            divergences = draws.divergences(),
            "chain complete"
        );
        ChainOutcome::Success(draws)
    }
}

fn normalize(err: EngineError, iteration: usize, stop: &StopSignal) -> FailureReason {
    match err.kind {
        EngineErrorKind::Interrupted => stop.check().unwrap_or(FailureReason::Cancelled),
        EngineErrorKind::InvalidSeed => FailureReason::InvalidSeed(err.message),
        EngineErrorKind::Crashed => FailureReason::EngineCrash(err.message),
        EngineErrorKind::ResourceExhausted => FailureReason::ResourceExhausted(err.message),
        EngineErrorKind::Runtime => FailureReason::EngineError {
            iteration,
            message: err.message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        AdaptConfig, DataBinding, InitStrategy, ModelSpec, ParamDecl, SamplerArtifact, VarDecl,
    };
    use crate::fakes::GaussianEngine;
    use serde_json::json;

    fn spec(seed: u64, warmup: usize, samples: usize, thin: usize) -> ChainSpec {
        let model = ModelSpec::new("hier", "model { }")
            .with_data(VarDecl::int("J"))
            .with_param(ParamDecl::scalar("mu"))
            .with_param(ParamDecl::scalar("theta").dim("J"));
        let mut data = DataBinding::new();
        data.insert("J".into(), json!(2));
        ChainSpec {
            chain_id: 1,
            artifact: Arc::new(SamplerArtifact::new(&model, "fake-2.33", "t", b"x".to_vec())),
            data: Arc::new(data),
            seed,
            num_warmup: warmup,
            num_samples: samples,
            thin,
            adapt: AdaptConfig::default(),
            init: InitStrategy::default(),
        }
    }

    fn runner(engine: GaussianEngine) -> ChainRunner {
        ChainRunner::new(Arc::new(engine))
    }

    #[test]
    fn success_yields_requested_draws() {
        let outcome = runner(GaussianEngine::new()).run(&spec(1, 20, 30, 1));
        let draws = outcome.as_success().unwrap();
        assert_eq!(draws.columns, vec!["mu", "theta[1]", "theta[2]"]);
        assert_eq!(draws.warmup.len(), 20);
        assert_eq!(draws.sampling.len(), 30);
        assert_eq!(draws.sampling_diagnostics.len(), 30);
        assert!(draws.step_size.is_some());
    }

    #[test]
    fn thinning_rounds_up_per_phase() {
        let outcome = runner(GaussianEngine::new()).run(&spec(1, 10, 25, 2));
        let draws = outcome.as_success().unwrap();
        assert_eq!(draws.warmup.len(), 5);
        assert_eq!(draws.sampling.len(), 13);
    }

    #[test]
    fn crash_at_start_is_normalized() {
        let outcome = runner(GaussianEngine::new().crash_on_seed(5)).run(&spec(5, 5, 5, 1));
        let failure = outcome.as_failure().unwrap();
        assert!(matches!(failure.reason, FailureReason::EngineCrash(_)));
        assert!(failure.partial.is_none());
    }

    #[test]
    fn invalid_seed_is_normalized() {
        let outcome = runner(GaussianEngine::new().reject_seed(5)).run(&spec(5, 5, 5, 1));
        assert!(matches!(
            outcome.as_failure().unwrap().reason,
            FailureReason::InvalidSeed(_)
        ));
    }

    #[test]
    fn mid_run_error_keeps_partial_draws() {
        let outcome =
            runner(GaussianEngine::new().fail_at_iteration(2, 12)).run(&spec(2, 10, 10, 1));
        let failure = outcome.as_failure().unwrap();
        assert_eq!(
            failure.reason,
            FailureReason::EngineError {
                iteration: 12,
                message: "log density evaluated to non-finite value".into()
            }
        );
        let partial = failure.partial.as_ref().unwrap();
        assert_eq!(partial.warmup.len(), 10);
        assert_eq!(partial.sampling.len(), 2);
    }

    #[test]
    fn truncated_output_is_ended_early() {
        let outcome = runner(GaussianEngine::new().stop_after(3, 7)).run(&spec(3, 5, 5, 1));
        assert_eq!(
            outcome.as_failure().unwrap().reason,
            FailureReason::EndedEarly {
                produced: 7,
                expected: 10
            }
        );
    }

    #[test]
    fn missing_declared_column_is_schema_failure() {
        let outcome =
            runner(GaussianEngine::new().drop_column("theta[2]")).run(&spec(1, 5, 5, 1));
        assert_eq!(
            outcome.as_failure().unwrap().reason,
            FailureReason::OutputSchema {
                missing: vec!["theta[2]".into()]
            }
        );
    }

    #[test]
    fn bad_data_never_starts_engine() {
        let engine = Arc::new(GaussianEngine::new());
        let mut s = spec(1, 5, 5, 1);
        s.data = Arc::new(DataBinding::new());
        let outcome = ChainRunner::new(engine.clone()).run(&s);
        assert!(matches!(
            outcome.as_failure().unwrap().reason,
            FailureReason::DataBinding(_)
        ));
        assert_eq!(engine.starts(), 0);
    }

    #[test]
    fn halted_signal_cancels_before_start() {
        let stop = StopSignal::new();
        stop.halt();
        let outcome = runner(GaussianEngine::new()).run_with(&spec(1, 5, 5, 1), &stop);
        assert_eq!(outcome.as_failure().unwrap().reason, FailureReason::Cancelled);
    }

    #[test]
    fn deadline_stops_slow_chain() {
        let engine = GaussianEngine::new().iteration_delay(Duration::from_millis(5));
        let stop = StopSignal::new().with_timeout(Duration::from_millis(30));
        let outcome = runner(engine).run_with(&spec(1, 500, 500, 1), &stop);
        assert!(matches!(
            outcome.as_failure().unwrap().reason,
            FailureReason::TimedOut(_)
        ));
    }

    /// Writes nothing after its header until the caller's stop fires.
    struct SilentEngine;

    struct SilentSession {
        columns: Vec<String>,
        stop: StopSignal,
    }

    impl SamplingEngine for SilentEngine {
        fn start(
            &self,
            _artifact: &SamplerArtifact,
            request: &EngineRequest<'_>,
        ) -> Result<Box<dyn crate::engine::EngineSession>, EngineError> {
            Ok(Box::new(SilentSession {
                columns: vec!["mu".into(), "theta[1]".into(), "theta[2]".into()],
                stop: request.stop.clone(),
            }))
        }
    }

    impl crate::engine::EngineSession for SilentSession {
        fn column_names(&self) -> &[String] {
            &self.columns
        }

        fn next_draw(&mut self) -> Result<Option<crate::engine::EngineDraw>, EngineError> {
            while !self.stop.should_stop() {
                std::thread::sleep(Duration::from_millis(2));
            }
            Err(EngineError::new(EngineErrorKind::Interrupted, "stopped while waiting"))
        }
    }

    #[test]
    fn engine_blocked_inside_an_iteration_sees_the_deadline() {
        let stop = StopSignal::new().with_timeout(Duration::from_millis(30));
        let outcome = ChainRunner::new(Arc::new(SilentEngine)).run_with(&spec(1, 5, 5, 1), &stop);
        let failure = outcome.as_failure().unwrap();
        assert_eq!(failure.reason, FailureReason::TimedOut(Duration::from_millis(30)));
        assert!(failure.partial.is_some());
    }

    #[test]
    fn halted_engine_wait_is_a_cancellation() {
        let stop = StopSignal::new();
        let halter = stop.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            halter.halt();
        });
        let outcome = ChainRunner::new(Arc::new(SilentEngine)).run_with(&spec(1, 5, 5, 1), &stop);
        assert_eq!(outcome.as_failure().unwrap().reason, FailureReason::Cancelled);
    }

    #[test]
    fn unrepresentable_timeout_never_fires() {
        let stop = StopSignal::new().with_timeout(Duration::MAX);
        assert!(!stop.should_stop());
        let outcome = runner(GaussianEngine::new()).run_with(&spec(1, 5, 5, 1), &stop);
        assert!(outcome.as_success().is_some());
    }

    #[test]
    fn same_spec_same_draws() {
        let r = runner(GaussianEngine::new());
        let a = r.run(&spec(42, 10, 10, 1));
        let b = r.run(&spec(42, 10, 10, 1));
        let (a, b) = (a.as_success().unwrap(), b.as_success().unwrap());
        assert_eq!(a.sampling, b.sampling);
        assert_eq!(a.sampling_diagnostics, b.sampling_diagnostics);
    }
}
