//! Parallel chain orchestration.
//!
//! Each chain runs on its own blocking worker. A semaphore bounds how many
//! run at once, and a shared watch channel carries cancellation. One chain
//! failing never aborts its siblings. The orchestrator returns one outcome
//! per spec, ordered by `chain_id`, only after every worker has finished.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinError;
use tracing::{info, instrument};

use crate::domain::{ChainOutcome, ChainSpec, FailureReason};
use crate::engine::SamplingEngine;
use crate::metrics::METRICS;
use crate::obs;
use crate::runner::{ChainRunner, StopSignal};

/// Slack given to a worker past its own deadline before the orchestrator
/// records the timeout itself.
const TIMEOUT_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum number of chains running at once.
    pub max_concurrent: usize,
    /// Wall-clock limit per chain, measured from when it starts running.
    pub chain_timeout: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: std::thread::available_parallelism().map_or(4, |n| n.get()),
            chain_timeout: None,
        }
    }
}

/// Cooperative cancellation shared by every chain of a run.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Stop all chains at their next iteration boundary. Chains not yet
    /// started never start.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Runs a batch of chains concurrently.
pub struct ChainOrchestrator {
    runner: ChainRunner,
    config: OrchestratorConfig,
    cancel: CancelHandle,
}

impl ChainOrchestrator {
    pub fn new(engine: Arc<dyn SamplingEngine>, config: OrchestratorConfig) -> Self {
        Self {
            runner: ChainRunner::new(engine),
            config,
            cancel: CancelHandle::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run every spec and return one outcome per spec, ordered by chain id.
    #[instrument(skip_all, fields(chains = specs.len(), max_concurrent = self.config.max_concurrent))]
    pub async fn run_all(&self, specs: Vec<ChainSpec>) -> Vec<ChainOutcome> {
        let sem = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let chain_ids: Vec<usize> = specs.iter().map(|s| s.chain_id).collect();

        let tasks = specs.into_iter().map(|spec| {
            let sem = Arc::clone(&sem);
            let runner = self.runner.clone();
            let cancel = self.cancel.clone();
            let timeout = self.config.chain_timeout;
            tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                run_one(runner, spec, cancel, timeout).await
            })
        });
        let joined = join_all(tasks).await;

        let mut outcomes: Vec<ChainOutcome> = joined
            .into_iter()
            .zip(chain_ids)
            .map(|(joined, chain_id)| joined.unwrap_or_else(|err| from_join_error(chain_id, err)))
            .collect();
        outcomes.sort_by_key(ChainOutcome::chain_id);

        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        info!(
            succeeded = outcomes.len() - failed,
            failed = failed,
            "all chains settled"
        );
        outcomes
    }
}

async fn run_one(
    runner: ChainRunner,
    spec: ChainSpec,
    cancel: CancelHandle,
    timeout: Option<Duration>,
) -> ChainOutcome {
    let chain_id = spec.chain_id;
    if cancel.is_cancelled() {
        return settle(ChainOutcome::failure(chain_id, FailureReason::Cancelled, None), 0);
    }

    obs::emit_chain_started(chain_id, spec.seed, spec.total_iterations());
    let start = Instant::now();

    let mut stop = StopSignal::new().with_cancel(cancel.subscribe());
    if let Some(limit) = timeout {
        stop = stop.with_timeout(limit);
    }
    let worker_stop = stop.clone();
    let worker = tokio::task::spawn_blocking(move || runner.run_with(&spec, &worker_stop));

    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit.saturating_add(TIMEOUT_GRACE), worker)
            .await
        {
            Ok(joined) => joined.unwrap_or_else(|err| from_join_error(chain_id, err)),
            Err(_) => {
                // The engine is stuck inside an iteration; leave the worker
                // to notice the halt flag whenever it returns.
                stop.halt();
                ChainOutcome::failure(chain_id, FailureReason::TimedOut(limit), None)
            }
        },
        None => worker
            .await
            .unwrap_or_else(|err| from_join_error(chain_id, err)),
    };
    settle(outcome, start.elapsed().as_millis() as u64)
}

fn settle(outcome: ChainOutcome, duration_ms: u64) -> ChainOutcome {
    match &outcome {
        ChainOutcome::Success(draws) => {
            METRICS.inc_chains_succeeded();
            obs::emit_chain_finished(
                draws.chain_id,
                draws.sampling.len(),
                draws.divergences(),
                duration_ms,
            );
        }
        ChainOutcome::Failure(failure) => {
            METRICS.inc_chains_failed();
            obs::emit_chain_failed(failure.chain_id, &failure.reason);
        }
    }
    outcome
}

fn from_join_error(chain_id: usize, err: JoinError) -> ChainOutcome {
    let reason = if err.is_panic() {
        let payload = err.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        FailureReason::Panicked(message)
    } else {
        FailureReason::Cancelled
    };
    ChainOutcome::failure(chain_id, reason, None)
}
