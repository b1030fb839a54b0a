//! In-process stand-ins for the toolchain and sampling engine.
//!
//! `ScriptedToolchain` "compiles" any source instantly (or after a set delay)
//! and rejects sources containing `syntax error`. `GaussianEngine` yields
//! seeded AR(1) draws around a fixed mean per column, with knobs to inject
//! crashes, mid-run errors, truncated output and divergences.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::builder::{host_triple, CompiledModel, ModelToolchain};
use crate::domain::{
    flatten_columns, BuildError, CompilerDiagnostic, InitStrategy, IterationDiagnostics,
    ModelSpec, SamplerArtifact,
};
use crate::engine::{
    EngineDraw, EngineError, EngineErrorKind, EngineRequest, EngineSession, SamplingEngine,
};

// ---------------------------------------------------------------------------
// ScriptedToolchain
// ---------------------------------------------------------------------------

const SYNTAX_ERROR_MARKER: &str = "syntax error";

#[derive(Debug)]
pub struct ScriptedToolchain {
    engine_version: String,
    target_triple: String,
    delay: Option<Duration>,
    builds: AtomicUsize,
}

impl Default for ScriptedToolchain {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedToolchain {
    pub fn new() -> Self {
        Self {
            engine_version: "fake-2.33".to_string(),
            target_triple: host_triple(),
            delay: None,
            builds: AtomicUsize::new(0),
        }
    }

    pub fn with_engine_version(mut self, version: &str) -> Self {
        self.engine_version = version.to_string();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of compile invocations so far.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelToolchain for ScriptedToolchain {
    fn engine_version(&self) -> &str {
        &self.engine_version
    }

    fn target_triple(&self) -> &str {
        &self.target_triple
    }

    async fn compile(&self, spec: &ModelSpec, _workdir: &Path) -> Result<CompiledModel, BuildError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let diagnostics: Vec<CompilerDiagnostic> = spec
            .source()
            .lines()
            .enumerate()
            .filter_map(|(idx, line)| {
                line.find(SYNTAX_ERROR_MARKER).map(|col| CompilerDiagnostic {
                    message: "PARSER EXPECTED: \";\"".to_string(),
                    line: Some(idx + 1),
                    column: Some(col + 1),
                    construct: Some(line.trim().to_string()),
                })
            })
            .collect();
        if !diagnostics.is_empty() {
            return Err(BuildError::Compile {
                model: spec.name().to_string(),
                output: format!("Syntax error in '{}.stan'", spec.name()),
                diagnostics,
            });
        }

        Ok(CompiledModel {
            payload: format!("fake-sampler:{}", spec.name()).into_bytes(),
            log: String::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// GaussianEngine
// ---------------------------------------------------------------------------

/// Autocorrelation of successive draws.
const RHO: f64 = 0.5;

#[derive(Debug, Default)]
pub struct GaussianEngine {
    crash_seeds: HashSet<u64>,
    invalid_seeds: HashSet<u64>,
    fail_at: HashMap<u64, usize>,
    stop_after: HashMap<u64, usize>,
    dropped_columns: HashSet<String>,
    diverge_every: Option<usize>,
    iteration_delay: Option<Duration>,
    starts: AtomicUsize,
}

impl GaussianEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail to start any chain seeded with `seed`.
    pub fn crash_on_seed(mut self, seed: u64) -> Self {
        self.crash_seeds.insert(seed);
        self
    }

    /// Reject `seed` as invalid at start.
    pub fn reject_seed(mut self, seed: u64) -> Self {
        self.invalid_seeds.insert(seed);
        self
    }

    /// Return a runtime error at zero-based `iteration` for chains seeded
    /// with `seed`.
    pub fn fail_at_iteration(mut self, seed: u64, iteration: usize) -> Self {
        self.fail_at.insert(seed, iteration);
        self
    }

    /// Stop yielding after `iterations` for chains seeded with `seed`.
    pub fn stop_after(mut self, seed: u64, iterations: usize) -> Self {
        self.stop_after.insert(seed, iterations);
        self
    }

    /// Leave `column` out of the session's output.
    pub fn drop_column(mut self, column: &str) -> Self {
        self.dropped_columns.insert(column.to_string());
        self
    }

    /// Mark every `k`-th iteration divergent.
    pub fn diverge_every(mut self, k: usize) -> Self {
        self.diverge_every = Some(k.max(1));
        self
    }

    /// Sleep this long per iteration.
    pub fn iteration_delay(mut self, delay: Duration) -> Self {
        self.iteration_delay = Some(delay);
        self
    }

    /// Number of sessions started so far.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

impl SamplingEngine for GaussianEngine {
    fn start(
        &self,
        artifact: &SamplerArtifact,
        request: &EngineRequest<'_>,
    ) -> Result<Box<dyn EngineSession>, EngineError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.invalid_seeds.contains(&request.seed) {
            return Err(EngineError::new(
                EngineErrorKind::InvalidSeed,
                format!("seed {} is out of range", request.seed),
            ));
        }
        if self.crash_seeds.contains(&request.seed) {
            return Err(EngineError::new(
                EngineErrorKind::Crashed,
                "sampler exited with signal 11",
            ));
        }

        let columns: Vec<String> = flatten_columns(artifact.param_schema(), request.data)
            .map_err(|e| EngineError::new(EngineErrorKind::Runtime, e.to_string()))?
            .into_iter()
            .filter(|c| !self.dropped_columns.contains(c))
            .collect();
        let means: Vec<f64> = (0..columns.len()).map(|j| j as f64 * 0.5).collect();

        let mut rng = ChaCha8Rng::seed_from_u64(request.seed);
        let state = match request.init {
            InitStrategy::Random { radius } if *radius > 0.0 => (0..columns.len())
                .map(|_| rng.gen_range(-*radius..*radius))
                .collect(),
            _ => vec![0.0; columns.len()],
        };

        let total = request.num_warmup + request.num_samples;
        let limit = self
            .stop_after
            .get(&request.seed)
            .copied()
            .map_or(total, |n| n.min(total));

        Ok(Box::new(GaussianSession {
            columns,
            means,
            state,
            rng,
            iteration: 0,
            limit,
            num_warmup: request.num_warmup,
            step_size: request.adapt.stepsize,
            fail_at: self.fail_at.get(&request.seed).copied(),
            diverge_every: self.diverge_every,
            delay: self.iteration_delay,
        }))
    }
}

struct GaussianSession {
    columns: Vec<String>,
    means: Vec<f64>,
    state: Vec<f64>,
    rng: ChaCha8Rng,
    iteration: usize,
    limit: usize,
    num_warmup: usize,
    step_size: f64,
    fail_at: Option<usize>,
    diverge_every: Option<usize>,
    delay: Option<Duration>,
}

impl EngineSession for GaussianSession {
    fn column_names(&self) -> &[String] {
        &self.columns
    }

    fn next_draw(&mut self) -> Result<Option<EngineDraw>, EngineError> {
        if self.iteration >= self.limit {
            return Ok(None);
        }
        if self.fail_at == Some(self.iteration) {
            return Err(EngineError::new(
                EngineErrorKind::Runtime,
                "log density evaluated to non-finite value",
            ));
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        let innovation = (1.0 - RHO * RHO).sqrt();
        let mut sq_dev = 0.0;
        let mut kinetic = 0.0;
        for (x, mean) in self.state.iter_mut().zip(&self.means) {
            let z: f64 = self.rng.sample(StandardNormal);
            *x = mean + RHO * (*x - mean) + innovation * z;
            sq_dev += (*x - mean).powi(2);
            let p: f64 = self.rng.sample(StandardNormal);
            kinetic += 0.5 * p * p;
        }
        let lp = -0.5 * sq_dev;

        // Step size settles once warmup is over.
        if self.iteration == self.num_warmup {
            self.step_size *= 0.8;
        }
        let divergent = self
            .diverge_every
            .is_some_and(|k| (self.iteration + 1) % k == 0);

        let draw = EngineDraw {
            values: self.state.clone(),
            diagnostics: IterationDiagnostics {
                lp,
                accept_stat: self.rng.gen_range(0.6..1.0),
                step_size: self.step_size,
                tree_depth: 3,
                n_leapfrog: 7,
                divergent,
                energy: kinetic - lp,
            },
        };
        self.iteration += 1;
        Ok(Some(draw))
    }

    fn adapted_step_size(&self) -> Option<f64> {
        (self.iteration > self.num_warmup).then_some(self.step_size)
    }
}
