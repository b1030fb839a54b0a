//! Drives the CmdStan adapters against shell scripts standing in for `make`
//! and for compiled sampler executables.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chainfit_cmdstan::{CmdStanConfig, CmdStanEngine, CmdStanToolchain};
use chainfit_core::{
    host_triple, AdaptConfig, ArtifactCache, BuildError, ChainOutcome, ChainRunner, ChainSpec,
    DataBinding, FailureReason, InitStrategy, MemoryArtifactStore, ModelSpec, ModelToolchain,
    ParamDecl, SamplerArtifact, StopSignal,
};

const SAMPLER_HEADER: &str = r#"#!/bin/sh
out=""
prev=""
for arg in "$@"; do
  if [ "$prev" = "output" ]; then out="${arg#file=}"; fi
  prev="$arg"
done
"#;

const FIVE_ROWS: &str = r#"cat > "$out" <<'EOF'
# model = normal_model
# method = sample (Default)
lp__,accept_stat__,stepsize__,treedepth__,n_leapfrog__,divergent__,energy__,mu,sigma,y_rep
-1.0,0.90,1.0,2,3,0,1.2,0.10,1.1,5
-1.1,0.85,1.0,2,3,0,1.3,0.20,1.2,6
# Adaptation terminated
# Step size = 0.7
-0.9,0.80,0.7,2,3,0,1.1,0.30,0.9,7
-0.8,0.95,0.7,3,7,1,1.0,0.40,1.0,8
-0.7,0.91,0.7,2,3,0,0.9,0.50,1.3,9
EOF
"#;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn model() -> ModelSpec {
    ModelSpec::new(
        "normal_model",
        "parameters { real mu; real<lower=0> sigma; }\nmodel { mu ~ normal(0, 1); }",
    )
    .with_param(ParamDecl::scalar("mu"))
    .with_param(ParamDecl::scalar("sigma"))
}

fn chain(script_body: &str, warmup: usize, samples: usize) -> ChainSpec {
    let artifact = SamplerArtifact::new(
        &model(),
        "2.33.1",
        &host_triple(),
        format!("{SAMPLER_HEADER}{script_body}").into_bytes(),
    );
    ChainSpec {
        chain_id: 0,
        artifact: Arc::new(artifact),
        data: Arc::new(DataBinding::new()),
        seed: 42,
        num_warmup: warmup,
        num_samples: samples,
        thin: 1,
        adapt: AdaptConfig::default(),
        init: InitStrategy::default(),
    }
}

fn runner() -> ChainRunner {
    ChainRunner::new(Arc::new(CmdStanEngine::default()))
}

#[test]
fn sampler_rows_become_chain_draws() {
    let outcome = runner().run(&chain(FIVE_ROWS, 2, 3));
    let draws = match outcome {
        ChainOutcome::Success(draws) => draws,
        ChainOutcome::Failure(f) => panic!("chain failed: {f}"),
    };
    assert_eq!(draws.columns, vec!["mu", "sigma"]);
    assert_eq!(draws.warmup, vec![vec![0.10, 1.1], vec![0.20, 1.2]]);
    assert_eq!(draws.sampling.len(), 3);
    assert_eq!(draws.sampling[2], vec![0.50, 1.3]);
    assert_eq!(draws.divergences(), 1);
    assert_eq!(draws.step_size, Some(0.7));
}

#[test]
fn short_output_ends_early() {
    let outcome = runner().run(&chain(FIVE_ROWS, 2, 10));
    match outcome {
        ChainOutcome::Failure(f) => {
            assert_eq!(
                f.reason,
                FailureReason::EndedEarly {
                    produced: 5,
                    expected: 12
                }
            );
            assert_eq!(f.partial.unwrap().sampling.len(), 3);
        }
        ChainOutcome::Success(_) => panic!("expected an early end"),
    }
}

#[test]
fn signal_is_an_engine_crash() {
    let outcome = runner().run(&chain("kill -SEGV $$\n", 10, 10));
    let failure = outcome.as_failure().unwrap();
    assert!(
        matches!(failure.reason, FailureReason::EngineCrash(_)),
        "{:?}",
        failure.reason
    );
}

#[test]
fn allocation_failure_is_resource_exhaustion() {
    let script = r#"printf 'lp__,accept_stat__,stepsize__,treedepth__,n_leapfrog__,divergent__,energy__,mu,sigma\n' > "$out"
echo "Exception: std::bad_alloc" >&2
exit 70
"#;
    let outcome = runner().run(&chain(script, 10, 10));
    let failure = outcome.as_failure().unwrap();
    assert!(
        matches!(failure.reason, FailureReason::ResourceExhausted(_)),
        "{:?}",
        failure.reason
    );
}

#[test]
fn missing_declared_column_is_a_schema_failure() {
    let script = r#"printf 'lp__,accept_stat__,stepsize__,treedepth__,n_leapfrog__,divergent__,energy__,mu\n-1,0.9,1,2,3,0,1.2,0.1\n' > "$out"
"#;
    let outcome = runner().run(&chain(script, 0, 1));
    assert_eq!(
        outcome.as_failure().unwrap().reason,
        FailureReason::OutputSchema {
            missing: vec!["sigma".to_string()]
        }
    );
}

#[test]
fn seed_outside_u32_is_rejected_before_spawn() {
    let mut spec = chain(FIVE_ROWS, 2, 3);
    spec.seed = u64::from(u32::MAX) + 1;
    let outcome = runner().run(&spec);
    assert!(matches!(
        outcome.as_failure().unwrap().reason,
        FailureReason::InvalidSeed(_)
    ));
}

#[test]
fn slow_sampler_is_stopped_on_timeout() {
    let script = r#"printf 'lp__,accept_stat__,stepsize__,treedepth__,n_leapfrog__,divergent__,energy__,mu,sigma\n' > "$out"
while true; do
  echo "-1,0.9,1,2,3,0,1.2,0.1,1.0" >> "$out"
  sleep 0.02
done
"#;
    let stop = StopSignal::new().with_timeout(Duration::from_millis(300));
    let outcome = runner().run_with(&chain(script, 1000, 1000), &stop);
    let failure = outcome.as_failure().unwrap();
    assert!(matches!(failure.reason, FailureReason::TimedOut(_)));
    assert!(failure.partial.is_some());
}

#[test]
fn silent_sampler_is_killed_on_timeout() {
    let scratch = tempfile::tempdir().unwrap();
    let pid_file = scratch.path().join("sampler.pid");
    let script = format!(
        r#"printf 'lp__,accept_stat__,stepsize__,treedepth__,n_leapfrog__,divergent__,energy__,mu,sigma\n' > "$out"
echo $$ > "{}"
exec sleep 30
"#,
        pid_file.display()
    );

    let started = std::time::Instant::now();
    let stop = StopSignal::new().with_timeout(Duration::from_millis(300));
    let outcome = runner().run_with(&chain(&script, 10, 10), &stop);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(matches!(
        outcome.as_failure().unwrap().reason,
        FailureReason::TimedOut(_)
    ));

    let pid = std::fs::read_to_string(&pid_file).unwrap();
    let alive = std::process::Command::new("kill")
        .args(["-0", pid.trim()])
        .status()
        .unwrap();
    assert!(!alive.success(), "sampler {} still running", pid.trim());
}

fn cmdstan_home(dir: &Path) -> PathBuf {
    let home = dir.join("cmdstan-2.33.1");
    std::fs::create_dir(&home).unwrap();
    std::fs::write(home.join("makefile"), "CMDSTAN_VERSION := 2.33.1\n").unwrap();
    home
}

#[tokio::test]
async fn toolchain_compiles_through_make() {
    let dir = tempfile::tempdir().unwrap();
    let home = cmdstan_home(dir.path());
    let make = write_script(
        dir.path(),
        "fake-make",
        "#!/bin/sh\nprintf 'compiled %s' \"$(basename \"$1\")\" > \"$1\"\necho 'warning: unused variable' >&2\n",
    );

    let toolchain = CmdStanToolchain::new(
        CmdStanConfig::new(&home).with_make(make.to_string_lossy()),
    )
    .unwrap();
    assert_eq!(toolchain.engine_version(), "2.33.1");

    let store = Arc::new(MemoryArtifactStore::new());
    let cache = ArtifactCache::with_builder(store.clone(), toolchain.into_builder(store));
    let artifact = cache.get_or_build(&model()).await.unwrap();
    assert_eq!(artifact.payload(), b"compiled normal_model");
    assert_eq!(artifact.manifest().engine_version, "2.33.1");
}

#[tokio::test]
async fn stanc_errors_become_compile_diagnostics() {
    let dir = tempfile::tempdir().unwrap();
    let home = cmdstan_home(dir.path());
    let make = write_script(
        dir.path(),
        "fake-make",
        r#"#!/bin/sh
cat >&2 <<'EOF'
Syntax error in 'normal_model.stan', line 1, column 26, parsing error:
   -------------------------------------------------
     1:  parameters { real mu; real<lower=0> sigma }
                                                   ^
   -------------------------------------------------

Expected ";" after variable declaration.
EOF
exit 2
"#,
    );

    let toolchain =
        CmdStanToolchain::new(CmdStanConfig::new(&home).with_make(make.to_string_lossy())).unwrap();
    let err = toolchain
        .compile(&model(), dir.path())
        .await
        .unwrap_err();
    match err {
        BuildError::Compile {
            model, diagnostics, ..
        } => {
            assert_eq!(model, "normal_model");
            assert_eq!(diagnostics.len(), 1);
            assert_eq!(diagnostics[0].line, Some(1));
            assert_eq!(diagnostics[0].column, Some(26));
        }
        other => panic!("expected a compile error, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_make_is_toolchain_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let home = cmdstan_home(dir.path());
    let toolchain = CmdStanToolchain::new(
        CmdStanConfig::new(&home).with_make("chainfit-no-such-make"),
    )
    .unwrap();
    let err = toolchain.compile(&model(), dir.path()).await.unwrap_err();
    assert!(matches!(err, BuildError::ToolchainUnavailable(_)));
}
