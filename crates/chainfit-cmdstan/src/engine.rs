//! CmdStan sampler executables as a [`SamplingEngine`].
//!
//! Each chain gets a scratch directory holding the executable, the JSON data
//! file and the output CSV. The sampler writes warmup and sampling rows to
//! the CSV as it goes and the session tails it, so the runner can stop the
//! chain between iterations. While waiting for a row the session polls the
//! runner's stop signal, so a silent sampler still gets stopped. Dropping the
//! session kills the process.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use chainfit_core::{
    EngineDraw, EngineError, EngineErrorKind, EngineRequest, EngineSession, InitStrategy,
    SamplerArtifact, SamplingEngine, StopSignal,
};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::csv::{parse_step_size, CsvLayout, CsvTail};
use crate::error::CmdStanError;
use crate::toolchain::executable_name;

const OUTPUT_FILE: &str = "output.csv";
const DATA_FILE: &str = "data.json";
const CONSOLE_FILE: &str = "console.txt";

/// ETXTBSY: the executable was still open for writing in a forked sibling.
const TEXT_FILE_BUSY: i32 = 26;
const SPAWN_ATTEMPTS: usize = 5;

/// Tuning of the output tailing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CmdStanEngineConfig {
    /// Sleep between reads when the sampler has not written a new row.
    pub poll_interval: Duration,
    /// Longest wait for the CSV header after spawning.
    pub startup_timeout: Duration,
}

impl Default for CmdStanEngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5),
            startup_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct CmdStanEngine {
    config: CmdStanEngineConfig,
}

impl CmdStanEngine {
    pub fn new(config: CmdStanEngineConfig) -> Self {
        Self { config }
    }
}

/// Command-line arguments for one `sample` run, in CmdStan's argument tree
/// order. `thin` is always 1; the runner thins.
pub fn sample_args(request: &EngineRequest<'_>, data: &Path, output: &Path) -> Vec<String> {
    let adapt = request.adapt;
    let init = match request.init {
        InitStrategy::Random { radius } => radius.to_string(),
        InitStrategy::Zero => "0".to_string(),
    };
    vec![
        format!("id={}", request.chain_id + 1),
        "sample".to_string(),
        format!("num_samples={}", request.num_samples),
        format!("num_warmup={}", request.num_warmup),
        "save_warmup=1".to_string(),
        "thin=1".to_string(),
        "adapt".to_string(),
        format!("engaged={}", u8::from(adapt.engaged)),
        format!("gamma={}", adapt.gamma),
        format!("delta={}", adapt.delta),
        format!("kappa={}", adapt.kappa),
        format!("t0={}", adapt.t0),
        format!("init_buffer={}", adapt.init_buffer),
        format!("term_buffer={}", adapt.term_buffer),
        format!("window={}", adapt.window),
        "algorithm=hmc".to_string(),
        "engine=nuts".to_string(),
        format!("max_depth={}", adapt.max_treedepth),
        format!("stepsize={}", adapt.stepsize),
        format!("stepsize_jitter={}", adapt.stepsize_jitter),
        "data".to_string(),
        format!("file={}", data.display()),
        format!("init={init}"),
        "random".to_string(),
        format!("seed={}", request.seed),
        "output".to_string(),
        format!("file={}", output.display()),
        "refresh=0".to_string(),
    ]
}

fn io_error(context: &str, err: std::io::Error) -> EngineError {
    let kind = match err.kind() {
        std::io::ErrorKind::OutOfMemory => EngineErrorKind::ResourceExhausted,
        _ => EngineErrorKind::Crashed,
    };
    EngineError::new(kind, format!("{context}: {err}"))
}

fn write_executable(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, payload)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

fn spawn(exe: &Path, args: &[String], console: &Path, workdir: &Path) -> std::io::Result<Child> {
    let mut attempt = 0;
    loop {
        let out = File::create(console)?;
        let err = out.try_clone()?;
        let result = Command::new(exe)
            .args(args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(out))
            .stderr(Stdio::from(err))
            .spawn();
        match result {
            Err(e) if e.raw_os_error() == Some(TEXT_FILE_BUSY) && attempt + 1 < SPAWN_ATTEMPTS => {
                attempt += 1;
                thread::sleep(Duration::from_millis(10 * attempt as u64));
            }
            other => return other,
        }
    }
}

/// Turn a non-successful exit into an engine error using the console output.
fn classify_exit(status: ExitStatus, console: &str) -> EngineError {
    let last_line = console
        .lines()
        .map(str::trim)
        .rev()
        .find(|l| !l.is_empty())
        .unwrap_or("no output")
        .to_string();

    if status.code().is_none() {
        return EngineError::new(
            EngineErrorKind::Crashed,
            format!("sampler terminated by signal ({status}): {last_line}"),
        );
    }
    let lower = console.to_lowercase();
    if lower.contains("bad_alloc") || lower.contains("cannot allocate memory") {
        return EngineError::new(EngineErrorKind::ResourceExhausted, last_line);
    }
    if lower.contains("seed") && (lower.contains("not a valid value") || lower.contains("invalid")) {
        return EngineError::new(EngineErrorKind::InvalidSeed, last_line);
    }
    EngineError::new(
        EngineErrorKind::Runtime,
        format!("sampler exited with {status}: {last_line}"),
    )
}

impl SamplingEngine for CmdStanEngine {
    fn start(
        &self,
        artifact: &SamplerArtifact,
        request: &EngineRequest<'_>,
    ) -> Result<Box<dyn EngineSession>, EngineError> {
        if request.seed > u64::from(u32::MAX) {
            return Err(EngineError::new(
                EngineErrorKind::InvalidSeed,
                format!("seed {} exceeds CmdStan's 32-bit range", request.seed),
            ));
        }

        let dir = tempfile::Builder::new()
            .prefix("chainfit-chain-")
            .tempdir()
            .map_err(|e| io_error("create chain directory", e))?;
        let exe = dir.path().join(format!(
            "{}{}",
            executable_name(&artifact.manifest().model_name),
            std::env::consts::EXE_SUFFIX
        ));
        write_executable(&exe, artifact.payload()).map_err(|e| io_error("write sampler", e))?;

        let data = dir.path().join(DATA_FILE);
        let json = serde_json::to_vec(request.data).map_err(CmdStanError::from)?;
        std::fs::write(&data, json).map_err(|e| io_error("write data file", e))?;

        let output = dir.path().join(OUTPUT_FILE);
        let console = dir.path().join(CONSOLE_FILE);
        let args = sample_args(request, &data, &output);
        debug!(chain_id = request.chain_id, exe = %exe.display(), "spawning sampler");
        let child =
            spawn(&exe, &args, &console, dir.path()).map_err(|e| io_error("spawn sampler", e))?;

        let mut session = CmdStanSession {
            _dir: dir,
            child,
            output,
            console,
            tail: None,
            layout: None,
            exited: None,
            step_size: None,
            poll_interval: self.config.poll_interval,
            stop: request.stop.clone(),
        };
        session.wait_for_header(self.config.startup_timeout)?;
        Ok(Box::new(session))
    }
}

struct CmdStanSession {
    // Removed on drop, after the process is gone.
    _dir: TempDir,
    child: Child,
    output: PathBuf,
    console: PathBuf,
    tail: Option<CsvTail>,
    layout: Option<CsvLayout>,
    exited: Option<ExitStatus>,
    step_size: Option<f64>,
    poll_interval: Duration,
    stop: StopSignal,
}

enum Line {
    Text(String),
    Pending,
    Closed,
}

impl CmdStanSession {
    fn console_text(&self) -> String {
        std::fs::read_to_string(&self.console).unwrap_or_default()
    }

    fn exit_error(&self, status: ExitStatus) -> EngineError {
        classify_exit(status, &self.console_text())
    }

    /// Sleep one poll interval, or fail if the runner wants the chain stopped.
    fn idle(&self) -> Result<(), EngineError> {
        if self.stop.should_stop() {
            return Err(EngineError::new(
                EngineErrorKind::Interrupted,
                "stopped while waiting for sampler output",
            ));
        }
        thread::sleep(self.poll_interval);
        Ok(())
    }

    /// Next data or header line, skipping comments and blank lines.
    fn next_line(&mut self) -> Result<Line, EngineError> {
        loop {
            if self.tail.is_none() {
                match CsvTail::open(&self.output) {
                    Ok(tail) => self.tail = Some(tail),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(io_error("open sampler output", e)),
                }
            }

            let line = match self.tail.as_mut() {
                Some(tail) => tail.next_line().map_err(|e| io_error("read sampler output", e))?,
                None => None,
            };
            let line = match (line, self.exited) {
                (Some(line), _) => line,
                // Output is complete once the process is gone.
                (None, Some(_)) => match self.tail.as_mut().and_then(CsvTail::finish) {
                    Some(rest) => rest,
                    None => return Ok(Line::Closed),
                },
                (None, None) => {
                    match self.child.try_wait() {
                        Ok(Some(status)) => self.exited = Some(status),
                        Ok(None) => return Ok(Line::Pending),
                        Err(e) => return Err(io_error("poll sampler", e)),
                    }
                    continue;
                }
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.starts_with('#') {
                if let Some(step) = parse_step_size(trimmed) {
                    self.step_size = Some(step);
                }
                continue;
            }
            return Ok(Line::Text(trimmed.to_string()));
        }
    }

    fn wait_for_header(&mut self, timeout: Duration) -> Result<(), EngineError> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            match self.next_line()? {
                Line::Text(header) => {
                    let layout = CsvLayout::from_header(&header).map_err(EngineError::from)?;
                    self.layout = Some(layout);
                    return Ok(());
                }
                Line::Closed => {
                    return Err(match self.exited {
                        Some(status) if !status.success() => self.exit_error(status),
                        _ => EngineError::new(
                            EngineErrorKind::Crashed,
                            "sampler exited without writing output",
                        ),
                    })
                }
                Line::Pending if deadline.is_some_and(|d| Instant::now() >= d) => {
                    return Err(EngineError::new(
                        EngineErrorKind::Crashed,
                        format!("no sampler output after {timeout:?}"),
                    ))
                }
                Line::Pending => self.idle()?,
            }
        }
    }
}

impl EngineSession for CmdStanSession {
    fn column_names(&self) -> &[String] {
        self.layout
            .as_ref()
            .map(CsvLayout::columns)
            .unwrap_or_default()
    }

    fn next_draw(&mut self) -> Result<Option<EngineDraw>, EngineError> {
        loop {
            match self.next_line()? {
                Line::Text(row) => {
                    let layout = self.layout.as_ref().ok_or_else(|| {
                        EngineError::new(EngineErrorKind::Crashed, "sampler output has no header")
                    })?;
                    return layout.parse_row(&row).map(Some).map_err(EngineError::from);
                }
                Line::Pending => self.idle()?,
                Line::Closed => {
                    return match self.exited {
                        Some(status) if !status.success() => Err(self.exit_error(status)),
                        _ => Ok(None),
                    }
                }
            }
        }
    }

    fn adapted_step_size(&self) -> Option<f64> {
        self.step_size
    }
}

impl Drop for CmdStanSession {
    fn drop(&mut self) {
        if self.exited.is_some() {
            return;
        }
        if let Ok(None) = self.child.try_wait() {
            if let Err(e) = self.child.kill() {
                warn!(error = %e, "failed to kill sampler process");
            }
        }
        let _ = self.child.wait();
    }
}
