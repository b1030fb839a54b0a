//! CmdStan as a [`ModelToolchain`]: `make <workdir>/<model>` inside the
//! CmdStan home runs stanc and the C++ build in one step.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chainfit_core::{
    host_triple, ArtifactStore, BuildError, CompiledModel, ModelBuilder, ModelSpec, ModelToolchain,
};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{CmdStanError, Result};
use crate::stanc::parse_diagnostics;

/// Environment variable naming the CmdStan home.
pub const CMDSTAN_ENV: &str = "CMDSTAN";

/// Where CmdStan lives and how to drive it.
#[derive(Debug, Clone, PartialEq)]
pub struct CmdStanConfig {
    pub home: PathBuf,
    /// `make` program, e.g. `mingw32-make` on Windows.
    pub make: String,
    pub compile_timeout: Option<Duration>,
}

impl CmdStanConfig {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            make: "make".to_string(),
            compile_timeout: None,
        }
    }

    pub fn with_make(mut self, make: impl Into<String>) -> Self {
        self.make = make.into();
        self
    }

    pub fn with_compile_timeout(mut self, timeout: Duration) -> Self {
        self.compile_timeout = Some(timeout);
        self
    }

    /// `$CMDSTAN`, else the newest `~/.cmdstan/cmdstan-<version>`.
    pub fn from_env() -> Result<Self> {
        if let Some(home) = std::env::var_os(CMDSTAN_ENV) {
            let home = PathBuf::from(home);
            if !home.is_dir() {
                return Err(CmdStanError::NotFound(format!(
                    "{CMDSTAN_ENV}={} is not a directory",
                    home.display()
                )));
            }
            return Ok(Self::new(home));
        }

        let base = std::env::var_os("HOME")
            .map(|h| PathBuf::from(h).join(".cmdstan"))
            .ok_or_else(|| CmdStanError::NotFound("HOME is not set".to_string()))?;
        newest_install(&base)
            .map(Self::new)
            .ok_or_else(|| CmdStanError::NotFound(format!("no cmdstan-* under {}", base.display())))
    }

    /// CmdStan version, from `CMDSTAN_VERSION` in the top-level makefile or
    /// failing that the `cmdstan-<version>` directory name.
    pub fn version(&self) -> Result<String> {
        if let Ok(makefile) = std::fs::read_to_string(self.home.join("makefile")) {
            let declared = makefile.lines().find_map(|line| {
                let rest = line.trim().strip_prefix("CMDSTAN_VERSION")?;
                let value = rest.trim_start().strip_prefix(":=")?.trim();
                (!value.is_empty()).then(|| value.to_string())
            });
            if let Some(version) = declared {
                return Ok(version);
            }
        }
        self.home
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("cmdstan-"))
            .map(str::to_string)
            .ok_or_else(|| CmdStanError::UnknownVersion(self.home.clone()))
    }
}

fn version_key(name: &str) -> Option<Vec<u32>> {
    name.strip_prefix("cmdstan-")?
        .split('.')
        .map(|part| part.parse().ok())
        .collect()
}

fn newest_install(base: &Path) -> Option<PathBuf> {
    std::fs::read_dir(base)
        .ok()?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| {
            let key = version_key(e.file_name().to_str()?)?;
            Some((key, e.path()))
        })
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, path)| path)
}

/// Executable name for a model: CmdStan targets must be valid file stems.
pub fn executable_name(model: &str) -> String {
    let mut name: String = model
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        name.insert(0, 'm');
    }
    name
}

pub struct CmdStanToolchain {
    config: CmdStanConfig,
    version: String,
    target: String,
}

impl CmdStanToolchain {
    pub fn new(config: CmdStanConfig) -> Result<Self> {
        let version = config.version()?;
        info!(home = %config.home.display(), version = %version, "using CmdStan");
        Ok(Self {
            config,
            version,
            target: host_triple(),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(CmdStanConfig::from_env()?)
    }

    pub fn config(&self) -> &CmdStanConfig {
        &self.config
    }

    /// A [`ModelBuilder`] over this toolchain with the configured compile
    /// timeout applied.
    pub fn into_builder(self, store: Arc<dyn ArtifactStore>) -> ModelBuilder {
        let timeout = self.config.compile_timeout;
        let builder = ModelBuilder::new(Arc::new(self), store);
        match timeout {
            Some(limit) => builder.with_timeout(limit),
            None => builder,
        }
    }
}

#[async_trait]
impl ModelToolchain for CmdStanToolchain {
    fn engine_version(&self) -> &str {
        &self.version
    }

    fn target_triple(&self) -> &str {
        &self.target
    }

    async fn compile(&self, spec: &ModelSpec, workdir: &Path) -> std::result::Result<CompiledModel, BuildError> {
        let stem = executable_name(spec.name());
        let source = workdir.join(format!("{stem}.stan"));
        tokio::fs::write(&source, spec.source()).await?;
        let target = workdir.join(format!("{stem}{}", std::env::consts::EXE_SUFFIX));

        debug!(model = %spec.name(), target = %target.display(), "invoking make");
        let output = Command::new(&self.config.make)
            .arg(&target)
            .current_dir(&self.config.home)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => BuildError::ToolchainUnavailable(format!(
                    "'{}' not found on PATH",
                    self.config.make
                )),
                _ => BuildError::from(e),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            // stanc reports on stderr; linker failures may only reach stdout.
            let mut diagnostics = parse_diagnostics(&stderr);
            if diagnostics.is_empty() {
                diagnostics = parse_diagnostics(&stdout);
            }
            return Err(BuildError::Compile {
                model: spec.name().to_string(),
                diagnostics,
                output: format!("{stdout}{stderr}"),
            });
        }

        let payload = tokio::fs::read(&target).await?;
        Ok(CompiledModel {
            payload,
            log: stderr.into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_from_makefile() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("makefile"),
            "# CmdStan makefile\nCMDSTAN_VERSION := 2.33.1\n-include make/local\n",
        )
        .unwrap();
        let config = CmdStanConfig::new(dir.path());
        assert_eq!(config.version().unwrap(), "2.33.1");
    }

    #[test]
    fn version_from_directory_name() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("cmdstan-2.34.0");
        std::fs::create_dir(&home).unwrap();
        assert_eq!(CmdStanConfig::new(&home).version().unwrap(), "2.34.0");
    }

    #[test]
    fn unknown_version_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CmdStanConfig::new(dir.path()).version().unwrap_err();
        assert!(matches!(err, CmdStanError::UnknownVersion(_)));
    }

    #[test]
    fn newest_install_compares_numerically() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["cmdstan-2.9.0", "cmdstan-2.33.1", "cmdstan-2.33.0", "other"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        let newest = newest_install(dir.path()).unwrap();
        assert!(newest.ends_with("cmdstan-2.33.1"));
    }

    #[test]
    fn executable_names_are_file_stems() {
        assert_eq!(executable_name("eight_schools"), "eight_schools");
        assert_eq!(executable_name("my-model v2"), "my_model_v2");
        assert_eq!(executable_name("8schools"), "m8schools");
    }
}
