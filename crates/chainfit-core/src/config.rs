//! Fit and cache configuration.
//!
//! `FitConfig` is plain serde data, loadable from TOML:
//!
//! ```toml
//! chains = 4
//! warmup = 500
//! samples = 500
//! seed = 1234
//!
//! [adapt]
//! delta = 0.95
//!
//! [init]
//! kind = "random"
//! radius = 1.0
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{AdaptConfig, ChainSpec, DataBinding, InitStrategy, SamplerArtifact};
use crate::orchestrator::OrchestratorConfig;
use crate::store::fs::FsArtifactStore;
use crate::store::StoreError;

/// Environment variable naming the artifact cache root.
pub const CACHE_DIR_ENV: &str = "CHAINFIT_CACHE_DIR";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How to run the chains of one fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FitConfig {
    pub chains: usize,
    pub warmup: usize,
    pub samples: usize,
    pub thin: usize,
    /// Base seed; chain `i` gets `seed + i`. Random when unset.
    pub seed: Option<u64>,
    /// Explicit per-chain seeds, overriding `seed`.
    pub chain_seeds: Option<Vec<u64>>,
    pub adapt: AdaptConfig,
    pub init: InitStrategy,
    pub chain_timeout_secs: Option<f64>,
    /// Defaults to the number of chains.
    pub max_concurrent: Option<usize>,
    pub permutation_seed: Option<u64>,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            chains: 4,
            warmup: 1000,
            samples: 1000,
            thin: 1,
            seed: None,
            chain_seeds: None,
            adapt: AdaptConfig::default(),
            init: InitStrategy::default(),
            chain_timeout_secs: None,
            max_concurrent: None,
            permutation_seed: None,
        }
    }
}

impl FitConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.chains == 0 {
            return invalid("chains must be at least 1".into());
        }
        if self.samples == 0 {
            return invalid("samples must be at least 1".into());
        }
        if self.thin == 0 {
            return invalid("thin must be at least 1".into());
        }
        if let Some(seeds) = &self.chain_seeds {
            if seeds.len() != self.chains {
                return invalid(format!(
                    "{} chain seeds given for {} chains",
                    seeds.len(),
                    self.chains
                ));
            }
        }
        if !(self.adapt.delta > 0.0 && self.adapt.delta < 1.0) {
            return invalid(format!("adapt.delta must be in (0, 1), got {}", self.adapt.delta));
        }
        if let InitStrategy::Random { radius } = self.init {
            if !(radius >= 0.0) {
                return invalid(format!("init radius must be non-negative, got {radius}"));
            }
        }
        if let Some(secs) = self.chain_timeout_secs {
            if !(secs > 0.0 && Duration::try_from_secs_f64(secs).is_ok()) {
                return invalid(format!(
                    "chain_timeout_secs must be a positive representable duration, got {secs}"
                ));
            }
        }
        if self.max_concurrent == Some(0) {
            return invalid("max_concurrent must be at least 1".into());
        }
        Ok(())
    }

    /// `None` when unset or not representable; `validate` rejects the latter.
    pub fn chain_timeout(&self) -> Option<Duration> {
        self.chain_timeout_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_concurrent: self.max_concurrent.unwrap_or(self.chains),
            chain_timeout: self.chain_timeout(),
        }
    }

    /// Seed of chain `index` given the resolved base seed.
    pub fn chain_seed(&self, base: u64, index: usize) -> u64 {
        self.chain_seeds
            .as_ref()
            .and_then(|seeds| seeds.get(index).copied())
            .unwrap_or_else(|| base.wrapping_add(index as u64))
    }

    /// One spec per chain, sharing `artifact` and `data`.
    pub fn chain_specs(
        &self,
        artifact: &Arc<SamplerArtifact>,
        data: &Arc<DataBinding>,
        base_seed: u64,
    ) -> Vec<ChainSpec> {
        (0..self.chains)
            .map(|chain_id| ChainSpec {
                chain_id,
                artifact: Arc::clone(artifact),
                data: Arc::clone(data),
                seed: self.chain_seed(base_seed, chain_id),
                num_warmup: self.warmup,
                num_samples: self.samples,
                thin: self.thin,
                adapt: self.adapt.clone(),
                init: self.init.clone(),
            })
            .collect()
    }
}

/// Where built artifacts live on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub root: PathBuf,
}

impl CacheConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Reads `CHAINFIT_CACHE_DIR`, falling back to `$HOME/.cache/chainfit`
    /// and then to a directory under the system temp dir.
    pub fn from_env() -> Self {
        if let Some(dir) = std::env::var_os(CACHE_DIR_ENV).filter(|v| !v.is_empty()) {
            return Self::new(dir);
        }
        let root = std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".cache").join("chainfit"))
            .unwrap_or_else(|| std::env::temp_dir().join("chainfit"));
        Self::new(root)
    }

    pub fn open_store(&self) -> Result<FsArtifactStore, StoreError> {
        FsArtifactStore::new(&self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = FitConfig::default();
        assert_eq!((c.chains, c.warmup, c.samples, c.thin), (4, 1000, 1000, 1));
        c.validate().unwrap();
        assert_eq!(c.orchestrator().max_concurrent, 4);
    }

    #[test]
    fn toml_overrides_merge_with_defaults() {
        let c = FitConfig::from_toml_str(
            r#"
            chains = 2
            samples = 250
            seed = 99
            chain_timeout_secs = 1.5

            [adapt]
            delta = 0.95

            [init]
            kind = "zero"
            "#,
        )
        .unwrap();
        assert_eq!(c.chains, 2);
        assert_eq!(c.warmup, 1000);
        assert_eq!(c.adapt.delta, 0.95);
        assert_eq!(c.adapt.max_treedepth, 10);
        assert_eq!(c.init, InitStrategy::Zero);
        assert_eq!(c.chain_timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            FitConfig::from_toml_str("chians = 4"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn invalid_values_are_rejected() {
        for toml in [
            "chains = 0",
            "samples = 0",
            "thin = 0",
            "chains = 2\nchain_seeds = [1]",
            "[adapt]\ndelta = 1.0",
            "max_concurrent = 0",
            "chain_timeout_secs = 0.0",
            "chain_timeout_secs = 1e30",
        ] {
            assert!(
                matches!(FitConfig::from_toml_str(toml), Err(ConfigError::Invalid(_))),
                "accepted: {toml}"
            );
        }
    }

    #[test]
    fn oversized_timeout_never_panics() {
        let c = FitConfig {
            chain_timeout_secs: Some(1e30),
            ..FitConfig::default()
        };
        assert!(c.validate().is_err());
        assert_eq!(c.chain_timeout(), None);
        assert_eq!(c.orchestrator().chain_timeout, None);
    }

    #[test]
    fn seeds_are_offset_unless_given() {
        let mut c = FitConfig {
            chains: 3,
            ..FitConfig::default()
        };
        assert_eq!(c.chain_seed(10, 2), 12);
        assert_eq!(c.chain_seed(u64::MAX, 1), 0);
        c.chain_seeds = Some(vec![7, 8, 9]);
        assert_eq!(c.chain_seed(10, 2), 9);
    }

    #[test]
    fn from_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fit.toml");
        let err = FitConfig::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("fit.toml"));

        std::fs::write(&path, "chains = 1\nsamples = 10").unwrap();
        assert_eq!(FitConfig::from_file(&path).unwrap().chains, 1);
    }

    #[test]
    fn cache_config_opens_fs_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheConfig::new(dir.path()).open_store().unwrap();
        assert!(store.entry_dir(&crate::store::Digest::compute(b"k")).starts_with(dir.path()));
    }
}
