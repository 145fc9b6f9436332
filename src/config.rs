use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chain_config::{CHAIN_TOML, ChainConfig, ChainOverrides, ChainToml};

/// Runtime configuration for one chain directory.
///
/// Bridges `chain.toml` (plus environment and CLI overrides) with the
/// directory layout the driver, state store and processors write into.
#[derive(Debug, Clone)]
pub struct Config {
    pub chain_dir: PathBuf,
    pub config_file: PathBuf,
    pub state_file: PathBuf,
    pub output_dir: PathBuf,
    pub batch_dir: PathBuf,
    pub log_dir: PathBuf,
    pub lock_file: PathBuf,
    pub verbose: bool,
    /// The layered configuration
    pub toml: ChainToml,
}

impl Config {
    /// Resolve the configuration of a chain directory.
    ///
    /// The directory is created if needed so that a fresh chain can be started
    /// by pointing at an empty location.
    pub fn new(chain_dir: &Path, overrides: &ChainOverrides, verbose: bool) -> Result<Self> {
        std::fs::create_dir_all(chain_dir)
            .with_context(|| format!("Failed to create chain directory: {}", chain_dir.display()))?;
        let chain_dir = chain_dir
            .canonicalize()
            .context("Failed to resolve chain directory")?;

        let mut toml = ChainToml::load_or_default(&chain_dir)?;
        toml.apply_env()?;
        toml.apply_overrides(overrides);

        Ok(Self::with_toml(chain_dir, toml, verbose))
    }

    /// Build the layout for an already-resolved configuration.
    pub fn with_toml(chain_dir: PathBuf, toml: ChainToml, verbose: bool) -> Self {
        Self {
            config_file: chain_dir.join(CHAIN_TOML),
            state_file: chain_dir.join("state.json"),
            output_dir: chain_dir.join("out"),
            batch_dir: chain_dir.join("batch"),
            log_dir: chain_dir.join("log"),
            lock_file: chain_dir.join("chain.lock"),
            chain_dir,
            verbose,
            toml,
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.output_dir).context("Failed to create output directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }

    pub fn chain_config(&self) -> ChainConfig {
        self.toml.chain_config()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.toml.backend.poll_interval_secs)
    }
}
