//! Chain configuration read from `chain.toml`.
//!
//! Settings are layered: file -> environment (`MAPCHAIN_*`) -> CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [chain]
//! optimizations = 100
//! dimensions = 2
//! minimum_column_basis = "none"
//! keep_projections = 10
//! incremental = true
//! scratch = true
//!
//! [backend]
//! kind = "auto"
//! optimizations_per_run = 10
//! poll_interval_secs = 30
//! failure_confirmations = 2
//! query_retry_max_secs = 1800
//!
//! [engine]
//! program = "mapchain-engine"
//!
//! [batch]
//! sbatch_cmd = "sbatch"
//! sacct_cmd = "sacct"
//! partition = "long"
//!
//! [notify]
//! email = "someone@example.org"
//!
//! [log]
//! level = "info"
//! json = false
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use crate::errors::ConfigError;

/// Name of the configuration file inside a chain directory.
pub const CHAIN_TOML: &str = "chain.toml";

/// Execution backend for relaxation steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Use the batch queue when one is available, otherwise run locally
    #[default]
    Auto,
    /// Run the engine in-process, one step at a time
    Local,
    /// Submit relaxations to the batch queue as job arrays
    Batch,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Auto => write!(f, "auto"),
            BackendKind::Local => write!(f, "local"),
            BackendKind::Batch => write!(f, "batch"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(BackendKind::Auto),
            "local" => Ok(BackendKind::Local),
            "batch" | "slurm" => Ok(BackendKind::Batch),
            _ => anyhow::bail!("Invalid backend '{}'. Valid values: auto, local, batch", s),
        }
    }
}

/// `[chain]` section: what the chain computes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSection {
    /// Number of optimizations per relaxation
    #[serde(default = "default_optimizations")]
    pub optimizations: u32,
    /// Map dimensionality
    #[serde(default = "default_dimensions")]
    pub dimensions: u32,
    /// Minimum column basis policy passed to the engine
    #[serde(default = "default_minimum_column_basis")]
    pub minimum_column_basis: String,
    /// How many best projections each relaxation keeps
    #[serde(default = "default_keep_projections")]
    pub keep_projections: u32,
    /// Create incremental steps
    #[serde(default = "default_true")]
    pub incremental: bool,
    /// Create scratch steps for tables after the first
    #[serde(default = "default_true")]
    pub scratch: bool,
}

fn default_optimizations() -> u32 {
    100
}

fn default_dimensions() -> u32 {
    2
}

fn default_minimum_column_basis() -> String {
    "none".to_string()
}

fn default_keep_projections() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for ChainSection {
    fn default() -> Self {
        Self {
            optimizations: default_optimizations(),
            dimensions: default_dimensions(),
            minimum_column_basis: default_minimum_column_basis(),
            keep_projections: default_keep_projections(),
            incremental: true,
            scratch: true,
        }
    }
}

/// `[backend]` section: how relaxations are executed and polled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSection {
    #[serde(default)]
    pub kind: BackendKind,
    /// Optimizations per batch sub-job
    #[serde(default = "default_optimizations_per_run")]
    pub optimizations_per_run: u32,
    /// Seconds to sleep between polls when nothing is ready
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Consecutive failure reports required before a batch step is failed
    #[serde(default = "default_failure_confirmations")]
    pub failure_confirmations: u32,
    /// Upper bound of the backoff after scheduler query errors
    #[serde(default = "default_query_retry_max_secs")]
    pub query_retry_max_secs: u64,
}

fn default_optimizations_per_run() -> u32 {
    10
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_failure_confirmations() -> u32 {
    2
}

fn default_query_retry_max_secs() -> u64 {
    1800
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            optimizations_per_run: default_optimizations_per_run(),
            poll_interval_secs: default_poll_interval_secs(),
            failure_confirmations: default_failure_confirmations(),
            query_retry_max_secs: default_query_retry_max_secs(),
        }
    }
}

/// `[engine]` section: the external optimization program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_engine_program")]
    pub program: String,
}

fn default_engine_program() -> String {
    "mapchain-engine".to_string()
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            program: default_engine_program(),
        }
    }
}

/// `[batch]` section: Slurm commands and submission options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSection {
    #[serde(default = "default_sbatch_cmd")]
    pub sbatch_cmd: String,
    #[serde(default = "default_sacct_cmd")]
    pub sacct_cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    /// Additional arguments passed to sbatch verbatim
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_sbatch_cmd() -> String {
    "sbatch".to_string()
}

fn default_sacct_cmd() -> String {
    "sacct".to_string()
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            sbatch_cmd: default_sbatch_cmd(),
            sacct_cmd: default_sacct_cmd(),
            partition: None,
            extra_args: Vec::new(),
        }
    }
}

/// `[notify]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifySection {
    /// Recipient of the completion/failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default = "default_mail_cmd")]
    pub mail_cmd: String,
}

fn default_mail_cmd() -> String {
    "mail".to_string()
}

impl Default for NotifySection {
    fn default() -> Self {
        Self {
            email: None,
            mail_cmd: default_mail_cmd(),
        }
    }
}

/// `[log]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// The complete chain.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainToml {
    #[serde(default)]
    pub chain: ChainSection,
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub batch: BatchSection,
    #[serde(default)]
    pub notify: NotifySection,
    #[serde(default)]
    pub log: LogSection,
}

/// Command-line overrides, applied last.
#[derive(Debug, Clone, Default)]
pub struct ChainOverrides {
    pub optimizations: Option<u32>,
    pub dimensions: Option<u32>,
    pub minimum_column_basis: Option<String>,
    pub keep_projections: Option<u32>,
    pub no_incremental: bool,
    pub no_scratch: bool,
    pub backend: Option<BackendKind>,
    pub optimizations_per_run: Option<u32>,
    pub poll_interval_secs: Option<u64>,
    pub notify: Option<String>,
    pub log_json: bool,
}

impl ChainToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse chain.toml")
    }

    /// Load `chain.toml` from the chain directory, or defaults if absent.
    pub fn load_or_default(chain_dir: &Path) -> Result<Self> {
        let config_path = chain_dir.join(CHAIN_TOML);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize chain.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `MAPCHAIN_*` environment variables.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply environment-style overrides from an arbitrary lookup.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("MAPCHAIN_OPTIMIZATIONS") {
            self.chain.optimizations = v
                .parse()
                .with_context(|| format!("Invalid MAPCHAIN_OPTIMIZATIONS: {}", v))?;
        }
        if let Some(v) = lookup("MAPCHAIN_BACKEND") {
            self.backend.kind = v.parse()?;
        }
        if let Some(v) = lookup("MAPCHAIN_ENGINE") {
            self.engine.program = v;
        }
        if let Some(v) = lookup("MAPCHAIN_NOTIFY") {
            self.notify.email = Some(v);
        }
        if let Some(v) = lookup("MAPCHAIN_LOG") {
            self.log.level = v;
        }
        Ok(())
    }

    /// Apply command-line overrides.
    pub fn apply_overrides(&mut self, overrides: &ChainOverrides) {
        if let Some(n) = overrides.optimizations {
            self.chain.optimizations = n;
        }
        if let Some(n) = overrides.dimensions {
            self.chain.dimensions = n;
        }
        if let Some(ref mcb) = overrides.minimum_column_basis {
            self.chain.minimum_column_basis = mcb.clone();
        }
        if let Some(n) = overrides.keep_projections {
            self.chain.keep_projections = n;
        }
        if overrides.no_incremental {
            self.chain.incremental = false;
        }
        if overrides.no_scratch {
            self.chain.scratch = false;
        }
        if let Some(kind) = overrides.backend {
            self.backend.kind = kind;
        }
        if let Some(n) = overrides.optimizations_per_run {
            self.backend.optimizations_per_run = n;
        }
        if let Some(secs) = overrides.poll_interval_secs {
            self.backend.poll_interval_secs = secs;
        }
        if let Some(ref email) = overrides.notify {
            self.notify.email = Some(email.clone());
        }
        if overrides.log_json {
            self.log.json = true;
        }
    }

    /// The chain-level settings the scheduler persists and checks.
    pub fn chain_config(&self) -> ChainConfig {
        ChainConfig {
            optimizations: self.chain.optimizations,
            dimensions: self.chain.dimensions,
            minimum_column_basis: self.chain.minimum_column_basis.clone(),
            keep_projections: self.chain.keep_projections,
            incremental: self.chain.incremental,
            scratch: self.chain.scratch,
            backend: self.backend.kind,
            optimizations_per_run: self.backend.optimizations_per_run,
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Err(e) = self.chain_config().validate() {
            warnings.push(e.to_string());
        }
        if self.backend.poll_interval_secs == 0 {
            warnings.push("poll_interval_secs is 0: the driver will poll without sleeping".to_string());
        }
        if self.backend.failure_confirmations == 0 {
            warnings.push("failure_confirmations is 0: treated as 1".to_string());
        }
        if self.backend.optimizations_per_run > self.chain.optimizations {
            warnings.push(format!(
                "optimizations_per_run ({}) exceeds optimizations ({}): batch jobs will have a single task",
                self.backend.optimizations_per_run, self.chain.optimizations
            ));
        }

        warnings
    }
}

/// Global chain settings, persisted in the `setup` section of the state file.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainConfig {
    pub optimizations: u32,
    pub dimensions: u32,
    pub minimum_column_basis: String,
    pub keep_projections: u32,
    pub incremental: bool,
    pub scratch: bool,
    pub backend: BackendKind,
    pub optimizations_per_run: u32,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainToml::default().chain_config()
    }
}

/// A persisted setting and whether it may change between invocations.
#[derive(Debug, Clone, PartialEq)]
pub struct Setting {
    pub name: &'static str,
    pub value: Value,
    pub mutable: bool,
}

impl ChainConfig {
    /// Reject configurations the chain cannot be built with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.incremental && !self.scratch {
            return Err(ConfigError::NoBranchEnabled);
        }
        for (name, value) in [
            ("number_of_optimizations", self.optimizations),
            ("number_of_dimensions", self.dimensions),
            ("keep_projections", self.keep_projections),
            ("optimizations_per_run", self.optimizations_per_run),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    name: name.to_string(),
                    message: "must be greater than 0".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Settings in the order they are reconciled against the state file.
    pub fn settings(&self) -> Vec<Setting> {
        vec![
            Setting {
                name: "number_of_optimizations",
                value: Value::from(self.optimizations),
                mutable: true,
            },
            Setting {
                name: "keep_projections",
                value: Value::from(self.keep_projections),
                mutable: true,
            },
            Setting {
                name: "backend",
                value: Value::from(self.backend.to_string()),
                mutable: true,
            },
            Setting {
                name: "optimizations_per_run",
                value: Value::from(self.optimizations_per_run),
                mutable: true,
            },
            Setting {
                name: "number_of_dimensions",
                value: Value::from(self.dimensions),
                mutable: false,
            },
            Setting {
                name: "minimum_column_basis",
                value: Value::from(self.minimum_column_basis.clone()),
                mutable: false,
            },
            Setting {
                name: "incremental",
                value: Value::from(self.incremental),
                mutable: false,
            },
            Setting {
                name: "scratch",
                value: Value::from(self.scratch),
                mutable: false,
            },
        ]
    }
}
