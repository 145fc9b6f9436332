//! Typed error hierarchy for the chain scheduler.
//!
//! Four enums cover the failure domains:
//! - `ConfigError`: fatal problems detected before any step runs
//! - `StepError`: per-step execution failures, recorded on the step as `failed`
//! - `BackendError`: batch scheduler submission/query failures
//! - `ChainError`: everything that aborts a chain invocation

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors. Always fatal; raised before the chain starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Table {path} does not exist")]
    MissingTable { path: PathBuf },

    #[error("Cannot extract a date token from table name {path}")]
    NoDateToken { path: PathBuf },

    #[error("Table date {date} of {path} is already in the chain")]
    DuplicateDate { date: String, path: PathBuf },

    #[error("No tables given")]
    NoTables,

    #[error("At least one of the incremental and scratch branches must be enabled")]
    NoBranchEnabled,

    #[error("Cannot create a {kind} step for table 0")]
    NoPredecessor { kind: String },

    #[error("Cannot change {name} from {old} to {new}")]
    ImmutableSetting {
        name: String,
        old: String,
        new: String,
    },

    #[error("Step {id} already in the chain has path {stored:?}, expected {expected:?}")]
    StepPathMismatch {
        id: String,
        stored: String,
        expected: String,
    },

    #[error("Duplicate step id {id}")]
    DuplicateStep { id: String },

    #[error("Step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: String, dependency: String },

    #[error("Invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
}

/// Errors from running or polling a single step.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("Engine failed: {0}")]
    Engine(#[source] anyhow::Error),

    #[error("Batch submission failed: {0}")]
    Submission(#[source] BackendError),

    #[error("Batch job {job} reported {failed} failed task(s)")]
    JobFailed { job: String, failed: usize },

    #[error("Step produced no output at {path}")]
    MissingOutput { path: PathBuf },

    #[error("Step {step} has no input in slot {slot}")]
    MissingInput { step: String, slot: usize },

    #[error("Step {step} declares no output")]
    NoOutput { step: String },
}

/// Errors talking to the batch scheduler.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Unexpected scheduler output: {0}")]
    Parse(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors that abort a chain invocation.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("State file {path}: {source}")]
    StateIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("State file {path} is corrupt: {source}")]
    StateCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ChainError {
    /// Whether this error was caused by the chain's configuration or inputs.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}
