//! Execution backends for step work.
//!
//! A [`Processor`] performs the expensive part of a step. The local backend
//! runs the engine in-process and finishes before returning; the batch
//! backend submits a job array and is polled until the job is done.

mod batch;
mod local;

pub use batch::{BatchJob, BatchProcessor, BatchSettings};
pub use local::LocalProcessor;

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::chain::Step;
use crate::chain_config::{BackendKind, ChainConfig};
use crate::engine::{RelaxMode, RelaxRequest};
use crate::errors::StepError;

/// What a relaxation launch did.
#[derive(Debug)]
pub enum Launch {
    /// The work finished with the given quality score
    Finished { quality: f64 },
    /// The work was handed to a batch scheduler
    Submitted(BatchJob),
}

/// Result of polling a running step.
#[derive(Debug)]
pub enum CheckOutcome {
    Unchanged,
    /// The step finished; its outputs and quality are recorded
    Changed,
    Failed(StepError),
}

#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the backend has outstanding work for the step.
    fn is_running(&self, step: &Step) -> bool;

    async fn relax_from_scratch(&self, step: &Step, config: &ChainConfig)
    -> Result<Launch, StepError>;

    async fn relax_incremental(&self, step: &Step, config: &ChainConfig)
    -> Result<Launch, StepError>;

    async fn merge_incremental(
        &self,
        step: &Step,
        master: &Path,
        addition: &Path,
    ) -> Result<(), StepError>;

    /// Poll a running step.
    async fn check(&self, step: &mut Step, config: &ChainConfig) -> CheckOutcome;

    /// Drop job bookkeeping that does not describe live work.
    ///
    /// Returns true when the step was modified.
    fn reconcile(&self, step: &mut Step) -> bool;
}

/// Relaxation request for a step's primary input and output.
pub(crate) fn relax_request(
    step: &Step,
    config: &ChainConfig,
    incremental: bool,
) -> Result<RelaxRequest, StepError> {
    let mode = if incremental {
        RelaxMode::Incremental
    } else {
        RelaxMode::Scratch {
            dimensions: config.dimensions,
            minimum_column_basis: config.minimum_column_basis.clone(),
        }
    };
    Ok(RelaxRequest {
        input: step.relax_input()?,
        output: step.primary_output()?,
        mode,
        optimizations: config.optimizations,
        keep_projections: config.keep_projections,
    })
}

/// Find an executable on `PATH`.
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Resolve `auto` to a concrete backend.
///
/// `auto` selects the batch backend when `sbatch_cmd` is available.
pub fn resolve_backend(kind: BackendKind, sbatch_cmd: &str) -> BackendKind {
    match kind {
        BackendKind::Auto => {
            let available = if Path::new(sbatch_cmd).components().count() > 1 {
                Path::new(sbatch_cmd).is_file()
            } else {
                find_in_path(sbatch_cmd).is_some()
            };
            if available {
                BackendKind::Batch
            } else {
                BackendKind::Local
            }
        }
        other => other,
    }
}
