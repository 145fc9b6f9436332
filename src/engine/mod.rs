//! Interface to the map optimization engine.
//!
//! The engine relaxes, merges and combines antigenic maps. It is slow and
//! opaque; the scheduler only needs its quality scores and output files.

mod program;

pub use program::ProgramEngine;

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// How a relaxation starts.
#[derive(Debug, Clone, PartialEq)]
pub enum RelaxMode {
    /// Random starting configurations in `dimensions` dimensions
    Scratch {
        dimensions: u32,
        minimum_column_basis: String,
    },
    /// Only points without coordinates are placed and relaxed
    Incremental,
}

/// One relaxation request.
#[derive(Debug, Clone, PartialEq)]
pub struct RelaxRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub mode: RelaxMode,
    /// Number of optimization rounds
    pub optimizations: u32,
    /// Number of best projections kept in the output
    pub keep_projections: u32,
}

#[async_trait]
pub trait Engine: Send + Sync {
    /// Relax `request.input` into `request.output` and return the best quality score.
    async fn relax(&self, request: &RelaxRequest) -> Result<f64>;

    /// Merge `addition` into `master` for incremental relaxation.
    async fn merge(&self, master: &Path, addition: &Path, output: &Path) -> Result<()>;

    /// Combine partial relaxation results into one map keeping the best projections.
    async fn combine(&self, partials: &[PathBuf], output: &Path, keep_projections: u32)
    -> Result<f64>;

    /// Command line that performs `request` when run by a batch worker.
    fn relax_argv(&self, request: &RelaxRequest) -> Vec<String>;
}
