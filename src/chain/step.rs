//! Step model: one schedulable unit of work in a chain.
//!
//! Every step shares a common header (id, provenance, dependencies, inputs,
//! outputs, timestamps). What differs per kind lives in [`StepDetail`], and
//! the run contract is dispatched on it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::chain_config::ChainConfig;
use crate::errors::StepError;
use crate::processor::{BatchJob, Launch, Processor};

/// The three kinds of step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// Relax the input map from random starting configurations
    Scratch,
    /// Merge the best map of the previous table with the next table
    Merge,
    /// Relax only the points the merge added
    Incremental,
}

impl StepKind {
    /// Position of the kind within one table's steps.
    pub fn rank(self) -> u8 {
        match self {
            StepKind::Merge => 0,
            StepKind::Incremental => 1,
            StepKind::Scratch => 2,
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepKind::Scratch => write!(f, "scratch"),
            StepKind::Merge => write!(f, "merge"),
            StepKind::Incremental => write!(f, "incremental"),
        }
    }
}

/// Result of a relaxation step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Relaxation {
    /// Quality score of the best projection, lower is better
    pub quality: Option<f64>,
}

/// Which predecessor a merge step took its master map from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeSource {
    pub master: Option<String>,
}

/// Kind-specific part of a step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepDetail {
    Scratch(Relaxation),
    Merge(MergeSource),
    Incremental(Relaxation),
}

impl StepDetail {
    pub fn new(kind: StepKind) -> Self {
        match kind {
            StepKind::Scratch => StepDetail::Scratch(Relaxation::default()),
            StepKind::Merge => StepDetail::Merge(MergeSource::default()),
            StepKind::Incremental => StepDetail::Incremental(Relaxation::default()),
        }
    }

    pub fn kind(&self) -> StepKind {
        match self {
            StepDetail::Scratch(_) => StepKind::Scratch,
            StepDetail::Merge(_) => StepKind::Merge,
            StepDetail::Incremental(_) => StepKind::Incremental,
        }
    }
}

/// Derived state of a step. Never stored; recomputed on every poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepState {
    Completed,
    Failed,
    Running,
    Ready,
    NotReady,
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepState::Completed => write!(f, "completed"),
            StepState::Failed => write!(f, "failed"),
            StepState::Running => write!(f, "running"),
            StepState::Ready => write!(f, "ready"),
            StepState::NotReady => write!(f, "not-ready"),
        }
    }
}

/// One step of the chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// `{table_index}.{kind}.{table_date}`
    pub id: String,
    pub table_index: usize,
    pub table_date: String,
    /// Colon-joined table dates up to this step's table
    pub path: String,
    /// Steps that must be completed before this one can run
    pub depends: Vec<String>,
    /// Input artifacts; slot 0 of a merge is filled in when it runs
    pub src: Vec<Option<PathBuf>>,
    /// Output artifacts
    pub out: Vec<PathBuf>,
    pub detail: StepDetail,
    /// Sticky failure flag
    pub failed: bool,
    pub error: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub finish: Option<DateTime<Utc>>,
    pub runtime: Option<Duration>,
    /// Batch job bookkeeping; advisory only
    pub batch: Option<BatchJob>,
    /// Keys found in the state file that this version does not know about
    pub extra: BTreeMap<String, Value>,
}

impl Step {
    /// Build the id of a step.
    pub fn make_id(table_index: usize, kind: StepKind, table_date: &str) -> String {
        format!("{}.{}.{}", table_index, kind, table_date)
    }

    pub fn new(table_index: usize, table_date: &str, kind: StepKind, path: String) -> Self {
        Self {
            id: Self::make_id(table_index, kind, table_date),
            table_index,
            table_date: table_date.to_string(),
            path,
            depends: Vec::new(),
            src: Vec::new(),
            out: Vec::new(),
            detail: StepDetail::new(kind),
            failed: false,
            error: None,
            start: None,
            finish: None,
            runtime: None,
            batch: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> StepKind {
        self.detail.kind()
    }

    /// Quality of a relaxation step; merges carry none.
    pub fn quality(&self) -> Option<f64> {
        match &self.detail {
            StepDetail::Scratch(r) | StepDetail::Incremental(r) => r.quality,
            StepDetail::Merge(_) => None,
        }
    }

    pub fn set_quality(&mut self, quality: f64) {
        if let StepDetail::Scratch(r) | StepDetail::Incremental(r) = &mut self.detail {
            r.quality = Some(quality);
        }
    }

    /// Fill slot 0 of a merge with the chosen predecessor's output.
    pub fn set_master(&mut self, from_step: &str, output: PathBuf) {
        if let StepDetail::Merge(m) = &mut self.detail {
            m.master = Some(from_step.to_string());
        }
        if self.src.is_empty() {
            self.src.push(None);
        }
        self.src[0] = Some(output);
    }

    /// Every declared output exists; a step without outputs is always complete.
    pub fn outputs_exist(&self) -> bool {
        self.out.iter().all(|p| p.exists())
    }

    pub fn mark_started(&mut self) {
        self.start = Some(Utc::now());
        self.finish = None;
        self.runtime = None;
    }

    pub fn mark_finished(&mut self) {
        let now = Utc::now();
        self.finish = Some(now);
        self.runtime = self.start.and_then(|start| (now - start).to_std().ok());
    }

    /// Record a failure. Once set, `failed` is never cleared.
    pub fn mark_failed(&mut self, error: &StepError) {
        self.failed = true;
        self.error = Some(error.to_string());
        self.batch = None;
        self.mark_finished();
    }

    fn input(&self, slot: usize) -> Result<PathBuf, StepError> {
        self.src
            .get(slot)
            .cloned()
            .flatten()
            .ok_or_else(|| StepError::MissingInput {
                step: self.id.clone(),
                slot,
            })
    }

    /// Run the step. Only valid when the step is ready.
    ///
    /// Synchronous backends finish the work here; the batch backend leaves
    /// the step running with a job handle that is polled later.
    pub async fn run(
        &mut self,
        processor: &dyn Processor,
        config: &ChainConfig,
    ) -> Result<(), StepError> {
        self.mark_started();
        self.error = None;

        let launch = match self.kind() {
            StepKind::Scratch => processor.relax_from_scratch(self, config).await?,
            StepKind::Incremental => processor.relax_incremental(self, config).await?,
            StepKind::Merge => {
                let master = self.input(0)?;
                let addition = self.input(1)?;
                processor
                    .merge_incremental(self, &master, &addition)
                    .await?;
                self.verify_outputs()?;
                self.mark_finished();
                return Ok(());
            }
        };

        match launch {
            Launch::Finished { quality } => {
                self.verify_outputs()?;
                self.set_quality(quality);
                self.mark_finished();
            }
            Launch::Submitted(job) => {
                self.batch = Some(job);
            }
        }
        Ok(())
    }

    fn verify_outputs(&self) -> Result<(), StepError> {
        match self.out.iter().find(|p| !p.exists()) {
            Some(missing) => Err(StepError::MissingOutput {
                path: missing.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Input artifact for a relaxation (slot 0).
    pub fn relax_input(&self) -> Result<PathBuf, StepError> {
        self.input(0)
    }

    /// Primary output artifact.
    pub fn primary_output(&self) -> Result<PathBuf, StepError> {
        self.out.first().cloned().ok_or_else(|| StepError::NoOutput {
            step: self.id.clone(),
        })
    }
}
