//! On-disk representation of the chain state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::chain::{MergeSource, Relaxation, Step, StepDetail, StepKind};
use crate::processor::BatchJob;

/// The whole state file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub setup: BTreeMap<String, Value>,
    #[serde(default)]
    pub steps: BTreeMap<String, StepRecord>,
    /// Step ids of the table list given on the last run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub active: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// One step as stored in the state file, keyed by its id.
///
/// Keys this version does not know are kept in `extra` and written back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    #[serde(rename = "_kind")]
    pub kind: StepKind,
    pub table_index: usize,
    pub table_date: String,
    pub path: String,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub src: Vec<Option<PathBuf>>,
    #[serde(default)]
    pub out: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,
    #[serde(default)]
    pub failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish: Option<DateTime<Utc>>,
    /// Seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_job: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub batch_outputs: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_submitted: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub batch_failure_reports: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub batch_poll_errors: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_next_poll: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl From<&Step> for StepRecord {
    fn from(step: &Step) -> Self {
        let (quality, master) = match &step.detail {
            StepDetail::Scratch(r) | StepDetail::Incremental(r) => (r.quality, None),
            StepDetail::Merge(m) => (None, m.master.clone()),
        };
        let job = step.batch.as_ref();
        Self {
            kind: step.kind(),
            table_index: step.table_index,
            table_date: step.table_date.clone(),
            path: step.path.clone(),
            depends: step.depends.clone(),
            src: step.src.clone(),
            out: step.out.clone(),
            quality,
            master,
            failed: step.failed,
            error: step.error.clone(),
            start: step.start,
            finish: step.finish,
            runtime: step.runtime.map(|d| d.as_secs_f64()),
            batch_job: job.map(|j| j.job_id.clone()),
            batch_dir: job.map(|j| j.dir.clone()),
            batch_outputs: job.map(|j| j.outputs.clone()).unwrap_or_default(),
            batch_submitted: job.map(|j| j.submitted),
            batch_failure_reports: job.map_or(0, |j| j.failure_reports),
            batch_poll_errors: job.map_or(0, |j| j.poll_errors),
            batch_next_poll: job.and_then(|j| j.next_poll),
            extra: step.extra.clone(),
        }
    }
}

impl StepRecord {
    pub fn into_step(self, id: String) -> Step {
        let detail = match self.kind {
            StepKind::Scratch => StepDetail::Scratch(Relaxation {
                quality: self.quality,
            }),
            StepKind::Incremental => StepDetail::Incremental(Relaxation {
                quality: self.quality,
            }),
            StepKind::Merge => StepDetail::Merge(MergeSource {
                master: self.master,
            }),
        };
        let batch = match (self.batch_job, self.batch_dir) {
            (Some(job_id), Some(dir)) => Some(BatchJob {
                job_id,
                dir,
                outputs: self.batch_outputs,
                submitted: self.batch_submitted.unwrap_or_else(Utc::now),
                failure_reports: self.batch_failure_reports,
                poll_errors: self.batch_poll_errors,
                next_poll: self.batch_next_poll,
                progress_logged: None,
            }),
            _ => None,
        };
        Step {
            id,
            table_index: self.table_index,
            table_date: self.table_date,
            path: self.path,
            depends: self.depends,
            src: self.src,
            out: self.out,
            detail,
            failed: self.failed,
            error: self.error,
            start: self.start,
            finish: self.finish,
            runtime: self
                .runtime
                .filter(|s| s.is_finite() && *s >= 0.0)
                .map(Duration::from_secs_f64),
            batch,
            extra: self.extra,
        }
    }
}
