use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{CheckOutcome, Launch, Processor, relax_request};
use crate::batch::{BatchScheduler, JobArraySpec};
use crate::chain::Step;
use crate::chain_config::{BackendSection, ChainConfig};
use crate::engine::{Engine, RelaxRequest};
use crate::errors::StepError;

/// Bookkeeping of a submitted job array.
///
/// Advisory: it is persisted with the step but dropped on load unless it
/// still describes live work.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchJob {
    /// Scheduler job handle
    pub job_id: String,
    /// Submission directory
    pub dir: PathBuf,
    /// Partial outputs, one per array task
    pub outputs: Vec<PathBuf>,
    pub submitted: DateTime<Utc>,
    /// Consecutive polls that reported failed tasks
    pub failure_reports: u32,
    /// Consecutive failed status queries
    pub poll_errors: u32,
    /// Earliest time of the next status query
    pub next_poll: Option<DateTime<Utc>>,
    pub progress_logged: Option<DateTime<Utc>>,
}

impl BatchJob {
    pub fn new(job_id: String, dir: PathBuf, outputs: Vec<PathBuf>) -> Self {
        Self {
            job_id,
            dir,
            outputs,
            submitted: Utc::now(),
            failure_reports: 0,
            poll_errors: 0,
            next_poll: None,
            progress_logged: None,
        }
    }
}

/// Polling policy of the batch backend.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub poll_interval: Duration,
    /// Consecutive failure reports needed before a step is failed
    pub failure_confirmations: u32,
    /// Upper bound of the query retry delay
    pub query_retry_max: Duration,
    pub progress_interval: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            failure_confirmations: 2,
            query_retry_max: Duration::from_secs(1800),
            progress_interval: Duration::from_secs(300),
        }
    }
}

impl BatchSettings {
    pub fn from_section(section: &BackendSection) -> Self {
        Self {
            poll_interval: Duration::from_secs(section.poll_interval_secs),
            failure_confirmations: section.failure_confirmations,
            query_retry_max: Duration::from_secs(section.query_retry_max_secs),
            ..Default::default()
        }
    }

    /// Delay before the next query after `errors` consecutive query errors.
    pub fn retry_delay(&self, errors: u32) -> Duration {
        let factor = 1u32 << errors.min(16);
        self.poll_interval
            .saturating_mul(factor)
            .min(self.query_retry_max)
    }
}

/// Distributes relaxations over a batch scheduler as job arrays.
pub struct BatchProcessor {
    engine: Arc<dyn Engine>,
    scheduler: Arc<dyn BatchScheduler>,
    batch_dir: PathBuf,
    settings: BatchSettings,
}

impl BatchProcessor {
    pub fn new(
        engine: Arc<dyn Engine>,
        scheduler: Arc<dyn BatchScheduler>,
        batch_dir: PathBuf,
        settings: BatchSettings,
    ) -> Self {
        Self {
            engine,
            scheduler,
            batch_dir,
            settings,
        }
    }

    /// Number of array tasks for a relaxation of `optimizations` rounds.
    pub fn task_count(optimizations: u32, per_run: u32) -> u32 {
        optimizations.div_ceil(per_run.max(1)).max(1)
    }

    async fn submit(
        &self,
        step: &Step,
        config: &ChainConfig,
        incremental: bool,
    ) -> Result<Launch, StepError> {
        let request = relax_request(step, config, incremental)?;
        let per_run = config.optimizations_per_run.min(config.optimizations).max(1);
        let count = Self::task_count(config.optimizations, per_run);
        let dir = self.batch_dir.join(&step.id);

        let outputs: Vec<PathBuf> = (0..count)
            .map(|i| dir.join(format!("part-{:03}.ace", i)))
            .collect();
        let tasks = outputs
            .iter()
            .map(|output| {
                self.engine.relax_argv(&RelaxRequest {
                    output: output.clone(),
                    optimizations: per_run,
                    ..request.clone()
                })
            })
            .collect();

        let spec = JobArraySpec {
            name: format!("mapchain-{}", step.id),
            dir: dir.clone(),
            tasks,
        };
        let job_id = self
            .scheduler
            .submit(&spec)
            .await
            .map_err(StepError::Submission)?;
        info!(step = %step.id, job = %job_id, tasks = count, per_run, "Submitted job array");
        Ok(Launch::Submitted(BatchJob::new(job_id, dir, outputs)))
    }

    async fn finish(&self, step: &mut Step, job: BatchJob, config: &ChainConfig) -> CheckOutcome {
        let output = match step.primary_output() {
            Ok(output) => output,
            Err(e) => return CheckOutcome::Failed(e),
        };
        if let Some(missing) = job.outputs.iter().find(|p| !p.exists()) {
            return CheckOutcome::Failed(StepError::MissingOutput {
                path: missing.clone(),
            });
        }
        match self
            .engine
            .combine(&job.outputs, &output, config.keep_projections)
            .await
        {
            Ok(_) if !output.exists() => CheckOutcome::Failed(StepError::MissingOutput { path: output }),
            Ok(quality) => {
                step.set_quality(quality);
                step.mark_finished();
                info!(step = %step.id, job = %job.job_id, quality, "Combined job array results");
                CheckOutcome::Changed
            }
            Err(e) => CheckOutcome::Failed(StepError::Engine(e)),
        }
    }
}

#[async_trait]
impl Processor for BatchProcessor {
    fn name(&self) -> &'static str {
        "batch"
    }

    fn is_running(&self, step: &Step) -> bool {
        step.batch.as_ref().is_some_and(|job| !job.job_id.is_empty())
    }

    async fn relax_from_scratch(
        &self,
        step: &Step,
        config: &ChainConfig,
    ) -> Result<Launch, StepError> {
        self.submit(step, config, false).await
    }

    async fn relax_incremental(
        &self,
        step: &Step,
        config: &ChainConfig,
    ) -> Result<Launch, StepError> {
        self.submit(step, config, true).await
    }

    async fn merge_incremental(
        &self,
        step: &Step,
        master: &Path,
        addition: &Path,
    ) -> Result<(), StepError> {
        let output = step.primary_output()?;
        info!(step = %step.id, master = %master.display(), "Merging");
        self.engine
            .merge(master, addition, &output)
            .await
            .map_err(StepError::Engine)
    }

    async fn check(&self, step: &mut Step, config: &ChainConfig) -> CheckOutcome {
        let now = Utc::now();
        let Some(job) = step.batch.as_mut() else {
            return CheckOutcome::Unchanged;
        };
        if job.next_poll.is_some_and(|at| now < at) {
            return CheckOutcome::Unchanged;
        }

        let status = match self.scheduler.status(&job.job_id, job.outputs.len()).await {
            Ok(status) => status,
            Err(e) => {
                job.poll_errors += 1;
                let delay = self.settings.retry_delay(job.poll_errors);
                job.next_poll = chrono::Duration::from_std(delay).ok().map(|d| now + d);
                warn!(
                    step = %step.id,
                    job = %job.job_id,
                    errors = job.poll_errors,
                    retry_in_secs = delay.as_secs(),
                    "Batch status query failed: {}",
                    e
                );
                return CheckOutcome::Unchanged;
            }
        };
        job.poll_errors = 0;
        job.next_poll = None;
        debug!(step = %step.id, job = %job.job_id, ?status, "Polled job array");

        if status.has_failures() {
            job.failure_reports += 1;
            if job.failure_reports < self.settings.failure_confirmations.max(1) {
                warn!(
                    step = %step.id,
                    job = %job.job_id,
                    failed = status.failed,
                    "Scheduler reports failed tasks, waiting for confirmation"
                );
                return CheckOutcome::Unchanged;
            }
            let job_id = job.job_id.clone();
            step.batch = None;
            return CheckOutcome::Failed(StepError::JobFailed {
                job: job_id,
                failed: status.failed,
            });
        }
        job.failure_reports = 0;

        if status.is_done() {
            let Some(job) = step.batch.take() else {
                return CheckOutcome::Unchanged;
            };
            return self.finish(step, job, config).await;
        }

        let last = job.progress_logged.unwrap_or(job.submitted);
        if (now - last).to_std().unwrap_or_default() >= self.settings.progress_interval {
            info!(
                step = %step.id,
                job = %job.job_id,
                "{:.0}% of tasks done",
                status.percent()
            );
            job.progress_logged = Some(now);
        }
        CheckOutcome::Unchanged
    }

    fn reconcile(&self, step: &mut Step) -> bool {
        let Some(job) = &step.batch else {
            return false;
        };
        let live = !job.job_id.is_empty()
            && !job.outputs.is_empty()
            && job.dir.is_dir()
            && !step.failed
            && !step.outputs_exist();
        if !live {
            debug!(step = %step.id, job = %job.job_id, "Dropping stale batch job");
            step.batch = None;
        }
        !live
    }
}
