//! End-to-end chain runs against a fake engine and a scripted scheduler.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::{TempDir, tempdir};
use tokio::sync::watch;

use mapchain::batch::{BatchScheduler, JobArraySpec, JobStatus};
use mapchain::chain::{ChainDriver, ChainOutcome, ChainState, DriverSettings, StepFactory, StepState};
use mapchain::chain_config::ChainConfig;
use mapchain::engine::{Engine, RelaxRequest};
use mapchain::errors::{BackendError, ChainError, ConfigError};
use mapchain::processor::{BatchProcessor, BatchSettings, LocalProcessor, Processor};
use mapchain::store::StateStore;
use mapchain::table::{Table, scan_tables};

/// Writes every requested output and scores relaxations from a table of
/// qualities keyed by output file stem.
#[derive(Default)]
struct FakeEngine {
    qualities: HashMap<String, f64>,
    failing: Option<String>,
    calls: Mutex<Vec<String>>,
}

impl FakeEngine {
    fn with_qualities(pairs: &[(&str, f64)]) -> Self {
        Self {
            qualities: pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            ..Default::default()
        }
    }

    fn failing(step: &str) -> Self {
        Self {
            failing: Some(step.to_string()),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, output: &Path) -> Result<String> {
        let stem = output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.calls.lock().unwrap().push(stem.clone());
        if self.failing.as_deref() == Some(stem.as_str()) {
            anyhow::bail!("cannot relax {}", stem);
        }
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(output, &stem)?;
        Ok(stem)
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn relax(&self, request: &RelaxRequest) -> Result<f64> {
        let stem = self.record(&request.output)?;
        Ok(self.qualities.get(&stem).copied().unwrap_or(1.0))
    }

    async fn merge(&self, _master: &Path, _addition: &Path, output: &Path) -> Result<()> {
        self.record(output)?;
        Ok(())
    }

    async fn combine(&self, _partials: &[PathBuf], output: &Path, _keep: u32) -> Result<f64> {
        let stem = self.record(output)?;
        Ok(self.qualities.get(&stem).copied().unwrap_or(1.0))
    }

    fn relax_argv(&self, request: &RelaxRequest) -> Vec<String> {
        vec![
            "relax".to_string(),
            request.output.to_string_lossy().into_owned(),
        ]
    }
}

/// Runs every task at submission by writing its output, then answers status
/// queries from a script; an exhausted script reports the job as done.
#[derive(Default)]
struct ScriptedScheduler {
    statuses: Mutex<VecDeque<Result<JobStatus, BackendError>>>,
    submitted: Mutex<Vec<JobArraySpec>>,
}

impl ScriptedScheduler {
    fn with_statuses(statuses: Vec<Result<JobStatus, BackendError>>) -> Self {
        Self {
            statuses: Mutex::new(statuses.into()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl BatchScheduler for ScriptedScheduler {
    async fn submit(&self, spec: &JobArraySpec) -> Result<String, BackendError> {
        std::fs::create_dir_all(&spec.dir).map_err(|e| BackendError::Other(e.into()))?;
        for task in &spec.tasks {
            if let Some(output) = task.last() {
                std::fs::write(output, "part").map_err(|e| BackendError::Other(e.into()))?;
            }
        }
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(spec.clone());
        Ok(format!("{}", 1000 + submitted.len()))
    }

    async fn status(&self, _job: &str, tasks: usize) -> Result<JobStatus, BackendError> {
        self.statuses.lock().unwrap().pop_front().unwrap_or(Ok(JobStatus {
            total: tasks,
            completed: tasks,
            failed: 0,
        }))
    }
}

struct Chain {
    dir: TempDir,
    tables: Vec<Table>,
}

impl Chain {
    fn new(dates: &[&str]) -> Self {
        let dir = tempdir().unwrap();
        let paths: Vec<PathBuf> = dates
            .iter()
            .map(|date| {
                let path = dir.path().join(format!("h3-hint-{}.ace", date));
                std::fs::write(&path, "table").unwrap();
                path
            })
            .collect();
        let tables = scan_tables(&paths).unwrap();
        Self { dir, tables }
    }

    fn state_file(&self) -> PathBuf {
        self.dir.path().join("state.json")
    }

    fn output_dir(&self) -> PathBuf {
        self.dir.path().join("out")
    }

    fn driver(
        &self,
        tables: &[Table],
        config: &ChainConfig,
        processor: Arc<dyn Processor>,
    ) -> Result<ChainDriver, ChainError> {
        let mut store = StateStore::open(&self.state_file())?;
        store.reconcile(tables, config, &self.output_dir())?;
        ChainDriver::new(
            store,
            processor,
            config.clone(),
            DriverSettings {
                poll_interval: Duration::from_millis(5),
            },
        )
    }

    async fn run_local(
        &self,
        tables: &[Table],
        config: &ChainConfig,
        engine: &Arc<FakeEngine>,
    ) -> Result<ChainOutcome, ChainError> {
        let processor = Arc::new(LocalProcessor::new(engine.clone()));
        self.driver(tables, config, processor)?.run().await
    }

    fn store(&self) -> StateStore {
        StateStore::open(&self.state_file()).unwrap()
    }
}

fn report_state(outcome: &ChainOutcome, id: &str) -> Option<StepState> {
    outcome
        .summary
        .steps
        .iter()
        .find(|s| s.id == id)
        .map(|s| s.state)
}

fn master_of(outcome: &ChainOutcome, id: &str) -> Option<String> {
    outcome
        .summary
        .steps
        .iter()
        .find(|s| s.id == id)
        .and_then(|s| s.master.clone())
}

#[tokio::test]
async fn test_three_tables_build_seven_steps() {
    let chain = Chain::new(&["20200101", "20200201", "20200301"]);
    let config = ChainConfig::default();
    let engine = Arc::new(FakeEngine::default());

    let outcome = chain.run_local(&chain.tables, &config, &engine).await.unwrap();

    assert_eq!(outcome.state, ChainState::Completed);
    assert_eq!(outcome.summary.total, 7);
    assert_eq!(outcome.summary.completed, 7);
    let ids: Vec<&str> = outcome.summary.steps.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(
        ids,
        vec![
            "0.scratch.20200101",
            "1.merge.20200201",
            "1.incremental.20200201",
            "1.scratch.20200201",
            "2.merge.20200301",
            "2.incremental.20200301",
            "2.scratch.20200301",
        ]
    );
    assert_eq!(engine.calls().len(), 7);
    assert_eq!(
        master_of(&outcome, "1.merge.20200201").as_deref(),
        Some("0.scratch.20200101")
    );
    assert!(chain.output_dir().join("2.scratch.20200301.ace").exists());

    let store = chain.store();
    let merge = store.steps().get("2.merge.20200301").unwrap();
    assert_eq!(merge.path, "20200101:20200201:20200301");
    assert_eq!(
        merge.depends,
        vec!["1.incremental.20200201", "1.scratch.20200201"]
    );
}

#[test]
fn test_step_count_formula() {
    for n in 1..6 {
        let chain = Chain::new(&["20200101", "20200201", "20200301", "20200401", "20200501"][..n]);
        for (incremental, scratch) in [(true, true), (true, false), (false, true)] {
            let config = ChainConfig {
                incremental,
                scratch,
                ..ChainConfig::default()
            };
            let steps = StepFactory::new(&chain.tables, &config, &chain.output_dir())
                .build()
                .unwrap();
            let branches = usize::from(incremental) + usize::from(scratch);
            assert_eq!(steps.len(), 1 + (n - 1) * (1 + branches));
            assert_eq!(steps.len(), StepFactory::expected_len(n, &config));
        }
    }
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let chain = Chain::new(&["20200101", "20200201"]);
    let config = ChainConfig::default();

    let first = Arc::new(FakeEngine::default());
    chain.run_local(&chain.tables, &config, &first).await.unwrap();
    assert_eq!(first.calls().len(), 4);

    let second = Arc::new(FakeEngine::default());
    let outcome = chain.run_local(&chain.tables, &config, &second).await.unwrap();
    assert_eq!(outcome.state, ChainState::Completed);
    assert_eq!(outcome.summary.completed, 4);
    assert!(second.calls().is_empty());
}

#[tokio::test]
async fn test_new_table_resumes_chain() {
    let chain = Chain::new(&["20200101", "20200201", "20200301"]);
    let config = ChainConfig::default();

    let first = Arc::new(FakeEngine::default());
    chain
        .run_local(&chain.tables[..2], &config, &first)
        .await
        .unwrap();

    let second = Arc::new(FakeEngine::default());
    let outcome = chain.run_local(&chain.tables, &config, &second).await.unwrap();

    assert_eq!(outcome.state, ChainState::Completed);
    assert_eq!(outcome.summary.total, 7);
    let mut calls = second.calls();
    calls.sort();
    assert_eq!(
        calls,
        vec![
            "2.incremental.20200301",
            "2.merge.20200301",
            "2.scratch.20200301",
        ]
    );
}

#[tokio::test]
async fn test_lower_quality_becomes_master() {
    let chain = Chain::new(&["20200101", "20200201", "20200301"]);
    let config = ChainConfig::default();
    let engine = Arc::new(FakeEngine::with_qualities(&[
        ("1.incremental.20200201", 0.41),
        ("1.scratch.20200201", 0.39),
    ]));

    let outcome = chain.run_local(&chain.tables, &config, &engine).await.unwrap();

    assert_eq!(
        master_of(&outcome, "2.merge.20200301").as_deref(),
        Some("1.scratch.20200201")
    );
    let best = outcome.summary.best.get("20200201").unwrap();
    assert_eq!(best.step, "1.scratch.20200201");
    assert_eq!(best.quality, 0.39);
}

#[tokio::test]
async fn test_quality_tie_prefers_incremental() {
    let chain = Chain::new(&["20200101", "20200201", "20200301"]);
    let config = ChainConfig::default();
    let engine = Arc::new(FakeEngine::with_qualities(&[
        ("1.incremental.20200201", 0.4),
        ("1.scratch.20200201", 0.4),
    ]));

    let outcome = chain.run_local(&chain.tables, &config, &engine).await.unwrap();

    assert_eq!(
        master_of(&outcome, "2.merge.20200301").as_deref(),
        Some("1.incremental.20200201")
    );
}

#[tokio::test]
async fn test_failure_stops_chain() {
    let chain = Chain::new(&["20200101", "20200201", "20200301"]);
    let config = ChainConfig::default();
    let engine = Arc::new(FakeEngine::failing("1.incremental.20200201"));

    let outcome = chain.run_local(&chain.tables, &config, &engine).await.unwrap();

    assert_eq!(outcome.state, ChainState::Failed);
    assert_eq!(outcome.summary.failed, 1);
    assert_eq!(
        report_state(&outcome, "1.incremental.20200201"),
        Some(StepState::Failed)
    );
    assert_eq!(
        report_state(&outcome, "2.merge.20200301"),
        Some(StepState::NotReady)
    );
    assert!(!engine.calls().iter().any(|c| c.starts_with("2.")));

    let store = chain.store();
    let failed = store.steps().get("1.incremental.20200201").unwrap();
    assert!(failed.failed);
    assert!(failed.error.as_deref().unwrap().contains("cannot relax"));

    // The failure is persisted: a rerun does nothing.
    let rerun = Arc::new(FakeEngine::default());
    let processor = Arc::new(LocalProcessor::new(rerun.clone()));
    let driver = chain.driver(&chain.tables, &config, processor).unwrap();
    assert!(driver.is_failed());
    assert!(!driver.has_todo());
    let outcome = driver.run().await.unwrap();
    assert_eq!(outcome.state, ChainState::Failed);
    assert!(rerun.calls().is_empty());
}

#[tokio::test]
async fn test_failed_merge_blocks_its_relaxations() {
    let chain = Chain::new(&["20200101", "20200201", "20200301"]);
    let config = ChainConfig::default();
    let engine = Arc::new(FakeEngine::failing("1.merge.20200201"));

    let outcome = chain.run_local(&chain.tables, &config, &engine).await.unwrap();

    assert_eq!(outcome.state, ChainState::Failed);
    assert_eq!(
        report_state(&outcome, "1.merge.20200201"),
        Some(StepState::Failed)
    );
    for id in ["1.incremental.20200201", "1.scratch.20200201", "2.merge.20200301"] {
        assert_eq!(report_state(&outcome, id), Some(StepState::NotReady), "{}", id);
    }
    assert_eq!(engine.calls(), vec!["0.scratch.20200101", "1.merge.20200201"]);

    let rerun = Arc::new(FakeEngine::default());
    let processor = Arc::new(LocalProcessor::new(rerun.clone()));
    let driver = chain.driver(&chain.tables, &config, processor).unwrap();
    assert!(driver.is_failed());
    assert!(!driver.has_todo());
    assert_eq!(
        driver.state_of("1.incremental.20200201"),
        Some(StepState::NotReady)
    );
    assert_eq!(
        driver.state_of("1.scratch.20200201"),
        Some(StepState::NotReady)
    );
    driver.run().await.unwrap();
    assert!(rerun.calls().is_empty());
}

#[tokio::test]
async fn test_dimensions_cannot_change() {
    let chain = Chain::new(&["20200101", "20200201"]);
    let two = ChainConfig {
        dimensions: 2,
        ..ChainConfig::default()
    };
    let engine = Arc::new(FakeEngine::default());
    chain.run_local(&chain.tables, &two, &engine).await.unwrap();

    let three = ChainConfig {
        dimensions: 3,
        ..ChainConfig::default()
    };
    let err = chain
        .run_local(&chain.tables, &three, &engine)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ChainError::Config(ConfigError::ImmutableSetting { ref name, .. }) if name == "number_of_dimensions"
    ));
    assert_eq!(
        chain.store().setting("number_of_dimensions"),
        Some(&json!(2))
    );
}

#[tokio::test]
async fn test_optimizations_may_change() {
    let chain = Chain::new(&["20200101"]);
    let engine = Arc::new(FakeEngine::default());
    chain
        .run_local(&chain.tables, &ChainConfig::default(), &engine)
        .await
        .unwrap();

    let more = ChainConfig {
        optimizations: 500,
        ..ChainConfig::default()
    };
    chain.run_local(&chain.tables, &more, &engine).await.unwrap();
    assert_eq!(
        chain.store().setting("number_of_optimizations"),
        Some(&json!(500))
    );
}

#[tokio::test]
async fn test_shutdown_before_start() {
    let chain = Chain::new(&["20200101", "20200201"]);
    let config = ChainConfig::default();
    let engine = Arc::new(FakeEngine::default());
    let (tx, rx) = watch::channel(true);

    let processor = Arc::new(LocalProcessor::new(engine.clone()));
    let outcome = chain
        .driver(&chain.tables, &config, processor)
        .unwrap()
        .with_shutdown(rx)
        .run()
        .await
        .unwrap();
    drop(tx);

    assert_eq!(outcome.state, ChainState::Interrupted);
    assert!(engine.calls().is_empty());
}

fn batch_processor(
    chain: &Chain,
    engine: &Arc<FakeEngine>,
    scheduler: &Arc<ScriptedScheduler>,
    failure_confirmations: u32,
) -> Arc<BatchProcessor> {
    Arc::new(BatchProcessor::new(
        engine.clone(),
        scheduler.clone(),
        chain.dir.path().join("batch"),
        BatchSettings {
            poll_interval: Duration::from_millis(5),
            failure_confirmations,
            query_retry_max: Duration::from_millis(20),
            progress_interval: Duration::from_secs(300),
        },
    ))
}

#[tokio::test]
async fn test_batch_chain_completes() {
    let chain = Chain::new(&["20200101", "20200201"]);
    let config = ChainConfig {
        optimizations: 10,
        optimizations_per_run: 4,
        ..ChainConfig::default()
    };
    let engine = Arc::new(FakeEngine::with_qualities(&[("1.scratch.20200201", 0.3)]));
    let scheduler = Arc::new(ScriptedScheduler::with_statuses(vec![
        Ok(JobStatus {
            total: 3,
            completed: 1,
            failed: 0,
        }),
        Err(BackendError::Parse("sacct hiccup".to_string())),
    ]));

    let processor = batch_processor(&chain, &engine, &scheduler, 2);
    let outcome = chain
        .driver(&chain.tables, &config, processor)
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.state, ChainState::Completed);
    assert_eq!(outcome.summary.completed, 4);

    let submitted = scheduler.submitted.lock().unwrap();
    assert_eq!(submitted.len(), 3);
    assert_eq!(submitted[0].name, "mapchain-0.scratch.20200101");
    assert_eq!(submitted[0].tasks.len(), 3);

    // Merges run in-process; relaxations are combined from their partials.
    let mut calls = engine.calls();
    calls.sort();
    assert_eq!(
        calls,
        vec![
            "0.scratch.20200101",
            "1.incremental.20200201",
            "1.merge.20200201",
            "1.scratch.20200201",
        ]
    );
    assert_eq!(
        outcome.summary.best.get("20200201").map(|b| b.quality),
        Some(0.3)
    );

    let store = chain.store();
    assert!(store.steps().iter().all(|s| s.batch.is_none()));
}

#[tokio::test]
async fn test_batch_failure_needs_confirmation() {
    let chain = Chain::new(&["20200101", "20200201"]);
    let config = ChainConfig {
        optimizations: 4,
        optimizations_per_run: 4,
        ..ChainConfig::default()
    };
    let failed = || {
        Ok(JobStatus {
            total: 1,
            completed: 0,
            failed: 1,
        })
    };
    let engine = Arc::new(FakeEngine::default());
    let scheduler = Arc::new(ScriptedScheduler::with_statuses(vec![failed(), failed()]));

    let processor = batch_processor(&chain, &engine, &scheduler, 2);
    let outcome = chain
        .driver(&chain.tables, &config, processor)
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.state, ChainState::Failed);
    assert_eq!(
        report_state(&outcome, "0.scratch.20200101"),
        Some(StepState::Failed)
    );
    assert!(engine.calls().is_empty());

    let store = chain.store();
    let step = store.steps().get("0.scratch.20200101").unwrap();
    assert!(step.batch.is_none());
    assert!(step.error.as_deref().unwrap().contains("1001"));
}

#[tokio::test]
async fn test_batch_job_survives_restart() {
    let chain = Chain::new(&["20200101"]);
    let config = ChainConfig {
        optimizations: 4,
        optimizations_per_run: 2,
        ..ChainConfig::default()
    };
    let engine = Arc::new(FakeEngine::default());
    let pending = Arc::new(ScriptedScheduler::with_statuses(vec![Ok(JobStatus {
        total: 2,
        completed: 0,
        failed: 0,
    })]));

    // Submit, poll once, then stop as if the process were killed.
    let processor = batch_processor(&chain, &engine, &pending, 1);
    let mut driver = chain.driver(&chain.tables, &config, processor).unwrap();
    assert_eq!(driver.run_ready().await.unwrap(), 1);
    assert!(!driver.check_running().await.unwrap());
    assert!(driver.is_running());
    drop(driver);

    let store = chain.store();
    let job = store.steps().get("0.scratch.20200101").unwrap().batch.clone().unwrap();
    assert_eq!(job.job_id, "1001");
    assert_eq!(job.outputs.len(), 2);

    let resumed = Arc::new(ScriptedScheduler::default());
    let processor = batch_processor(&chain, &engine, &resumed, 1);
    let outcome = chain
        .driver(&chain.tables, &config, processor)
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.state, ChainState::Completed);
    assert!(resumed.submitted.lock().unwrap().is_empty());
    assert_eq!(engine.calls(), vec!["0.scratch.20200101"]);
}
