//! Chain driver: polls steps and launches work until nothing is left to do.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::graph::Candidate;
use super::step::{Step, StepKind, StepState};
use super::summary::{ChainOutcome, ChainState, ChainSummary, ExecutionTimer};
use crate::chain_config::ChainConfig;
use crate::errors::ChainError;
use crate::processor::{CheckOutcome, Processor};
use crate::store::StateStore;

/// Events emitted while the chain runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChainEvent {
    Started {
        step: String,
    },
    /// Work was handed to the batch scheduler
    Submitted {
        step: String,
    },
    Completed {
        step: String,
        quality: Option<f64>,
    },
    Failed {
        step: String,
        error: String,
    },
    Finished {
        state: ChainState,
    },
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Sleep between passes that made no progress
    pub poll_interval: Duration,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// Pick the master map of a merge among its completed predecessors.
///
/// The lower quality score wins; on a tie the first listed candidate wins.
pub fn resolve_master(step: &str, candidates: &[Candidate]) -> Result<Candidate, ChainError> {
    match candidates {
        [only] => Ok(only.clone()),
        [first, second] => {
            let q1 = first.quality.unwrap_or(f64::INFINITY);
            let q2 = second.quality.unwrap_or(f64::INFINITY);
            let chosen = match q2.partial_cmp(&q1) {
                Some(Ordering::Less) => second,
                _ => first,
            };
            info!(
                step,
                first = %first.id,
                first_quality = q1,
                second = %second.id,
                second_quality = q2,
                chosen = %chosen.id,
                "Merge master selected"
            );
            Ok(chosen.clone())
        }
        _ => Err(ChainError::Internal(format!(
            "merge step {} has {} completed predecessors, expected 1 or 2",
            step,
            candidates.len()
        ))),
    }
}

/// Drives a chain to completion.
///
/// Each pass first polls running steps, then launches the steps that were
/// ready at the start of the pass. State is saved after every change. When a
/// pass neither launched nor changed anything the driver sleeps for the poll
/// interval.
pub struct ChainDriver {
    store: StateStore,
    processor: Arc<dyn Processor>,
    config: ChainConfig,
    settings: DriverSettings,
    shutdown: Option<watch::Receiver<bool>>,
    events: Option<mpsc::UnboundedSender<ChainEvent>>,
}

impl ChainDriver {
    /// Create a driver over a reconciled store.
    ///
    /// Job bookkeeping that the processor does not recognize as live is
    /// dropped before the first pass.
    pub fn new(
        mut store: StateStore,
        processor: Arc<dyn Processor>,
        config: ChainConfig,
        settings: DriverSettings,
    ) -> Result<Self, ChainError> {
        let mut stripped = false;
        for step in store.steps_mut().iter_mut() {
            stripped |= processor.reconcile(step);
        }
        if stripped {
            store.save()?;
        }
        Ok(Self {
            store,
            processor,
            config,
            settings,
            shutdown: None,
            events: None,
        })
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<ChainEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn into_store(self) -> StateStore {
        self.store
    }

    fn emit(&self, event: ChainEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn interrupted(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    fn is_running_fn(&self) -> impl Fn(&Step) -> bool + '_ {
        move |step: &Step| self.processor.is_running(step)
    }

    pub fn state_of(&self, id: &str) -> Option<StepState> {
        self.store.steps().state(id, &self.is_running_fn())
    }

    fn active_in_state(&self, wanted: StepState) -> Vec<String> {
        self.store
            .active_ids()
            .iter()
            .filter(|id| self.state_of(id) == Some(wanted))
            .cloned()
            .collect()
    }

    /// Whether any active step has failed.
    pub fn is_failed(&self) -> bool {
        self.store
            .active_ids()
            .iter()
            .any(|id| self.state_of(id) == Some(StepState::Failed))
    }

    /// Whether any active step is still running.
    pub fn is_running(&self) -> bool {
        self.store
            .active_ids()
            .iter()
            .any(|id| self.state_of(id) == Some(StepState::Running))
    }

    /// Whether the driver has anything left to do.
    ///
    /// Running steps always need polling. Otherwise there is work only while
    /// no step has failed and some step is not completed.
    pub fn has_todo(&self) -> bool {
        if self.is_running() {
            return true;
        }
        !self.is_failed()
            && self
                .store
                .active_ids()
                .iter()
                .any(|id| self.state_of(id) != Some(StepState::Completed))
    }

    pub fn summary(&self) -> ChainSummary {
        ChainSummary::collect(
            self.store.steps(),
            self.store.active_ids(),
            &self.is_running_fn(),
        )
    }

    /// Poll every running step. Returns whether any step changed.
    pub async fn check_running(&mut self) -> Result<bool, ChainError> {
        let mut changed = false;
        for id in self.active_in_state(StepState::Running) {
            let processor = Arc::clone(&self.processor);
            let Some(step) = self.store.steps_mut().get_mut(&id) else {
                continue;
            };
            match processor.check(step, &self.config).await {
                CheckOutcome::Unchanged => {}
                CheckOutcome::Changed => {
                    let quality = step.quality();
                    info!(step = %id, ?quality, "Step completed");
                    self.store.save()?;
                    self.emit(ChainEvent::Completed { step: id, quality });
                    changed = true;
                }
                CheckOutcome::Failed(e) => {
                    warn!(step = %id, "Step failed: {}", e);
                    step.mark_failed(&e);
                    self.store.save()?;
                    self.emit(ChainEvent::Failed {
                        step: id,
                        error: e.to_string(),
                    });
                    changed = true;
                }
            }
        }
        Ok(changed)
    }

    /// Launch the steps that are ready now. Returns how many were launched.
    ///
    /// Nothing new is launched once a step has failed or a shutdown was
    /// requested.
    pub async fn run_ready(&mut self) -> Result<usize, ChainError> {
        let mut launched = 0;
        for id in self.active_in_state(StepState::Ready) {
            if self.interrupted() || self.is_failed() {
                break;
            }
            self.launch(&id).await?;
            launched += 1;
        }
        Ok(launched)
    }

    async fn launch(&mut self, id: &str) -> Result<(), ChainError> {
        let master = match self.store.steps().get(id).map(Step::kind) {
            Some(StepKind::Merge) => {
                let candidates = self.store.steps().merge_candidates(id);
                Some(resolve_master(id, &candidates)?)
            }
            Some(_) => None,
            None => return Err(ChainError::Internal(format!("unknown step {}", id))),
        };

        let processor = Arc::clone(&self.processor);
        info!(step = %id, backend = processor.name(), "Starting step");
        self.emit(ChainEvent::Started {
            step: id.to_string(),
        });

        let Some(step) = self.store.steps_mut().get_mut(id) else {
            return Ok(());
        };
        if let Some(master) = master {
            step.set_master(&master.id, master.output);
        }
        let result = step.run(processor.as_ref(), &self.config).await;

        let event = match result {
            Ok(()) if processor.is_running(step) => ChainEvent::Submitted {
                step: id.to_string(),
            },
            Ok(()) => {
                info!(step = %id, quality = ?step.quality(), "Step completed");
                ChainEvent::Completed {
                    step: id.to_string(),
                    quality: step.quality(),
                }
            }
            Err(e) => {
                warn!(step = %id, "Step failed: {}", e);
                step.mark_failed(&e);
                ChainEvent::Failed {
                    step: id.to_string(),
                    error: e.to_string(),
                }
            }
        };
        self.store.save()?;
        self.emit(event);
        Ok(())
    }

    /// Sleep for the poll interval, waking early on shutdown.
    async fn sleep(&mut self) {
        let interval = self.settings.poll_interval;
        let closed = match self.shutdown.as_mut() {
            Some(rx) => {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => false,
                    changed = rx.changed() => changed.is_err(),
                }
            }
            None => {
                tokio::time::sleep(interval).await;
                false
            }
        };
        if closed {
            // Sender gone: nobody can request a shutdown any more.
            self.shutdown = None;
            tokio::time::sleep(interval).await;
        }
    }

    fn finish(&self, state: ChainState, timer: &ExecutionTimer) -> ChainOutcome {
        let summary = self.summary();
        info!(
            %state,
            completed = summary.completed,
            failed = summary.failed,
            total = summary.total,
            "Chain finished"
        );
        if let Some((date, best)) = summary.latest_best() {
            info!(table = date, step = %best.step, quality = best.quality, "Best map");
        }
        self.emit(ChainEvent::Finished { state });
        ChainOutcome {
            state,
            summary,
            duration: timer.elapsed(),
        }
    }

    /// Run until every step is completed, the chain failed, or a shutdown
    /// was requested.
    pub async fn run(mut self) -> Result<ChainOutcome, ChainError> {
        let timer = ExecutionTimer::start();
        info!(
            steps = self.store.active_ids().len(),
            backend = self.processor.name(),
            "Starting chain"
        );

        loop {
            if self.interrupted() {
                return Ok(self.finish(ChainState::Interrupted, &timer));
            }
            if !self.has_todo() {
                break;
            }

            let changed = self.check_running().await?;
            let launched = self.run_ready().await?;
            if self.interrupted() {
                return Ok(self.finish(ChainState::Interrupted, &timer));
            }

            if launched == 0 && !changed && self.has_todo() {
                if !self.is_running() && !self.is_failed() {
                    return Err(ChainError::Internal(
                        "chain stalled: no step is ready or running".to_string(),
                    ));
                }
                debug!(interval = ?self.settings.poll_interval, "Waiting for running steps");
                self.sleep().await;
            }
        }

        let state = if self.is_failed() {
            ChainState::Failed
        } else {
            ChainState::Completed
        };
        Ok(self.finish(state, &timer))
    }
}
