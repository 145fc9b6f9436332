//! Progress reporting for a chain.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::graph::StepSet;
use super::step::{Step, StepDetail, StepState};

/// Overall state of a chain invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainState {
    /// Every step completed
    Completed,
    /// A step failed; no new work was started after it
    Failed,
    /// Stopped by the user
    Interrupted,
}

impl std::fmt::Display for ChainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChainState::Completed => "completed",
            ChainState::Failed => "failed",
            ChainState::Interrupted => "interrupted",
        };
        write!(f, "{}", s)
    }
}

/// One step as shown in status output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub id: String,
    pub state: StepState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Best relaxation result of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestMap {
    pub step: String,
    pub quality: f64,
}

/// Counts of step states plus the best map per table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub running: usize,
    pub ready: usize,
    pub not_ready: usize,
    /// Keyed by table date
    pub best: BTreeMap<String, BestMap>,
    pub steps: Vec<StepReport>,
}

impl ChainSummary {
    /// Summarize the steps named by `ids`.
    pub fn collect(steps: &StepSet, ids: &[String], is_running: &dyn Fn(&Step) -> bool) -> Self {
        let mut summary = Self::default();
        for id in ids {
            let (Some(step), Some(state)) = (steps.get(id), steps.state(id, is_running)) else {
                continue;
            };
            summary.total += 1;
            match state {
                StepState::Completed => summary.completed += 1,
                StepState::Failed => summary.failed += 1,
                StepState::Running => summary.running += 1,
                StepState::Ready => summary.ready += 1,
                StepState::NotReady => summary.not_ready += 1,
            }

            if let (StepState::Completed, Some(quality)) = (state, step.quality()) {
                let better = summary
                    .best
                    .get(&step.table_date)
                    .is_none_or(|best| quality < best.quality);
                if better {
                    summary.best.insert(
                        step.table_date.clone(),
                        BestMap {
                            step: step.id.clone(),
                            quality,
                        },
                    );
                }
            }

            summary.steps.push(StepReport {
                id: step.id.clone(),
                state,
                quality: step.quality(),
                master: match &step.detail {
                    StepDetail::Merge(m) => m.master.clone(),
                    _ => None,
                },
                runtime: step.runtime.map(|d| d.as_secs_f64()),
                error: step.error.clone(),
            });
        }
        summary
    }

    pub fn completion_percentage(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.completed as f64 / self.total as f64) * 100.0
    }

    /// Best completed map of the last table that has one.
    pub fn latest_best(&self) -> Option<(&str, &BestMap)> {
        self.best
            .iter()
            .next_back()
            .map(|(date, best)| (date.as_str(), best))
    }
}

/// Result of a chain invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainOutcome {
    pub state: ChainState,
    pub summary: ChainSummary,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

/// Tracks execution timing.
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
