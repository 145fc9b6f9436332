//! Step collection with dependency lookup and state evaluation.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use super::step::{Step, StepKind, StepState};
use crate::errors::ConfigError;

/// A completed predecessor a merge step may take its master map from.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: String,
    pub output: PathBuf,
    pub quality: Option<f64>,
}

/// Ordered set of steps, keyed by id.
///
/// Steps are kept sorted by table index and then by kind (merge, incremental,
/// scratch), which is also the order the driver visits them in.
#[derive(Debug, Default, Clone)]
pub struct StepSet {
    steps: Vec<Step>,
    index_map: HashMap<String, usize>,
}

impl StepSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set, rejecting duplicate ids and dangling dependencies.
    pub fn from_steps(steps: Vec<Step>) -> Result<Self, ConfigError> {
        let mut set = Self::new();
        let mut seen = HashSet::with_capacity(steps.len());
        for step in steps {
            if !seen.insert(step.id.clone()) {
                return Err(ConfigError::DuplicateStep { id: step.id });
            }
            set.steps.push(step);
        }
        set.reindex();
        set.validate_dependencies()?;
        Ok(set)
    }

    /// Every dependency must name a step of the set.
    pub fn validate_dependencies(&self) -> Result<(), ConfigError> {
        for step in &self.steps {
            for dep in &step.depends {
                if !self.index_map.contains_key(dep) {
                    return Err(ConfigError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Insert or replace a step, keeping the set ordered.
    pub fn insert(&mut self, step: Step) {
        match self.index_map.get(&step.id) {
            Some(&i) => self.steps[i] = step,
            None => {
                self.steps.push(step);
                self.reindex();
            }
        }
    }

    fn reindex(&mut self) {
        self.steps
            .sort_by(|a, b| {
                (a.table_index, a.kind().rank(), &a.id).cmp(&(b.table_index, b.kind().rank(), &b.id))
            });
        self.index_map = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index_map.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Step> {
        self.index_map.get(id).map(|&i| &self.steps[i])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.index_map.get(id).map(|&i| &mut self.steps[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Step> {
        self.steps.iter_mut()
    }

    pub fn ids(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.id.clone()).collect()
    }

    /// A step is completed when all of its outputs exist.
    pub fn is_completed(&self, id: &str) -> bool {
        self.get(id).is_some_and(Step::outputs_exist)
    }

    /// Derive the state of a step.
    ///
    /// Checks run in order: completed, failed, running, ready. A dependency
    /// missing from the set counts as not completed.
    pub fn state(&self, id: &str, is_running: &dyn Fn(&Step) -> bool) -> Option<StepState> {
        let step = self.get(id)?;
        let state = if step.outputs_exist() {
            StepState::Completed
        } else if step.failed {
            StepState::Failed
        } else if is_running(step) {
            StepState::Running
        } else if step.depends.iter().all(|dep| self.is_completed(dep)) {
            StepState::Ready
        } else {
            StepState::NotReady
        };
        Some(state)
    }

    /// Completed dependencies of a step that can serve as a merge master.
    pub fn merge_candidates(&self, id: &str) -> Vec<Candidate> {
        let Some(step) = self.get(id) else {
            return Vec::new();
        };
        step.depends
            .iter()
            .filter_map(|dep| self.get(dep))
            .filter(|dep| dep.kind() != StepKind::Merge && dep.outputs_exist())
            .filter_map(|dep| {
                dep.out.first().map(|output| Candidate {
                    id: dep.id.clone(),
                    output: output.clone(),
                    quality: dep.quality(),
                })
            })
            .collect()
    }
}
