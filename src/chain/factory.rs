//! Deterministic construction of the chain's steps from its tables.

use std::path::{Path, PathBuf};

use super::graph::StepSet;
use super::step::{Step, StepKind};
use crate::chain_config::ChainConfig;
use crate::errors::ConfigError;
use crate::table::{Table, chain_path};

/// Extension of step output artifacts.
pub const OUTPUT_EXTENSION: &str = "ace";

/// Builds steps for an ordered table list.
///
/// Table 0 gets a single scratch step. Every later table gets a merge step
/// fed by the previous table's enabled branches, followed by an incremental
/// and/or a scratch step that relax the merged map.
pub struct StepFactory<'a> {
    tables: &'a [Table],
    config: &'a ChainConfig,
    output_dir: &'a Path,
}

impl<'a> StepFactory<'a> {
    pub fn new(tables: &'a [Table], config: &'a ChainConfig, output_dir: &'a Path) -> Self {
        Self {
            tables,
            config,
            output_dir,
        }
    }

    /// Number of steps a chain over `tables` tables has.
    pub fn expected_len(tables: usize, config: &ChainConfig) -> usize {
        let branches = usize::from(config.incremental) + usize::from(config.scratch);
        match tables {
            0 => 0,
            n => 1 + (n - 1) * (1 + branches),
        }
    }

    /// Build and validate the full step set.
    pub fn build(&self) -> Result<StepSet, ConfigError> {
        if self.tables.is_empty() {
            return Err(ConfigError::NoTables);
        }
        if !self.config.incremental && !self.config.scratch {
            return Err(ConfigError::NoBranchEnabled);
        }

        let mut steps = vec![self.make_step(0, StepKind::Scratch)?];
        for index in 1..self.tables.len() {
            steps.push(self.make_step(index, StepKind::Merge)?);
            if self.config.incremental {
                steps.push(self.make_step(index, StepKind::Incremental)?);
            }
            if self.config.scratch {
                steps.push(self.make_step(index, StepKind::Scratch)?);
            }
        }
        StepSet::from_steps(steps)
    }

    fn id(&self, index: usize, kind: StepKind) -> String {
        Step::make_id(index, kind, &self.tables[index].date)
    }

    fn output(&self, id: &str) -> PathBuf {
        self.output_dir.join(format!("{}.{}", id, OUTPUT_EXTENSION))
    }

    /// Create one step of table `index`.
    pub fn make_step(&self, index: usize, kind: StepKind) -> Result<Step, ConfigError> {
        let table = self.tables.get(index).ok_or_else(|| ConfigError::InvalidValue {
            name: "table index".to_string(),
            message: format!("{} is out of range for {} tables", index, self.tables.len()),
        })?;
        if index == 0 && kind != StepKind::Scratch {
            return Err(ConfigError::NoPredecessor {
                kind: kind.to_string(),
            });
        }

        let mut step = Step::new(index, &table.date, kind, chain_path(self.tables, index));
        step.out = vec![self.output(&step.id)];

        match (index, kind) {
            (0, _) => {
                step.src = vec![Some(table.path.clone())];
            }
            (_, StepKind::Merge) => {
                step.depends = self.merge_dependencies(index)?;
                step.src = vec![None, Some(table.path.clone())];
            }
            (_, StepKind::Incremental | StepKind::Scratch) => {
                let merge_id = self.id(index, StepKind::Merge);
                step.src = vec![Some(self.output(&merge_id))];
                step.depends = vec![merge_id];
            }
        }
        Ok(step)
    }

    fn merge_dependencies(&self, index: usize) -> Result<Vec<String>, ConfigError> {
        let previous = index - 1;
        if previous == 0 {
            return Ok(vec![self.id(0, StepKind::Scratch)]);
        }

        let mut depends = Vec::with_capacity(2);
        if self.config.incremental {
            depends.push(self.id(previous, StepKind::Incremental));
        }
        if self.config.scratch {
            depends.push(self.id(previous, StepKind::Scratch));
        }
        if depends.is_empty() {
            return Err(ConfigError::NoBranchEnabled);
        }
        Ok(depends)
    }
}
