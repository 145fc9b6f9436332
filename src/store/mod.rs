//! Persistent chain state.
//!
//! The state file holds the chain's settings (`setup`) and every step ever
//! created (`steps`). Saves are atomic: the new content is written to
//! `state.json.tmp`, the current file is kept as `state.json~`, and the
//! temporary file is renamed into place.

mod record;

pub use record::{StateDocument, StepRecord};

use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::chain::{StepFactory, StepSet};
use crate::chain_config::ChainConfig;
use crate::errors::{ChainError, ConfigError};
use crate::table::Table;

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Loads, reconciles and saves the chain state.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    setup: BTreeMap<String, Value>,
    steps: StepSet,
    /// Steps of the current table list, in driver order
    active: Vec<String>,
    extra: BTreeMap<String, Value>,
}

impl StateStore {
    /// Empty store that will save to `path`.
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            setup: BTreeMap::new(),
            steps: StepSet::new(),
            active: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    /// Load the state file, falling back to the previous version when the
    /// canonical file is missing. A fresh store is returned when neither exists.
    pub fn open(path: &Path) -> Result<Self, ChainError> {
        let backup = Self::backup_path(path);
        let source = if path.exists() {
            path.to_path_buf()
        } else if backup.exists() {
            info!(backup = %backup.display(), "State file missing, loading previous version");
            backup
        } else {
            debug!(path = %path.display(), "No state file, starting a new chain");
            return Ok(Self::new(path));
        };

        let text = fs::read_to_string(&source).map_err(|source_err| ChainError::StateIo {
            path: source.clone(),
            source: source_err,
        })?;
        let document: StateDocument =
            serde_json::from_str(&text).map_err(|e| ChainError::StateCorrupt {
                path: source.clone(),
                source: e,
            })?;

        let mut store = Self::new(path);
        store.setup = document.setup;
        store.extra = document.extra;
        for (id, record) in document.steps {
            store.steps.insert(record.into_step(id));
        }
        store.active = if document.active.is_empty() {
            store.steps.ids()
        } else {
            document
                .active
                .into_iter()
                .filter(|id| store.steps.contains(id))
                .collect()
        };
        Ok(store)
    }

    pub fn backup_path(path: &Path) -> PathBuf {
        sibling(path, "~")
    }

    pub fn tmp_path(path: &Path) -> PathBuf {
        sibling(path, ".tmp")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn setup(&self) -> &BTreeMap<String, Value> {
        &self.setup
    }

    pub fn setting(&self, name: &str) -> Option<&Value> {
        self.setup.get(name).filter(|v| !v.is_null())
    }

    pub fn steps(&self) -> &StepSet {
        &self.steps
    }

    pub fn steps_mut(&mut self) -> &mut StepSet {
        &mut self.steps
    }

    /// Ids of the steps the current table list uses.
    ///
    /// Steps persisted for tables no longer given stay in the file but are
    /// not active. Without a reconcile, this is the list saved by the last one.
    pub fn active_ids(&self) -> &[String] {
        &self.active
    }

    /// Merge the configuration and the steps for `tables` into the state.
    ///
    /// Mutable settings take the new value; an immutable setting that differs
    /// from the stored one is fatal. Steps not yet stored are added; a stored
    /// step with a different table path is fatal. Nothing is changed when an
    /// error is returned. Saves when anything changed and returns whether it did.
    pub fn reconcile(
        &mut self,
        tables: &[Table],
        config: &ChainConfig,
        output_dir: &Path,
    ) -> Result<bool, ChainError> {
        config.validate()?;
        let expected = StepFactory::new(tables, config, output_dir).build()?;

        let mut setting_changes = Vec::new();
        for setting in config.settings() {
            match self.setting(setting.name) {
                None => setting_changes.push(setting),
                Some(old) if *old == setting.value => {}
                Some(old) if setting.mutable => {
                    info!(
                        setting = setting.name,
                        old = %display_value(old),
                        new = %display_value(&setting.value),
                        "Setting changed"
                    );
                    setting_changes.push(setting);
                }
                Some(old) => {
                    return Err(ConfigError::ImmutableSetting {
                        name: setting.name.to_string(),
                        old: display_value(old),
                        new: display_value(&setting.value),
                    }
                    .into());
                }
            }
        }

        let mut new_steps = Vec::new();
        for step in expected.iter() {
            match self.steps.get(&step.id) {
                Some(stored) if stored.path != step.path => {
                    return Err(ConfigError::StepPathMismatch {
                        id: step.id.clone(),
                        stored: stored.path.clone(),
                        expected: step.path.clone(),
                    }
                    .into());
                }
                Some(_) => {}
                None => new_steps.push(step.clone()),
            }
        }

        let active = expected.ids();
        let changed =
            !setting_changes.is_empty() || !new_steps.is_empty() || self.active != active;
        for setting in setting_changes {
            self.setup.insert(setting.name.to_string(), setting.value);
        }
        for step in new_steps {
            debug!(step = %step.id, "Adding step");
            self.steps.insert(step);
        }
        self.active = active;

        if changed {
            self.save()?;
        }
        Ok(changed)
    }

    pub fn to_document(&self) -> StateDocument {
        StateDocument {
            setup: self.setup.clone(),
            steps: self
                .steps
                .iter()
                .map(|step| (step.id.clone(), StepRecord::from(step)))
                .collect(),
            active: self.active.clone(),
            extra: self.extra.clone(),
        }
    }

    /// Atomically replace the state file.
    pub fn save(&self) -> Result<(), ChainError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| ChainError::StateIo { path, source }
        };

        let mut bytes = serde_json::to_vec_pretty(&self.to_document()).map_err(|e| {
            ChainError::StateCorrupt {
                path: self.path.clone(),
                source: e,
            }
        })?;
        bytes.push(b'\n');

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }

        let tmp = Self::tmp_path(&self.path);
        let mut file = fs::File::create(&tmp).map_err(io_err(&tmp))?;
        file.write_all(&bytes).map_err(io_err(&tmp))?;
        file.sync_all().map_err(io_err(&tmp))?;
        drop(file);

        if self.path.exists() {
            let backup = Self::backup_path(&self.path);
            fs::rename(&self.path, &backup).map_err(io_err(&self.path))?;
        }
        fs::rename(&tmp, &self.path).map_err(io_err(&self.path))?;
        debug!(path = %self.path.display(), steps = self.steps.len(), "Saved state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::StepKind;
    use tempfile::{TempDir, tempdir};

    fn tables(dir: &Path, dates: &[&str]) -> Vec<Table> {
        dates
            .iter()
            .enumerate()
            .map(|(index, date)| Table {
                index,
                path: dir.join(format!("t-{}.ace", date)),
                date: date.to_string(),
            })
            .collect()
    }

    fn fresh(dir: &TempDir) -> StateStore {
        StateStore::open(&dir.path().join("state.json")).unwrap()
    }

    #[test]
    fn test_open_missing_is_empty() {
        let dir = tempdir().unwrap();
        let store = fresh(&dir);
        assert!(store.steps().is_empty());
        assert!(store.setup().is_empty());
    }

    #[test]
    fn test_reconcile_creates_and_persists() {
        let dir = tempdir().unwrap();
        let mut store = fresh(&dir);
        let tables = tables(dir.path(), &["20200101", "20200201", "20200301"]);
        let config = ChainConfig::default();

        assert!(store.reconcile(&tables, &config, &dir.path().join("out")).unwrap());
        assert_eq!(store.steps().len(), 7);
        assert!(store.path().exists());

        let reloaded = fresh(&dir);
        assert_eq!(reloaded.steps().len(), 7);
        assert_eq!(reloaded.setting("number_of_dimensions"), Some(&Value::from(2)));
        assert_eq!(reloaded.steps().ids(), store.steps().ids());
    }

    #[test]
    fn test_reconcile_unchanged_does_not_save() {
        let dir = tempdir().unwrap();
        let tables = tables(dir.path(), &["20200101", "20200201"]);
        let config = ChainConfig::default();
        let out = dir.path().join("out");

        let mut store = fresh(&dir);
        store.reconcile(&tables, &config, &out).unwrap();

        let mut store = fresh(&dir);
        assert!(!store.reconcile(&tables, &config, &out).unwrap());
        assert!(!StateStore::backup_path(store.path()).exists());
    }

    #[test]
    fn test_immutable_setting_change_is_fatal_and_not_persisted() {
        let dir = tempdir().unwrap();
        let tables = tables(dir.path(), &["20200101", "20200201"]);
        let out = dir.path().join("out");
        let mut store = fresh(&dir);
        store.reconcile(&tables, &ChainConfig::default(), &out).unwrap();

        let config = ChainConfig {
            dimensions: 3,
            ..ChainConfig::default()
        };
        let mut store = fresh(&dir);
        let err = store.reconcile(&tables, &config, &out).unwrap_err();
        assert!(err.is_config());
        assert!(matches!(
            err,
            ChainError::Config(ConfigError::ImmutableSetting { ref name, .. }) if name == "number_of_dimensions"
        ));

        let reloaded = fresh(&dir);
        assert_eq!(reloaded.setting("number_of_dimensions"), Some(&Value::from(2)));
    }

    #[test]
    fn test_branch_flags_persist_under_their_names() {
        let dir = tempdir().unwrap();
        let tables = tables(dir.path(), &["20200101", "20200201"]);
        let out = dir.path().join("out");
        let mut store = fresh(&dir);
        store.reconcile(&tables, &ChainConfig::default(), &out).unwrap();

        let reloaded = fresh(&dir);
        assert_eq!(reloaded.setting("incremental"), Some(&Value::from(true)));
        assert_eq!(reloaded.setting("scratch"), Some(&Value::from(true)));

        let config = ChainConfig {
            scratch: false,
            ..ChainConfig::default()
        };
        let mut store = fresh(&dir);
        let err = store.reconcile(&tables, &config, &out).unwrap_err();
        assert!(matches!(
            err,
            ChainError::Config(ConfigError::ImmutableSetting { ref name, .. }) if name == "scratch"
        ));
    }

    #[test]
    fn test_mutable_setting_change_is_accepted() {
        let dir = tempdir().unwrap();
        let tables = tables(dir.path(), &["20200101"]);
        let out = dir.path().join("out");
        let mut store = fresh(&dir);
        store.reconcile(&tables, &ChainConfig::default(), &out).unwrap();

        let config = ChainConfig {
            optimizations: 500,
            ..ChainConfig::default()
        };
        let mut store = fresh(&dir);
        assert!(store.reconcile(&tables, &config, &out).unwrap());
        assert_eq!(
            fresh(&dir).setting("number_of_optimizations"),
            Some(&Value::from(500))
        );
    }

    #[test]
    fn test_appended_table_adds_steps() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out");
        let config = ChainConfig::default();
        let mut store = fresh(&dir);
        store
            .reconcile(&tables(dir.path(), &["20200101", "20200201"]), &config, &out)
            .unwrap();
        assert_eq!(store.steps().len(), 4);

        let mut store = fresh(&dir);
        store
            .reconcile(
                &tables(dir.path(), &["20200101", "20200201", "20200301"]),
                &config,
                &out,
            )
            .unwrap();
        assert_eq!(store.steps().len(), 7);
        assert_eq!(store.active_ids().len(), 7);
    }

    #[test]
    fn test_reordered_tables_path_mismatch() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out");
        let config = ChainConfig::default();
        let mut store = fresh(&dir);
        store
            .reconcile(&tables(dir.path(), &["20200101", "20200201"]), &config, &out)
            .unwrap();

        let reordered = tables(dir.path(), &["20191201", "20200201"]);
        let mut store = fresh(&dir);
        let err = store.reconcile(&reordered, &config, &out).unwrap_err();
        assert!(matches!(
            err,
            ChainError::Config(ConfigError::StepPathMismatch { .. })
        ));
    }

    #[test]
    fn test_dropped_tables_stay_in_file_but_inactive() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out");
        let config = ChainConfig::default();
        let mut store = fresh(&dir);
        store
            .reconcile(&tables(dir.path(), &["20200101", "20200201"]), &config, &out)
            .unwrap();

        let mut store = fresh(&dir);
        store
            .reconcile(&tables(dir.path(), &["20200101"]), &config, &out)
            .unwrap();
        assert_eq!(store.active_ids(), ["0.scratch.20200101".to_string()]);
        assert_eq!(store.steps().len(), 4);

        // Reopening without reconciling keeps the last run's table list.
        let reopened = fresh(&dir);
        assert_eq!(reopened.steps().len(), 4);
        assert_eq!(reopened.active_ids(), ["0.scratch.20200101".to_string()]);
    }

    #[test]
    fn test_save_keeps_backup_and_falls_back_to_it() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out");
        let mut store = fresh(&dir);
        store
            .reconcile(&tables(dir.path(), &["20200101"]), &ChainConfig::default(), &out)
            .unwrap();
        store.save().unwrap();

        let path = store.path().to_path_buf();
        let backup = StateStore::backup_path(&path);
        assert!(backup.exists());
        assert!(!StateStore::tmp_path(&path).exists());

        // Crash between the two renames of a save.
        fs::remove_file(&path).unwrap();
        let recovered = StateStore::open(&path).unwrap();
        assert!(recovered.steps().contains("0.scratch.20200101"));
    }

    #[test]
    fn test_corrupt_state_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            StateStore::open(&path),
            Err(ChainError::StateCorrupt { .. })
        ));
    }

    #[test]
    fn test_unknown_keys_round_trip_through_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(
            &path,
            r#"{
  "setup": {"number_of_dimensions": 2, "lab": "CDC"},
  "steps": {
    "0.scratch.20200101": {
      "_kind": "scratch", "table_index": 0, "table_date": "20200101",
      "path": "20200101", "src": ["t-20200101.ace"], "out": ["out/0.scratch.20200101.ace"],
      "failed": false, "reviewed_by": "ds"
    }
  },
  "version": 3
}"#,
        )
        .unwrap();

        let store = StateStore::open(&path).unwrap();
        assert_eq!(
            store.steps().get("0.scratch.20200101").unwrap().kind(),
            StepKind::Scratch
        );
        store.save().unwrap();

        let saved: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["version"], 3);
        assert_eq!(saved["setup"]["lab"], "CDC");
        assert_eq!(saved["steps"]["0.scratch.20200101"]["reviewed_by"], "ds");
    }
}
