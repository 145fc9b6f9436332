//! Input tables of a chain.
//!
//! A table is identified by its position in the chain and by a date token
//! taken from its file name (`cdc-h3-hint-20200101.ace` -> `20200101`).

use anyhow::{Context, Result};
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::errors::ConfigError;

/// One input serology table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    /// 0-based chronological position in the chain
    pub index: usize,
    /// Path to the table file
    pub path: PathBuf,
    /// Date token extracted from the file name
    pub date: String,
}

fn date_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"-(\d+)\.").expect("valid date regex"))
}

/// Extract the date token from a table file name.
///
/// The token is the run of digits between a `-` and the following `.`;
/// when several match, the last one wins.
pub fn date_token(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    date_pattern()
        .captures_iter(name)
        .last()
        .map(|caps| caps[1].to_string())
}

/// Validate an ordered list of table paths and assign indices and dates.
///
/// Every table must exist, carry a date token, and dates must be unique.
pub fn scan_tables(paths: &[PathBuf]) -> Result<Vec<Table>, ConfigError> {
    if paths.is_empty() {
        return Err(ConfigError::NoTables);
    }

    let mut seen = HashSet::new();
    let mut tables = Vec::with_capacity(paths.len());

    for (index, path) in paths.iter().enumerate() {
        if !path.exists() {
            return Err(ConfigError::MissingTable { path: path.clone() });
        }
        let date = date_token(path).ok_or_else(|| ConfigError::NoDateToken { path: path.clone() })?;
        if !seen.insert(date.clone()) {
            return Err(ConfigError::DuplicateDate {
                date,
                path: path.clone(),
            });
        }
        tables.push(Table {
            index,
            path: path.clone(),
            date,
        });
    }

    Ok(tables)
}

/// Expand table arguments that contain glob metacharacters.
///
/// Plain paths are passed through in order; each glob pattern is replaced by
/// its matches sorted by file name. A pattern with no matches is kept as-is
/// so that the missing-table check reports it.
pub fn expand_table_args(args: &[String]) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for arg in args {
        if !arg.contains(['*', '?', '[']) {
            paths.push(PathBuf::from(arg));
            continue;
        }

        let mut matches: Vec<PathBuf> = glob::glob(arg)
            .with_context(|| format!("Invalid table pattern: {}", arg))?
            .filter_map(|entry| entry.ok())
            .collect();

        if matches.is_empty() {
            paths.push(PathBuf::from(arg));
            continue;
        }

        matches.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        paths.extend(matches);
    }
    Ok(paths)
}

/// Colon-joined date tokens of tables `0..=index`.
pub fn chain_path(tables: &[Table], index: usize) -> String {
    tables[..=index]
        .iter()
        .map(|t| t.date.as_str())
        .collect::<Vec<_>>()
        .join(":")
}
