//! Incremental chain of antigenic maps.
//!
//! A chain turns an ordered list of serology tables into a set of steps:
//!
//! 1. **Factory** - builds the steps and their dependencies from the tables
//! 2. **Graph** - holds the steps and derives their state from the filesystem
//! 3. **Driver** - polls running steps and launches ready ones until done
//!
//! ## Example
//!
//! ```no_run
//! use mapchain::chain::{ChainDriver, DriverSettings};
//! use mapchain::chain_config::ChainConfig;
//! use mapchain::engine::ProgramEngine;
//! use mapchain::processor::LocalProcessor;
//! use mapchain::store::StateStore;
//! use mapchain::table::scan_tables;
//! use std::path::{Path, PathBuf};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let tables = scan_tables(&[
//!     PathBuf::from("cdc-h3-hint-20200101.ace"),
//!     PathBuf::from("cdc-h3-hint-20200201.ace"),
//! ])?;
//! let config = ChainConfig::default();
//!
//! let mut store = StateStore::open(Path::new("chain/state.json"))?;
//! store.reconcile(&tables, &config, Path::new("chain/out"))?;
//!
//! let processor = Arc::new(LocalProcessor::new(Arc::new(ProgramEngine::new("mapchain-engine"))));
//! let outcome = ChainDriver::new(store, processor, config, DriverSettings::default())?
//!     .run()
//!     .await?;
//! println!("{}: {:.0}%", outcome.state, outcome.summary.completion_percentage());
//! # Ok(())
//! # }
//! ```

mod driver;
mod factory;
mod graph;
mod step;
mod summary;

pub use driver::{ChainDriver, ChainEvent, DriverSettings, resolve_master};
pub use factory::{OUTPUT_EXTENSION, StepFactory};
pub use graph::{Candidate, StepSet};
pub use step::{MergeSource, Relaxation, Step, StepDetail, StepKind, StepState};
pub use summary::{BestMap, ChainOutcome, ChainState, ChainSummary, ExecutionTimer, StepReport};
