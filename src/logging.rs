//! Tracing setup: stderr output plus one log file per invocation.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Logging options resolved from configuration and CLI flags.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Default filter when `RUST_LOG` is not set
    pub level: String,
    pub json: bool,
    pub verbose: bool,
    /// Directory for the invocation log file; stderr only when `None`
    pub log_dir: Option<PathBuf>,
}

/// Keeps the file writer alive; flushes on drop.
pub struct LogGuard {
    _worker: Option<WorkerGuard>,
    pub log_file: Option<PathBuf>,
}

/// Log file name for an invocation started at `now`.
pub fn log_file_name(now: DateTime<Local>) -> String {
    format!("{}.log", now.format("%Y-%m%d-%H%M"))
}

fn filter(options: &LogOptions) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let level = if options.verbose { "debug" } else { options.level.as_str() };
    EnvFilter::try_new(level).with_context(|| format!("Invalid log level: {}", level))
}

/// Install the global subscriber.
pub fn init(options: &LogOptions) -> Result<LogGuard> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    let stderr = fmt::layer().with_writer(std::io::stderr).with_target(false);
    if options.json {
        layers.push(stderr.json().with_filter(filter(options)?).boxed());
    } else {
        layers.push(stderr.with_filter(filter(options)?).boxed());
    }

    let mut guard = LogGuard {
        _worker: None,
        log_file: None,
    };
    if let Some(dir) = &options.log_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
        let name = log_file_name(Local::now());
        let (writer, worker) =
            tracing_appender::non_blocking(tracing_appender::rolling::never(dir, &name));
        let file = fmt::layer().with_writer(writer).with_ansi(false);
        if options.json {
            layers.push(file.json().with_filter(filter(options)?).boxed());
        } else {
            layers.push(file.with_filter(filter(options)?).boxed());
        }
        guard._worker = Some(worker);
        guard.log_file = Some(Path::new(dir).join(name));
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .context("Failed to initialize logging")?;
    Ok(guard)
}
