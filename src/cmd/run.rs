//! Chain execution - `mapchain run`.

use anyhow::{Context, Result, bail};
use console::style;
use fs2::FileExt;
use std::fs::File;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use mapchain::batch::SlurmScheduler;
use mapchain::chain::{ChainDriver, ChainEvent, ChainOutcome, ChainState, DriverSettings};
use mapchain::chain_config::BackendKind;
use mapchain::config::Config;
use mapchain::engine::ProgramEngine;
use mapchain::logging::{self, LogOptions};
use mapchain::notify::{self, LogNotifier, MailNotifier, Notifier};
use mapchain::processor::{
    BatchProcessor, BatchSettings, LocalProcessor, Processor, resolve_backend,
};
use mapchain::store::StateStore;
use mapchain::table::{expand_table_args, scan_tables};

use super::{EXIT_FAILED, EXIT_INTERRUPTED};
use crate::{Cli, RunArgs};

pub async fn cmd_run(cli: &Cli, args: &RunArgs) -> Result<ExitCode> {
    let config = Config::new(&cli.chain_dir, &args.overrides(), cli.verbose)?;
    config.ensure_directories()?;

    let _log = logging::init(&LogOptions {
        level: config.toml.log.level.clone(),
        json: config.toml.log.json,
        verbose: config.verbose,
        log_dir: Some(config.log_dir.clone()),
    })?;

    let lock = File::create(&config.lock_file)
        .with_context(|| format!("Failed to create {}", config.lock_file.display()))?;
    if lock.try_lock_exclusive().is_err() {
        bail!(
            "Chain in {} is locked by another mapchain process",
            config.chain_dir.display()
        );
    }

    let paths = expand_table_args(&args.tables)?;
    let tables = scan_tables(&paths)?;
    let chain = config.chain_config();

    let mut store = StateStore::open(&config.state_file)?;
    store.reconcile(&tables, &chain, &config.output_dir)?;
    info!(
        chain_dir = %config.chain_dir.display(),
        tables = tables.len(),
        steps = store.active_ids().len(),
        "Chain loaded"
    );

    let processor = build_processor(&config);
    info!(processor = processor.name(), "Using processor");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted: stopping after the current step (Ctrl-C again to abort)");
            let _ = shutdown_tx.send(true);
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(i32::from(EXIT_INTERRUPTED));
            }
        }
    });

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_events(events_rx));

    let driver = ChainDriver::new(
        store,
        processor,
        chain,
        DriverSettings {
            poll_interval: config.poll_interval(),
        },
    )?
    .with_shutdown(shutdown_rx)
    .with_events(events_tx);

    let outcome = driver.run().await;
    let _ = printer.await;
    let outcome = outcome?;

    print_outcome(&outcome);
    notify_outcome(&config, &outcome).await;

    Ok(ExitCode::from(exit_code(outcome.state)))
}

fn build_processor(config: &Config) -> Arc<dyn Processor> {
    let engine = Arc::new(ProgramEngine::new(config.toml.engine.program.clone()));
    match resolve_backend(config.toml.backend.kind, &config.toml.batch.sbatch_cmd) {
        BackendKind::Batch => Arc::new(BatchProcessor::new(
            engine,
            Arc::new(SlurmScheduler::new(&config.toml.batch)),
            config.batch_dir.clone(),
            BatchSettings::from_section(&config.toml.backend),
        )),
        _ => Arc::new(LocalProcessor::new(engine)),
    }
}

async fn print_events(mut events: mpsc::UnboundedReceiver<ChainEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ChainEvent::Started { step } => {
                println!("{} {}", style("▶").cyan(), step);
            }
            ChainEvent::Submitted { step } => {
                println!("{} {} submitted", style("⧗").yellow(), step);
            }
            ChainEvent::Completed { step, quality } => match quality {
                Some(q) => println!("{} {} ({:.4})", style("✓").green(), step, q),
                None => println!("{} {}", style("✓").green(), step),
            },
            ChainEvent::Failed { step, error } => {
                println!("{} {}: {}", style("✗").red(), step, error);
            }
            ChainEvent::Finished { .. } => {}
        }
    }
}

fn print_outcome(outcome: &ChainOutcome) {
    let summary = &outcome.summary;
    let label = style(outcome.state.to_string()).bold();
    let state = match outcome.state {
        ChainState::Completed => label.green(),
        ChainState::Failed => label.red(),
        ChainState::Interrupted => label.yellow(),
    };
    println!();
    println!(
        "Chain {} in {}s: {}/{} steps completed, {} failed",
        state,
        outcome.duration.as_secs(),
        summary.completed,
        summary.total,
        summary.failed
    );
    if let Some((date, best)) = summary.latest_best() {
        println!("Best map for {}: {} ({:.4})", date, best.step, best.quality);
    }
}

async fn notify_outcome(config: &Config, outcome: &ChainOutcome) {
    let name = config
        .chain_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| config.chain_dir.display().to_string());
    let Some((subject, body)) = notify::compose(&name, outcome) else {
        return;
    };
    let notifier: Box<dyn Notifier> = match &config.toml.notify.email {
        Some(email) => Box::new(MailNotifier::new(email.clone(), config.toml.notify.mail_cmd.clone())),
        None => Box::new(LogNotifier),
    };
    notifier.notify(&subject, &body).await;
}

fn exit_code(state: ChainState) -> u8 {
    match state {
        ChainState::Completed => 0,
        ChainState::Failed => EXIT_FAILED,
        ChainState::Interrupted => EXIT_INTERRUPTED,
    }
}
