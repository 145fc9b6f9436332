//! Chain status display - `mapchain status`.

use anyhow::{Context, Result};
use console::style;

use mapchain::chain::{ChainSummary, StepReport, StepState};
use mapchain::chain_config::ChainToml;
use mapchain::config::Config;
use mapchain::store::StateStore;

use crate::Cli;

pub fn cmd_status(cli: &Cli, json: bool) -> Result<()> {
    let toml = ChainToml::load_or_default(&cli.chain_dir)?;
    let config = Config::with_toml(cli.chain_dir.clone(), toml, cli.verbose);

    if !config.state_file.exists() && !StateStore::backup_path(&config.state_file).exists() {
        if json {
            println!("{}", serde_json::to_string_pretty(&ChainSummary::default())?);
        } else {
            println!(
                "No chain in {}. Start one with `mapchain run <tables>`.",
                config.chain_dir.display()
            );
        }
        return Ok(());
    }

    let store = StateStore::open(&config.state_file)?;
    // Without a live processor, a step with job bookkeeping is reported as running.
    let summary = ChainSummary::collect(store.steps(), store.active_ids(), &|s| s.batch.is_some());

    if json {
        let text = serde_json::to_string_pretty(&summary).context("Failed to serialize status")?;
        println!("{}", text);
        return Ok(());
    }

    println!();
    println!(
        "{} {}",
        style("Chain").bold(),
        style(config.chain_dir.display()).dim()
    );
    println!();
    for report in &summary.steps {
        print_step(report);
    }
    println!();
    println!(
        "{}/{} completed ({:.0}%), {} failed, {} running, {} ready, {} waiting",
        summary.completed,
        summary.total,
        summary.completion_percentage(),
        summary.failed,
        summary.running,
        summary.ready,
        summary.not_ready
    );
    if !summary.best.is_empty() {
        println!();
        println!("{}", style("Best maps").bold());
        for (date, best) in &summary.best {
            println!("  {}  {}  {:.4}", date, best.step, best.quality);
        }
    }
    Ok(())
}

fn print_step(report: &StepReport) {
    let icon = match report.state {
        StepState::Completed => style("✓").green(),
        StepState::Failed => style("✗").red(),
        StepState::Running => style("⧗").yellow(),
        StepState::Ready => style("○").cyan(),
        StepState::NotReady => style("·").dim(),
    };
    let mut line = format!("  {} {:<32}", icon, report.id);
    if let Some(quality) = report.quality {
        line.push_str(&format!(" {:>12.4}", quality));
    }
    if let Some(master) = &report.master {
        line.push_str(&format!("  master {}", master));
    }
    if let Some(runtime) = report.runtime {
        line.push_str(&format!("  {:.0}s", runtime));
    }
    println!("{}", line);
    if let Some(error) = &report.error {
        println!("      {}", style(error).red());
    }
}
