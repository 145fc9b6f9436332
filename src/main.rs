use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use mapchain::chain_config::{BackendKind, ChainOverrides};

mod cmd;

#[derive(Parser)]
#[command(name = "mapchain")]
#[command(version, about = "Incremental antigenic map chain builder")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Chain directory holding state.json, outputs and logs
    #[arg(long, global = true, default_value = ".", env = "MAPCHAIN_DIR")]
    pub chain_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build or resume the chain for the given tables
    Run(RunArgs),
    /// Show the state of every step
    Status {
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    /// Tables in chronological order; glob patterns are expanded and sorted
    #[arg(required = true)]
    pub tables: Vec<String>,

    /// Number of optimizations per relaxation
    #[arg(long)]
    pub optimizations: Option<u32>,

    /// Number of dimensions (fixed once the chain exists)
    #[arg(long)]
    pub dimensions: Option<u32>,

    /// Minimum column basis (fixed once the chain exists)
    #[arg(long)]
    pub minimum_column_basis: Option<String>,

    /// Number of best projections to keep
    #[arg(long)]
    pub keep: Option<u32>,

    /// Do not relax merged maps incrementally
    #[arg(long)]
    pub no_incremental: bool,

    /// Do not relax merged maps from scratch
    #[arg(long)]
    pub no_scratch: bool,

    /// Execution backend: auto, local, batch
    #[arg(long)]
    pub backend: Option<BackendKind>,

    /// Optimizations per batch task
    #[arg(long)]
    pub per_run: Option<u32>,

    /// Seconds between polls of running batch jobs
    #[arg(long)]
    pub poll_interval: Option<u64>,

    /// Email address notified when the chain completes or fails
    #[arg(long)]
    pub notify: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,
}

impl RunArgs {
    pub fn overrides(&self) -> ChainOverrides {
        ChainOverrides {
            optimizations: self.optimizations,
            dimensions: self.dimensions,
            minimum_column_basis: self.minimum_column_basis.clone(),
            keep_projections: self.keep,
            no_incremental: self.no_incremental,
            no_scratch: self.no_scratch,
            backend: self.backend,
            optimizations_per_run: self.per_run,
            poll_interval_secs: self.poll_interval,
            notify: self.notify.clone(),
            log_json: self.log_json,
        }
    }
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default chain.toml
    Init,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Run(args) => cmd::cmd_run(&cli, args).await,
        Commands::Status { json } => cmd::cmd_status(&cli, *json).map(|()| ExitCode::SUCCESS),
        Commands::Config { command } => {
            cmd::cmd_config(&cli, command.clone()).map(|()| ExitCode::SUCCESS)
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", console::style("error:").red().bold(), e);
            ExitCode::from(cmd::EXIT_ERROR)
        }
    }
}
