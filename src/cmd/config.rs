//! Configuration view and validation commands - `mapchain config`.

use anyhow::{Context, Result, bail};
use console::style;

use mapchain::chain_config::{CHAIN_TOML, ChainToml};

use crate::{Cli, ConfigCommands};

pub fn cmd_config(cli: &Cli, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = cli.chain_dir.join(CHAIN_TOML);

    match command {
        None | Some(ConfigCommands::Show) => {
            let mut chain_toml = ChainToml::load_or_default(&cli.chain_dir)?;
            chain_toml.apply_env()?;

            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!(
                    "No {} in {}, showing defaults",
                    CHAIN_TOML,
                    cli.chain_dir.display()
                );
            }
            println!();
            let text = toml::to_string_pretty(&chain_toml).context("Failed to serialize chain.toml")?;
            print!("{}", text);
        }
        Some(ConfigCommands::Validate) => {
            let mut chain_toml = ChainToml::load_or_default(&cli.chain_dir)?;
            chain_toml.apply_env()?;

            chain_toml.chain_config()
                .validate()
                .context("Invalid chain configuration")?;

            let warnings = chain_toml.validate();
            if warnings.is_empty() {
                println!("{} Configuration is valid", style("✓").green());
            } else {
                println!("{} Configuration has warnings:", style("!").yellow());
                for warning in &warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                bail!("{} already exists", config_path.display());
            }
            std::fs::create_dir_all(&cli.chain_dir).with_context(|| {
                format!("Failed to create chain directory: {}", cli.chain_dir.display())
            })?;
            ChainToml::default().save(&config_path)?;
            println!("{} Created {}", style("✓").green(), config_path.display());
        }
    }

    Ok(())
}
