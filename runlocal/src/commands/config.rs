//! `runlocal config`: validate a config file or print the resolved settings.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use config_loader::ConfigManager;
use serde_json::json;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub cmd: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate a config file against the runner schema
    Validate {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Print the configuration a run would use
    Show {
        /// Config file (defaults to RUNLOCAL_CONFIG or the user config dir)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

pub fn handle(args: ConfigArgs) -> Result<()> {
    match args.cmd {
        ConfigCommand::Validate { file } => {
            ConfigManager::without_file()
                .validate_config_file(&file)
                .with_context(|| format!("Invalid config {}", file.display()))?;
            println!("✓ Valid config: {}", file.display());
        }
        ConfigCommand::Show { config } => {
            let manager = match config {
                Some(path) => ConfigManager::with_file(path),
                None => ConfigManager::new(),
            };
            let resolved = manager.load().context("Failed to load runner config")?;
            let view = json!({
                "configFile": manager.config_path().map(|p| p.display().to_string()),
                "sandboxRoot": resolved.sandbox_root.display().to_string(),
                "containerRuntime": resolved.container_runtime,
                "algoTag": resolved.algo_tag,
                "metricsTag": resolved.metrics_tag,
                "stageTimeout": resolved
                    .stage_timeout
                    .map(|limit| humantime::format_duration(limit).to_string()),
                "modelKeyMode": resolved.model_key_mode.to_string(),
                "hostUserns": resolved.host_userns,
            });
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
    }
    Ok(())
}
