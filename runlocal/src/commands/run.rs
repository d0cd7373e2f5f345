//! `runlocal run`: the full train/evaluate/test/evaluate pipeline.

use anyhow::{Context, Result};
use clap::Args;
use config_loader::{parse_timeout, ConfigManager, ModelKeyMode, RunnerConfig};
use container_exec::{ContainerCli, RunIdentity};
use engine::{Pipeline, PipelineInputs, PipelineOptions, PipelineReport};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Algorithm directory containing a Dockerfile
    #[arg(value_name = "ALGO")]
    pub algo: PathBuf,

    /// Opener file used for training and train evaluation
    #[arg(long, value_name = "FILE")]
    pub train_opener: PathBuf,

    /// Opener file used for testing and test evaluation
    #[arg(long, value_name = "FILE")]
    pub test_opener: PathBuf,

    /// Metrics directory containing a Dockerfile
    #[arg(long, value_name = "DIR")]
    pub metrics: PathBuf,

    /// Rank forwarded to the training command
    #[arg(long)]
    pub rank: Option<u32>,

    #[arg(long, value_name = "DIR")]
    pub train_data_samples: Option<PathBuf>,

    #[arg(long, value_name = "DIR")]
    pub test_data_samples: Option<PathBuf>,

    /// Input model file; repeat to pass several, in order
    #[arg(long = "inmodel", value_name = "FILE")]
    pub inmodels: Vec<PathBuf>,

    /// Let the algorithm and metrics generate synthetic samples
    #[arg(long)]
    pub fake_data_samples: bool,

    /// Sandbox root (overrides config)
    #[arg(long, value_name = "DIR")]
    pub sandbox: Option<PathBuf>,

    /// Container runtime binary (overrides config)
    #[arg(long, value_name = "BIN")]
    pub runtime: Option<String>,

    /// Per-call time limit, e.g. "30m" (overrides config)
    #[arg(long, value_name = "DURATION", value_parser = parse_stage_timeout)]
    pub stage_timeout: Option<Duration>,

    /// Key input models by file content instead of path
    #[arg(long)]
    pub content_keys: bool,

    /// Config file (defaults to RUNLOCAL_CONFIG or the user config dir)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Print the run report as JSON
    #[arg(long)]
    pub json: bool,
}

fn parse_stage_timeout(raw: &str) -> Result<Duration, String> {
    parse_timeout("--stage-timeout", raw).map_err(|e| e.to_string())
}

impl RunArgs {
    fn inputs(&self) -> PipelineInputs {
        PipelineInputs {
            algo_dir: self.algo.clone(),
            train_opener_file: self.train_opener.clone(),
            test_opener_file: self.test_opener.clone(),
            metrics_dir: self.metrics.clone(),
            train_data_dir: self.train_data_samples.clone(),
            test_data_dir: self.test_data_samples.clone(),
            rank: self.rank,
            inmodels: self.inmodels.clone(),
            fake_data_samples: self.fake_data_samples,
        }
    }

    /// Flags win over environment, which wins over the config file.
    fn apply_overrides(&self, config: &mut RunnerConfig) {
        if let Some(root) = &self.sandbox {
            config.sandbox_root = root.clone();
        }
        if let Some(runtime) = &self.runtime {
            config.container_runtime = runtime.clone();
        }
        if self.stage_timeout.is_some() {
            config.stage_timeout = self.stage_timeout;
        }
        if self.content_keys {
            config.model_key_mode = ModelKeyMode::Content;
        }
    }
}

pub fn handle(args: RunArgs) -> Result<()> {
    let inputs = args.inputs();
    inputs.validate()?;

    let manager = match &args.config {
        Some(path) => ConfigManager::with_file(path),
        None => ConfigManager::new(),
    };
    let mut config = manager.load().context("Failed to load runner config")?;
    args.apply_overrides(&mut config);

    let cancel = Arc::new(AtomicBool::new(false));
    let handler_flag = cancel.clone();
    ctrlc::set_handler(move || {
        warn!("Interrupted, stopping run and removing its container");
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to install interrupt handler")?;

    let pipeline = build_pipeline(&config, RunIdentity::current(), cancel);
    info!(
        runtime = %config.container_runtime,
        uid = pipeline.options().identity.uid,
        "Starting run local"
    );

    let report = pipeline.run(&inputs)?;
    print_report(&report, args.json)
}

/// The stage loop and the container backend watch the same cancellation flag.
fn build_pipeline(
    config: &RunnerConfig,
    identity: RunIdentity,
    cancel: Arc<AtomicBool>,
) -> Pipeline<ContainerCli> {
    let backend = ContainerCli::new(config.container_runtime.clone())
        .with_stage_timeout(config.stage_timeout)
        .with_cancel_flag(cancel.clone());
    let options = PipelineOptions::from_config(config, identity).with_cancel_flag(cancel);
    Pipeline::new(backend, options)
}

fn print_report(report: &PipelineReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Sandbox: {}", report.sandbox.compute_root.display());
    println!("Train score: {}", report.train_score);
    println!("Test score: {}", report.test_score);
    Ok(())
}
