use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

mod commands;

use commands::config::ConfigArgs;
use commands::run::RunArgs;

/// Exit status for bad option combinations, matching clap's own usage errors.
const EXIT_USAGE: i32 = 2;
const EXIT_FAILURE: i32 = 1;

#[derive(Parser)]
#[command(name = "runlocal", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train, test and score an algorithm inside local containers
    Run(RunArgs),
    /// Inspect runner configuration
    Config(ConfigArgs),
    /// Print version and exit
    Version,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn dispatch(cli: Cli) -> Result<()> {
    match cli.cmd {
        Commands::Run(args) => commands::run::handle(args),
        Commands::Config(args) => commands::config::handle(args),
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(err) = dispatch(cli) {
        let usage = err
            .downcast_ref::<engine::PipelineError>()
            .map(engine::PipelineError::is_usage)
            .unwrap_or(false);
        if usage {
            eprintln!("Error: {err}");
            std::process::exit(EXIT_USAGE);
        }
        eprintln!("Error: {err:#}");
        std::process::exit(EXIT_FAILURE);
    }
}
