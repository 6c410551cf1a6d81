//! Stepwise CLI - Main Entry Point
//!
//! Runs feature files against out-of-process drivers and inspects the
//! drivers and step definitions available to them.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use stepwise_runner::{RunnerConfig, CONFIG_FILE};

mod commands;
mod output;

use commands::{drivers, run};

/// Stepwise - behavior-driven scenario runner
#[derive(Parser)]
#[command(name = "stepwise")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = CONFIG_FILE, global = true, env = "STEPWISE_CONFIG")]
    config: PathBuf,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run feature files
    Run(run::RunArgs),

    /// Resolve every step without starting drivers
    Check(run::RunArgs),

    /// List discovered drivers
    Drivers {
        /// Driver directory
        #[arg(long)]
        drivers: Option<PathBuf>,
    },

    /// List the step definitions of a driver
    Steps {
        /// Driver ID
        driver: String,

        /// Driver directory
        #[arg(long)]
        drivers: Option<PathBuf>,
    },
}

/// Exit status for failing scenarios; 2 is reserved for errors
const EXIT_FAILURES: u8 = 1;
const EXIT_ERROR: u8 = 2;

async fn dispatch(cli: Cli) -> anyhow::Result<bool> {
    let config = RunnerConfig::load(&cli.config)?;

    match cli.command {
        Commands::Run(args) => run::execute(args, config, cli.format).await,
        Commands::Check(args) => run::check(args, config, cli.format).await,
        Commands::Drivers { drivers: dir } => drivers::list(config, dir, cli.format).map(|_| true),
        Commands::Steps { driver, drivers: dir } => {
            drivers::steps(config, dir, &driver, cli.format).map(|_| true)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match dispatch(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(EXIT_FAILURES),
        Err(e) => {
            output::print_error(&format!("{:#}", e));
            ExitCode::from(EXIT_ERROR)
        }
    }
}
