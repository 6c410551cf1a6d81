//! Run and check commands

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use stepwise_common::FeatureDocument;
use stepwise_runner::{parser, RunnerConfig, Session};
use tracing::{info, warn};

use crate::output::{print_report, print_success, print_warning, OutputFormat};

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Feature files or directories containing them
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Only run scenarios carrying this tag (repeatable)
    #[arg(long = "tag", value_name = "TAG")]
    pub tags: Vec<String>,

    /// Skip scenarios carrying this tag (repeatable)
    #[arg(long = "exclude-tag", value_name = "TAG")]
    pub exclude_tags: Vec<String>,

    /// Maximum number of scenarios run concurrently
    #[arg(short = 'j', long)]
    pub parallelism: Option<usize>,

    /// Timeout of a single step in milliseconds
    #[arg(long)]
    pub step_timeout_ms: Option<u64>,

    /// Driver directory
    #[arg(long)]
    pub drivers: Option<PathBuf>,

    /// Directory reports are written to
    #[arg(long)]
    pub report_dir: Option<PathBuf>,

    /// Do not write report files
    #[arg(long)]
    pub no_report: bool,
}

impl RunArgs {
    /// Command-line values take precedence over the configuration file
    pub fn apply(&self, config: &mut RunnerConfig) {
        if !self.tags.is_empty() {
            config.execution.include_tags = self.tags.clone();
        }
        if !self.exclude_tags.is_empty() {
            config.execution.exclude_tags = self.exclude_tags.clone();
        }
        if let Some(parallelism) = self.parallelism {
            config.execution.parallelism = parallelism;
        }
        if let Some(timeout) = self.step_timeout_ms {
            config.execution.step_timeout_ms = timeout;
        }
        if let Some(drivers) = &self.drivers {
            config.drivers.directory = drivers.clone();
        }
        if let Some(dir) = &self.report_dir {
            config.output.report_dir = dir.clone();
        }
    }
}

/// Parse every feature up front; one bad file aborts the run
fn load_features(paths: &[PathBuf]) -> Result<Vec<FeatureDocument>> {
    let mut documents = Vec::new();
    for path in paths {
        let loaded = parser::load_all(path)
            .with_context(|| format!("Failed to load features from {}", path.display()))?;
        documents.extend(loaded);
    }
    Ok(documents)
}

fn open_session(config: RunnerConfig) -> Result<Session> {
    let session = Session::new(config);
    let drivers = session
        .initialize_registries()
        .context("Failed to discover drivers")?;
    if drivers.is_empty() {
        print_warning("No drivers discovered");
    }
    Ok(session)
}

/// Execute features. Returns true when every report succeeded.
pub async fn execute(args: RunArgs, mut config: RunnerConfig, format: OutputFormat) -> Result<bool> {
    args.apply(&mut config);
    config.validate()?;

    let documents = load_features(&args.paths)?;
    let session = open_session(config)?;

    let cancel = session.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight steps");
            cancel.cancel();
        }
    });

    let mut success = true;
    for document in &documents {
        let report = session.run(document).await;
        print_report(&report, format);
        success &= report.is_success();

        if !args.no_report {
            if let Err(e) = session.write_report(&report) {
                warn!("Failed to write report: {}", e);
            }
        }
    }

    session.shutdown().await;
    info!("Finished {} feature(s)", documents.len());
    if success && format == OutputFormat::Table {
        print_success("All scenarios passed");
    }
    Ok(success)
}

/// Resolve steps without starting any driver
pub async fn check(args: RunArgs, mut config: RunnerConfig, format: OutputFormat) -> Result<bool> {
    args.apply(&mut config);
    let documents = load_features(&args.paths)?;
    let session = open_session(config)?;

    let mut success = true;
    for document in &documents {
        let report = session.check(document);
        print_report(&report, format);
        success &= report.is_success();
    }
    Ok(success)
}
