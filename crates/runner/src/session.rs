//! Run-scoped session owning the registries
//!
//! A session wires the step registry, driver registry, supervisor and
//! engine together for one run. The metadata methods (`list_driver_ids`,
//! `get_driver_steps` and friends) never launch a driver process, so editor
//! tooling can use a session without executing anything.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use stepwise_common::{DriverDescriptor, Error, FeatureDocument, Result, StepDefinition};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::engine::{ExecutionEngine, RunOptions};
use crate::launcher::Launcher;
use crate::registry::{ConnectionInfo, DriverRegistry};
use crate::report::{JsonReportSink, Report, ReportSink};
use crate::steps::StepRegistry;
use crate::supervisor::Supervisor;

/// Registries and engine for one run
pub struct Session {
    config: RunnerConfig,
    steps: Arc<StepRegistry>,
    drivers: Arc<DriverRegistry>,
    engine: ExecutionEngine,
    /// Cancels in-flight scenarios at their next step boundary
    cancel: CancellationToken,
    supervisor_cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Session launching real driver processes
    pub fn new(config: RunnerConfig) -> Self {
        let drivers = Arc::new(DriverRegistry::with_processes(config.drivers.clone()));
        Self::build(config, drivers)
    }

    /// Session using a custom launcher
    pub fn with_launcher(config: RunnerConfig, launcher: Arc<dyn Launcher>) -> Self {
        let drivers = Arc::new(DriverRegistry::new(config.drivers.clone(), launcher));
        Self::build(config, drivers)
    }

    fn build(config: RunnerConfig, drivers: Arc<DriverRegistry>) -> Self {
        let steps = Arc::new(StepRegistry::new());
        let engine = ExecutionEngine::new(steps.clone(), drivers.clone());
        Self {
            config,
            steps,
            drivers,
            engine,
            cancel: CancellationToken::new(),
            supervisor_cancel: CancellationToken::new(),
            supervisor: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn steps(&self) -> &Arc<StepRegistry> {
        &self.steps
    }

    pub fn drivers(&self) -> &Arc<DriverRegistry> {
        &self.drivers
    }

    /// Token that cancels the session's runs
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        info!("Cancelling run");
        self.cancel.cancel();
    }

    // ========================================================================
    // Tooling interface
    // ========================================================================

    /// Discover drivers in the configured directory and register their steps.
    /// A driver whose patterns do not compile is dropped. Returns the ids of
    /// the usable drivers.
    pub fn initialize_registries(&self) -> Result<Vec<String>> {
        let directory = &self.config.drivers.directory;
        if !directory.is_dir() {
            warn!("Driver directory {} does not exist", directory.display());
            return Ok(Vec::new());
        }
        self.load_drivers(directory)
    }

    /// Discover drivers from an explicit directory
    pub fn load_drivers(&self, directory: &Path) -> Result<Vec<String>> {
        let mut loaded = Vec::new();

        for descriptor in self.drivers.discover(directory)? {
            match self.steps.load(&descriptor.id, descriptor.steps.clone()) {
                Ok(_) => loaded.push(descriptor.id),
                Err(e) => {
                    warn!(driver_id = %descriptor.id, "Skipping driver: {}", e);
                    self.drivers.remove(&descriptor.id);
                }
            }
        }

        info!(
            "{} driver(s) and {} step definition(s) registered",
            loaded.len(),
            self.steps.len()
        );
        Ok(loaded)
    }

    pub fn list_driver_ids(&self) -> Vec<String> {
        self.drivers.ids()
    }

    pub fn get_driver_descriptor(&self, driver_id: &str) -> Result<Arc<DriverDescriptor>> {
        self.drivers
            .descriptor(driver_id)
            .ok_or_else(|| Error::not_found("driver", driver_id))
    }

    /// Replace the step definitions of a driver
    pub fn register_steps(&self, driver_id: &str, definitions: Vec<StepDefinition>) -> Result<usize> {
        self.steps.load(driver_id, definitions)
    }

    /// Drivers with registered step definitions
    pub fn get_registered_drivers(&self) -> Vec<String> {
        self.steps.drivers()
    }

    pub fn get_driver_steps(&self, driver_id: &str) -> Result<Vec<StepDefinition>> {
        let known = self.drivers.descriptor(driver_id).is_some()
            || self.steps.drivers().iter().any(|d| d == driver_id);
        if !known {
            return Err(Error::not_found("driver", driver_id));
        }
        Ok(self.steps.definitions(driver_id))
    }

    pub fn connection_infos(&self) -> Vec<ConnectionInfo> {
        self.drivers.connection_infos()
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Options from configuration, bound to the session's cancel token
    pub fn run_options(&self) -> RunOptions {
        RunOptions::from_config(&self.config.execution).with_cancel(self.cancel.clone())
    }

    /// Run a document with the session's options
    pub async fn run(&self, document: &FeatureDocument) -> Report {
        let options = self.run_options();
        self.run_with(document, &options).await
    }

    pub async fn run_with(&self, document: &FeatureDocument, options: &RunOptions) -> Report {
        self.ensure_supervisor();
        self.engine.run(document, options).await
    }

    /// Resolve every step of a document without starting drivers
    pub fn check(&self, document: &FeatureDocument) -> Report {
        self.engine.check(document, &self.run_options())
    }

    /// Persist a report into the configured report directory
    pub fn write_report(&self, report: &Report) -> Result<std::path::PathBuf> {
        let sink = JsonReportSink::new(&self.config.output.report_dir);
        sink.store(report)?;
        Ok(sink.path_for(report))
    }

    fn ensure_supervisor(&self) {
        let mut supervisor = self.supervisor.lock();
        if supervisor.is_none() {
            *supervisor = Supervisor::new(self.drivers.clone()).spawn(self.supervisor_cancel.clone());
        }
    }

    /// Stop supervision and every driver
    pub async fn shutdown(&self) {
        self.supervisor_cancel.cancel();
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Supervisor task ended abnormally: {}", e);
            }
        }

        self.drivers.shutdown_all().await;
        debug!("Session shut down");
    }
}
