//! Driver registry
//!
//! Holds the descriptors of discovered drivers and one connection record per
//! running driver (plus any per-scenario instances of multi-instance
//! drivers). A record moves through [`DriverState`]; `Failed` and `Stopped`
//! are terminal, so a later `start` creates a fresh record.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stepwise_common::{
    capability, load_descriptor, DriverClient, DriverDescriptor, DriverState, Error,
    ProtocolErrorKind, Result, MANIFEST_FILE,
};
use tracing::{debug, error, info, trace, warn};

use crate::config::DriverConfig;
use crate::launcher::{LaunchedDriver, Launcher, ProcessLauncher};

/// Grace period between SIGTERM and SIGKILL
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Snapshot of a connection, for display
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub driver_id: String,
    pub instance_id: String,
    pub state: DriverState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct ConnectionState {
    status: DriverState,
    started_at: Option<DateTime<Utc>>,
    last_health_check: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    last_error: Option<String>,
}

/// One driver instance and its lifecycle record
pub struct DriverConnection {
    descriptor: Arc<DriverDescriptor>,
    instance_id: String,
    state: Mutex<ConnectionState>,
    client: RwLock<Option<Arc<DriverClient>>>,
    process: tokio::sync::Mutex<Option<crate::launcher::DriverProcess>>,
}

impl DriverConnection {
    fn new(descriptor: Arc<DriverDescriptor>) -> Self {
        Self {
            descriptor,
            instance_id: uuid::Uuid::new_v4().to_string(),
            state: Mutex::new(ConnectionState {
                status: DriverState::Discovered,
                started_at: None,
                last_health_check: None,
                consecutive_failures: 0,
                last_error: None,
            }),
            client: RwLock::new(None),
            process: tokio::sync::Mutex::new(None),
        }
    }

    pub fn driver_id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn descriptor(&self) -> &DriverDescriptor {
        &self.descriptor
    }

    pub fn status(&self) -> DriverState {
        self.state.lock().status
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    pub fn info(&self) -> ConnectionInfo {
        let pid = self
            .process
            .try_lock()
            .ok()
            .and_then(|p| p.as_ref().and_then(|p| p.pid()));
        let state = self.state.lock();
        ConnectionInfo {
            driver_id: self.descriptor.id.clone(),
            instance_id: self.instance_id.clone(),
            state: state.status,
            pid,
            started_at: state.started_at,
            last_health_check: state.last_health_check,
            consecutive_failures: state.consecutive_failures,
            last_error: state.last_error.clone(),
        }
    }

    /// Move to `next`, rejecting transitions the lifecycle doesn't allow
    pub(crate) fn transition(&self, next: DriverState) -> Result<()> {
        let mut state = self.state.lock();
        if state.status == next {
            return Ok(());
        }
        if !state.status.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                from: state.status.to_string(),
                to: next.to_string(),
            });
        }
        info!(
            driver_id = %self.descriptor.id,
            instance_id = %self.instance_id,
            from = %state.status,
            to = %next,
            "Driver state changed"
        );
        state.status = next;
        if next == DriverState::Ready {
            state.consecutive_failures = 0;
            state.started_at.get_or_insert_with(Utc::now);
        }
        Ok(())
    }

    /// Mark the record failed with a reason
    pub(crate) fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.state.lock().last_error = Some(reason.clone());
        if let Err(e) = self.transition(DriverState::Failed) {
            trace!(driver_id = %self.descriptor.id, "Not marking failed: {}", e);
        } else {
            error!(driver_id = %self.descriptor.id, "Driver failed: {}", reason);
        }
    }

    pub(crate) fn record_success(&self) {
        let mut state = self.state.lock();
        state.last_health_check = Some(Utc::now());
        state.consecutive_failures = 0;
    }

    /// Count a missed check; returns the consecutive failure count
    pub(crate) fn record_failure(&self, reason: &str) -> u32 {
        let mut state = self.state.lock();
        state.last_health_check = Some(Utc::now());
        state.consecutive_failures += 1;
        state.last_error = Some(reason.to_string());
        state.consecutive_failures
    }

    fn unavailable(&self, reason: impl Into<String>) -> Error {
        Error::DriverUnavailable {
            driver_id: self.descriptor.id.clone(),
            reason: reason.into(),
        }
    }

    /// Current protocol client
    pub fn client(&self) -> Result<Arc<DriverClient>> {
        let status = self.status();
        if status.is_terminal() {
            return Err(self.unavailable(
                self.last_error()
                    .unwrap_or_else(|| format!("driver is {}", status)),
            ));
        }
        self.client
            .read()
            .clone()
            .ok_or_else(|| self.unavailable("driver is not connected"))
    }

    /// Invoke an action. Calls queue behind any invocation already in flight.
    pub async fn invoke(&self, action: &str, params: Value, timeout: Duration) -> Result<Value> {
        let client = self.client()?;
        let started = Instant::now();
        debug!(driver_id = %self.descriptor.id, action, "Invocation dispatched");

        match client.invoke(action, params, timeout).await {
            Ok(result) => {
                debug!(
                    driver_id = %self.descriptor.id,
                    action,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Invocation completed"
                );
                Ok(result)
            }
            Err(e) => {
                debug!(driver_id = %self.descriptor.id, action, kind = %e.kind, "Invocation failed: {}", e.message);
                if e.kind == ProtocolErrorKind::ConnectionLost {
                    self.state.lock().last_error = Some(e.message.clone());
                    if self.status() == DriverState::Ready {
                        let _ = self.transition(DriverState::Degraded);
                    }
                }
                Err(e.into())
            }
        }
    }

    /// One liveness probe: a lost connection or exited process counts as a
    /// crash; drivers declaring `health-check` are also pinged when idle.
    pub async fn check_health(&self, timeout: Duration) -> Result<()> {
        let client = self.client()?;
        if let Some(reason) = client.close_reason() {
            return Err(Error::ProcessCrashed {
                driver_id: self.descriptor.id.clone(),
                reason,
            });
        }

        if let Ok(mut process) = self.process.try_lock() {
            if let Some(status) = process.as_mut().and_then(|p| p.exit_status()) {
                return Err(Error::ProcessCrashed {
                    driver_id: self.descriptor.id.clone(),
                    reason: format!("process exited ({})", status),
                });
            }
        }

        if self.descriptor.has_capability(capability::HEALTH_CHECK) {
            if client.is_busy() {
                trace!(driver_id = %self.descriptor.id, "Skipping ping while an invocation is in flight");
                return Ok(());
            }
            client
                .ping(timeout)
                .await
                .map_err(|e| Error::HealthCheckFailed {
                    driver_id: self.descriptor.id.clone(),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    async fn install(&self, launched: LaunchedDriver) -> Arc<DriverClient> {
        let client = Arc::new(DriverClient::new(
            self.descriptor.id.clone(),
            launched.reader,
            launched.writer,
        ));
        *self.client.write() = Some(client.clone());
        *self.process.lock().await = launched.process;
        client
    }

    /// Close the transport and make sure the process is gone
    async fn teardown(&self, graceful: bool, grace: Duration) {
        let client = self.client.write().take();
        if let Some(client) = client {
            if graceful && !client.is_closed() {
                if let Err(e) = client.shutdown(grace).await {
                    debug!(driver_id = %self.descriptor.id, "Shutdown request failed: {}", e);
                }
            }
            client.close();
        }

        let process = self.process.lock().await.take();
        if let Some(mut process) = process {
            if !(graceful && process.wait_for_exit(grace).await) {
                process.terminate(KILL_GRACE).await;
            }
        }
    }
}

impl std::fmt::Debug for DriverConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverConnection")
            .field("driver_id", &self.descriptor.id)
            .field("instance_id", &self.instance_id)
            .field("status", &self.status())
            .finish()
    }
}

/// Registry of discovered drivers and their connections
pub struct DriverRegistry {
    config: DriverConfig,
    launcher: Arc<dyn Launcher>,
    descriptors: RwLock<BTreeMap<String, Arc<DriverDescriptor>>>,
    connections: RwLock<HashMap<String, Arc<DriverConnection>>>,
    /// Per-scenario instances of multi-instance drivers
    instances: Mutex<Vec<Arc<DriverConnection>>>,
    start_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DriverRegistry {
    pub fn new(config: DriverConfig, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            config,
            launcher,
            descriptors: RwLock::new(BTreeMap::new()),
            connections: RwLock::new(HashMap::new()),
            instances: Mutex::new(Vec::new()),
            start_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Registry launching real driver processes
    pub fn with_processes(config: DriverConfig) -> Self {
        let launcher = Arc::new(ProcessLauncher::new(&config));
        Self::new(config, launcher)
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    // ========================================================================
    // Descriptors
    // ========================================================================

    /// Scan subdirectories for driver manifests. Invalid drivers are logged
    /// and skipped; only an unreadable directory is an error.
    pub fn discover(&self, directory: &Path) -> Result<Vec<DriverDescriptor>> {
        info!("Discovering drivers in {}", directory.display());

        let mut dirs: Vec<PathBuf> = std::fs::read_dir(directory)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        let mut found = Vec::new();
        for dir in dirs {
            if !dir.join(MANIFEST_FILE).exists() {
                trace!("No manifest in {}", dir.display());
                continue;
            }

            match load_descriptor(&dir).and_then(|d| self.register(d.clone()).map(|_| d)) {
                Ok(descriptor) => {
                    info!(
                        driver_id = %descriptor.id,
                        steps = descriptor.steps.len(),
                        "Discovered driver {} {}",
                        descriptor.name,
                        descriptor.version
                    );
                    found.push(descriptor);
                }
                Err(e) => warn!("Skipping driver in {}: {}", dir.display(), e),
            }
        }

        Ok(found)
    }

    /// Add a descriptor. Ids are unique; re-registering from the same
    /// directory replaces the previous descriptor.
    pub fn register(&self, descriptor: DriverDescriptor) -> Result<()> {
        let mut descriptors = self.descriptors.write();
        if let Some(existing) = descriptors.get(&descriptor.id) {
            if existing.root != descriptor.root {
                return Err(Error::Manifest {
                    path: descriptor.root.display().to_string(),
                    reason: format!(
                        "driver id '{}' is already registered from {}",
                        descriptor.id,
                        existing.root.display()
                    ),
                });
            }
        }
        descriptors.insert(descriptor.id.clone(), Arc::new(descriptor));
        Ok(())
    }

    /// Forget a driver that turned out to be unusable
    pub fn remove(&self, driver_id: &str) -> Option<Arc<DriverDescriptor>> {
        self.descriptors.write().remove(driver_id)
    }

    pub fn descriptor(&self, driver_id: &str) -> Option<Arc<DriverDescriptor>> {
        self.descriptors.read().get(driver_id).cloned()
    }

    pub fn descriptors(&self) -> Vec<Arc<DriverDescriptor>> {
        self.descriptors.read().values().cloned().collect()
    }

    /// Known driver ids, sorted
    pub fn ids(&self) -> Vec<String> {
        self.descriptors.read().keys().cloned().collect()
    }

    /// Lifecycle state of a driver's shared connection
    pub fn state(&self, driver_id: &str) -> Option<DriverState> {
        let connection = self.connections.read().get(driver_id).cloned();
        match connection {
            Some(connection) => Some(connection.status()),
            None => self
                .descriptors
                .read()
                .contains_key(driver_id)
                .then_some(DriverState::Discovered),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    fn start_lock(&self, driver_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.start_locks
            .lock()
            .entry(driver_id.to_string())
            .or_default()
            .clone()
    }

    /// Start a driver's shared connection, or return it if already live
    pub async fn start(&self, driver_id: &str) -> Result<Arc<DriverConnection>> {
        let descriptor = self
            .descriptor(driver_id)
            .ok_or_else(|| Error::not_found("driver", driver_id))?;
        let gate = self.start_lock(driver_id);
        let _guard = gate.lock().await;
        self.start_locked(descriptor).await
    }

    async fn start_locked(&self, descriptor: Arc<DriverDescriptor>) -> Result<Arc<DriverConnection>> {
        let existing = self.connections.read().get(&descriptor.id).cloned();
        if let Some(existing) = existing {
            if existing.status().is_live() {
                return Ok(existing);
            }
        }

        let connection = Arc::new(DriverConnection::new(descriptor.clone()));
        self.connections
            .write()
            .insert(descriptor.id.clone(), connection.clone());
        self.launch(&connection).await?;
        Ok(connection)
    }

    /// Start a dedicated instance of a multi-instance driver
    pub async fn start_instance(&self, driver_id: &str) -> Result<Arc<DriverConnection>> {
        let descriptor = self
            .descriptor(driver_id)
            .ok_or_else(|| Error::not_found("driver", driver_id))?;
        if !descriptor.is_multi_instance() {
            return self.start(driver_id).await;
        }

        let connection = Arc::new(DriverConnection::new(descriptor));
        self.instances.lock().push(connection.clone());
        if let Err(e) = self.launch(&connection).await {
            self.instances
                .lock()
                .retain(|c| !Arc::ptr_eq(c, &connection));
            return Err(e);
        }
        Ok(connection)
    }

    /// Stop and forget a dedicated instance
    pub async fn release_instance(&self, connection: &Arc<DriverConnection>) {
        self.instances
            .lock()
            .retain(|c| !Arc::ptr_eq(c, connection));
        self.stop_connection(connection).await;
    }

    async fn launch(&self, connection: &DriverConnection) -> Result<()> {
        connection.transition(DriverState::Starting)?;

        let launched = match self
            .launcher
            .launch(connection.descriptor(), connection.instance_id())
            .await
        {
            Ok(launched) => launched,
            Err(e) => {
                connection.fail(e.to_string());
                return Err(e);
            }
        };

        let client = connection.install(launched).await;
        self.handshake(connection, &client).await?;
        connection.transition(DriverState::Ready)
    }

    async fn handshake(&self, connection: &DriverConnection, client: &DriverClient) -> Result<()> {
        let timeout = self.config.startup_timeout();
        if let Err(e) = client.wait_ready(timeout).await {
            let err = match e.kind {
                ProtocolErrorKind::Timeout => Error::DriverStartTimeout {
                    driver_id: connection.driver_id().to_string(),
                    millis: timeout.as_millis() as u64,
                },
                _ => Error::ProcessCrashed {
                    driver_id: connection.driver_id().to_string(),
                    reason: e.message,
                },
            };
            connection.teardown(false, KILL_GRACE).await;
            connection.fail(err.to_string());
            return Err(err);
        }
        Ok(())
    }

    /// Relaunch a degraded connection in place
    pub(crate) async fn reconnect(&self, connection: &DriverConnection) -> Result<()> {
        connection.teardown(false, KILL_GRACE).await;
        let launched = self
            .launcher
            .launch(connection.descriptor(), connection.instance_id())
            .await?;
        let client = connection.install(launched).await;

        let timeout = self.config.startup_timeout();
        if let Err(e) = client.wait_ready(timeout).await {
            connection.teardown(false, KILL_GRACE).await;
            return Err(e.into());
        }
        connection.transition(DriverState::Ready)
    }

    /// Connection to use for a step. A missing connection is started when
    /// `lazy` allows it; a failed driver stays unavailable for the run.
    pub async fn connection(&self, driver_id: &str, lazy: bool) -> Result<Arc<DriverConnection>> {
        let unavailable = |reason: String| Error::DriverUnavailable {
            driver_id: driver_id.to_string(),
            reason,
        };

        let existing = self.connections.read().get(driver_id).cloned();
        if let Some(connection) = existing {
            match connection.status() {
                DriverState::Ready | DriverState::Degraded => return Ok(connection),
                DriverState::Failed => {
                    return Err(unavailable(
                        connection
                            .last_error()
                            .unwrap_or_else(|| "driver failed".to_string()),
                    ))
                }
                _ => {}
            }
        }

        let descriptor = self
            .descriptor(driver_id)
            .ok_or_else(|| unavailable("driver was not discovered".to_string()))?;

        let gate = self.start_lock(driver_id);
        let _guard = gate.lock().await;

        let existing = self.connections.read().get(driver_id).cloned();
        if let Some(connection) = existing {
            match connection.status() {
                DriverState::Ready | DriverState::Degraded => return Ok(connection),
                DriverState::Failed => {
                    return Err(unavailable(
                        connection
                            .last_error()
                            .unwrap_or_else(|| "driver failed".to_string()),
                    ))
                }
                _ => {}
            }
        }

        if !lazy {
            return Err(unavailable("driver is not running".to_string()));
        }

        self.start_locked(descriptor)
            .await
            .map_err(|e| unavailable(e.to_string()))
    }

    /// Stop a driver's shared connection
    pub async fn stop(&self, driver_id: &str) -> Result<()> {
        let connection = self
            .connections
            .read()
            .get(driver_id)
            .cloned()
            .ok_or_else(|| Error::not_found("connection", driver_id))?;
        self.stop_connection(&connection).await;
        Ok(())
    }

    async fn stop_connection(&self, connection: &DriverConnection) {
        let status = connection.status();
        if status == DriverState::Stopped {
            return;
        }
        info!(driver_id = %connection.driver_id(), instance_id = %connection.instance_id(), "Stopping driver");

        connection
            .teardown(!status.is_terminal(), self.config.shutdown_timeout())
            .await;
        if status.is_live() {
            if let Err(e) = connection.transition(DriverState::Stopped) {
                warn!(driver_id = %connection.driver_id(), "{}", e);
            }
        }
    }

    /// Stop every connection and instance
    pub async fn shutdown_all(&self) {
        let mut all: Vec<Arc<DriverConnection>> = self.connections.read().values().cloned().collect();
        all.extend(self.instances.lock().drain(..));
        if all.is_empty() {
            return;
        }

        info!("Stopping {} driver connection(s)", all.len());
        futures::future::join_all(all.iter().map(|c| self.stop_connection(c))).await;
    }

    /// Connections the supervisor should watch
    pub fn live_connections(&self) -> Vec<Arc<DriverConnection>> {
        let mut live: Vec<Arc<DriverConnection>> = self
            .connections
            .read()
            .values()
            .filter(|c| matches!(c.status(), DriverState::Ready | DriverState::Degraded))
            .cloned()
            .collect();
        live.extend(
            self.instances
                .lock()
                .iter()
                .filter(|c| matches!(c.status(), DriverState::Ready | DriverState::Degraded))
                .cloned(),
        );
        live
    }

    /// Snapshot of every connection record
    pub fn connection_infos(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self
            .connections
            .read()
            .values()
            .map(|c| c.info())
            .collect();
        infos.extend(self.instances.lock().iter().map(|c| c.info()));
        infos.sort_by(|a, b| a.driver_id.cmp(&b.driver_id));
        infos
    }
}
