//! Driver health supervision
//!
//! Periodically probes every live connection. Missed checks accumulate;
//! past the threshold a connection is degraded and gets one reconnect
//! cycle before it is marked failed for the rest of the run.

use std::sync::Arc;
use std::time::Duration;
use stepwise_common::{DriverState, Error};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DriverConfig;
use crate::registry::{DriverConnection, DriverRegistry};

/// Health supervisor for a driver registry
pub struct Supervisor {
    registry: Arc<DriverRegistry>,
    config: DriverConfig,
}

impl Supervisor {
    pub fn new(registry: Arc<DriverRegistry>) -> Self {
        let config = registry.config().clone();
        Self { registry, config }
    }

    /// Run the check loop in the background until `cancel` fires.
    /// Returns `None` when health checks are disabled.
    pub fn spawn(self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let interval = self.config.health_interval()?;
        Some(tokio::spawn(async move { self.run(interval, cancel).await }))
    }

    async fn run(&self, interval: Duration, cancel: CancellationToken) {
        info!(interval_ms = interval.as_millis() as u64, "Driver supervisor started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => self.check_all().await,
            }
        }

        debug!("Driver supervisor stopped");
    }

    /// Probe every live connection once
    pub async fn check_all(&self) {
        let connections = self.registry.live_connections();
        futures::future::join_all(connections.iter().map(|c| self.check(c))).await;
    }

    async fn check(&self, connection: &Arc<DriverConnection>) {
        match connection.status() {
            DriverState::Ready => {}
            DriverState::Degraded => {
                self.recover(connection).await;
                return;
            }
            _ => return,
        }

        match connection.check_health(self.config.health_timeout()).await {
            Ok(()) => connection.record_success(),
            Err(e) => {
                let failures = connection.record_failure(&e.to_string());
                warn!(
                    driver_id = %connection.driver_id(),
                    failures,
                    threshold = self.config.failure_threshold,
                    "Health check failed: {}",
                    e
                );

                let crashed = matches!(e, Error::ProcessCrashed { .. });
                if crashed || failures >= self.config.failure_threshold {
                    if connection.transition(DriverState::Degraded).is_ok() {
                        self.recover(connection).await;
                    }
                }
            }
        }
    }

    /// One reconnect cycle with exponential backoff
    async fn recover(&self, connection: &Arc<DriverConnection>) {
        let attempts = self.config.reconnect_attempts.max(1);

        for attempt in 0..attempts {
            let delay = self.config.reconnect_delay(attempt);
            tokio::time::sleep(delay).await;

            // Stopped underneath us (run finished)
            if connection.status() != DriverState::Degraded {
                return;
            }

            match self.registry.reconnect(connection).await {
                Ok(()) => {
                    info!(
                        driver_id = %connection.driver_id(),
                        attempt = attempt + 1,
                        "Driver reconnected"
                    );
                    return;
                }
                Err(e) => warn!(
                    driver_id = %connection.driver_id(),
                    attempt = attempt + 1,
                    attempts,
                    "Reconnect failed: {}",
                    e
                ),
            }
        }

        let reason = connection
            .last_error()
            .unwrap_or_else(|| "health checks failed".to_string());
        error!(driver_id = %connection.driver_id(), "Giving up on driver after {} reconnect attempt(s)", attempts);
        connection.fail(
            Error::HealthCheckFailed {
                driver_id: connection.driver_id().to_string(),
                reason,
            }
            .to_string(),
        );
    }
}
