//! Runner configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use stepwise_common::{Error, Result};

/// Default configuration file name, looked up in the working directory
pub const CONFIG_FILE: &str = "stepwise.toml";

/// Runner configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Driver discovery and supervision
    pub drivers: DriverConfig,

    /// Scenario execution
    pub execution: ExecutionConfig,

    /// Report output
    pub output: OutputConfig,
}

/// Driver-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Directory scanned for driver manifests
    pub directory: PathBuf,

    /// How long to wait for a driver's ready handshake
    pub startup_timeout_ms: u64,

    /// How long to wait for a graceful shutdown before killing
    pub shutdown_timeout_ms: u64,

    /// Interval between health checks; 0 disables supervision
    pub health_interval_ms: u64,

    /// Timeout of a single health probe
    pub health_timeout_ms: u64,

    /// Consecutive missed checks before a driver is degraded
    pub failure_threshold: u32,

    /// Reconnect attempts made for a degraded driver
    pub reconnect_attempts: u32,

    /// First reconnect delay, doubled after each attempt
    pub reconnect_backoff_ms: u64,

    /// Directory for driver Unix sockets
    pub socket_dir: Option<PathBuf>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("drivers"),
            startup_timeout_ms: 10_000,
            shutdown_timeout_ms: 5_000,
            health_interval_ms: 5_000,
            health_timeout_ms: 2_000,
            failure_threshold: 3,
            reconnect_attempts: 3,
            reconnect_backoff_ms: 250,
            socket_dir: None,
        }
    }
}

impl DriverConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn health_interval(&self) -> Option<Duration> {
        (self.health_interval_ms > 0).then(|| Duration::from_millis(self.health_interval_ms))
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    /// Delay before reconnect attempt `attempt` (0-based)
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(16)).unwrap_or(u64::MAX);
        Duration::from_millis(self.reconnect_backoff_ms.saturating_mul(factor))
    }

    /// Get the socket directory
    pub fn socket_dir(&self) -> PathBuf {
        self.socket_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("stepwise-sockets"))
    }
}

/// Execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Maximum number of scenarios run concurrently
    pub parallelism: usize,

    /// Start drivers on first use
    pub lazy_start: bool,

    /// Timeout of a single step invocation
    pub step_timeout_ms: u64,

    /// Extra attempts for a step whose invocation timed out
    pub timeout_retries: u32,

    /// Run only scenarios carrying one of these tags (empty = all)
    pub include_tags: Vec<String>,

    /// Never run scenarios carrying one of these tags
    pub exclude_tags: Vec<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            parallelism: 1,
            lazy_start: true,
            step_timeout_ms: 30_000,
            timeout_retries: 0,
            include_tags: Vec::new(),
            exclude_tags: Vec::new(),
        }
    }
}

impl ExecutionConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory reports are written to
    pub report_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            report_dir: PathBuf::from("stepwise-results"),
        }
    }
}

impl RunnerConfig {
    /// Load configuration from file, falling back to defaults when absent
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)
                .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the runner cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.execution.parallelism == 0 {
            return Err(Error::InvalidConfig(
                "execution.parallelism must be at least 1".to_string(),
            ));
        }
        if self.execution.step_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "execution.step_timeout_ms must be positive".to_string(),
            ));
        }
        if self.drivers.startup_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "drivers.startup_timeout_ms must be positive".to_string(),
            ));
        }
        if self.drivers.failure_threshold == 0 {
            return Err(Error::InvalidConfig(
                "drivers.failure_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = RunnerConfig::load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.execution.parallelism, 1);
        assert!(config.execution.lazy_start);
    }

    #[test]
    fn test_partial_file_merges_with_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            "[execution]\nparallelism = 4\ninclude_tags = [\"smoke\"]\n\n[drivers]\ndirectory = \"drv\"\n",
        )
        .unwrap();

        let config = RunnerConfig::load(&path).unwrap();
        assert_eq!(config.execution.parallelism, 4);
        assert_eq!(config.execution.include_tags, vec!["smoke".to_string()]);
        assert_eq!(config.drivers.directory, PathBuf::from("drv"));
        assert_eq!(config.drivers.failure_threshold, 3);
    }

    #[test]
    fn test_save_and_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join(CONFIG_FILE);
        let mut config = RunnerConfig::default();
        config.execution.timeout_retries = 2;
        config.save(&path).unwrap();

        let loaded = RunnerConfig::load(&path).unwrap();
        assert_eq!(loaded.execution.timeout_retries, 2);
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let mut config = RunnerConfig::default();
        config.execution.parallelism = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reconnect_backoff_doubles() {
        let config = DriverConfig::default();
        assert_eq!(config.reconnect_delay(0), Duration::from_millis(250));
        assert_eq!(config.reconnect_delay(1), Duration::from_millis(500));
        assert_eq!(config.reconnect_delay(2), Duration::from_millis(1000));
    }
}
