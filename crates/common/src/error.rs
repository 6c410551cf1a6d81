//! Error types for Stepwise

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using Stepwise Error
pub type Result<T> = std::result::Result<T, Error>;

/// Malformed feature text. Aborts a run before anything executes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Parse error at {line}:{column}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            column,
            message: message.into(),
        }
    }
}

/// Failure modes of a single driver exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolErrorKind {
    Timeout,
    ConnectionLost,
    MalformedResponse,
    RemoteActionError,
}

impl ProtocolErrorKind {
    /// Whether the connection can no longer be used after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolErrorKind::ConnectionLost)
    }
}

impl std::fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolErrorKind::Timeout => write!(f, "Timeout"),
            ProtocolErrorKind::ConnectionLost => write!(f, "ConnectionLost"),
            ProtocolErrorKind::MalformedResponse => write!(f, "MalformedResponse"),
            ProtocolErrorKind::RemoteActionError => write!(f, "RemoteActionError"),
        }
    }
}

/// Error raised by the driver protocol client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ProtocolError {
    pub kind: ProtocolErrorKind,
    pub message: String,
    /// Remote error code, only set for `RemoteActionError`
    pub code: Option<i64>,
}

impl ProtocolError {
    pub fn new(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
        }
    }

    pub fn timeout(method: &str, timeout: std::time::Duration) -> Self {
        Self::new(
            ProtocolErrorKind::Timeout,
            format!("no response to '{}' within {}ms", method, timeout.as_millis()),
        )
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(ProtocolErrorKind::ConnectionLost, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ProtocolErrorKind::MalformedResponse, message)
    }

    pub fn remote(code: i64, message: impl Into<String>) -> Self {
        Self {
            kind: ProtocolErrorKind::RemoteActionError,
            message: message.into(),
            code: Some(code),
        }
    }
}

/// Stepwise error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Invalid manifest at {path}: {reason}")]
    Manifest { path: String, reason: String },

    #[error("Pattern for step '{step_id}' of driver '{driver_id}' failed to compile: {reason}")]
    PatternCompile {
        driver_id: String,
        step_id: String,
        reason: String,
    },

    #[error("No step definition matches '{step_text}'")]
    StepNotFound { step_text: String },

    #[error("Step '{step_text}' is ambiguous between: {}", candidates.join(", "))]
    AmbiguousStep {
        step_text: String,
        candidates: Vec<String>,
    },

    #[error("Driver '{driver_id}' did not become ready within {millis}ms")]
    DriverStartTimeout { driver_id: String, millis: u64 },

    #[error("Driver '{driver_id}' failed health checks: {reason}")]
    HealthCheckFailed { driver_id: String, reason: String },

    #[error("Driver '{driver_id}' process crashed: {reason}")]
    ProcessCrashed { driver_id: String, reason: String },

    #[error("Driver '{driver_id}' is unavailable: {reason}")]
    DriverUnavailable { driver_id: String, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Scenario cancelled")]
    Cancelled,
}

impl Error {
    /// Stable, machine-readable kind used in reports
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "Io",
            Error::Serialization(_) => "Serialization",
            Error::Parse(_) => "ParseError",
            Error::Manifest { .. } => "ManifestError",
            Error::PatternCompile { .. } => "PatternCompileError",
            Error::StepNotFound { .. } => "StepNotFound",
            Error::AmbiguousStep { .. } => "AmbiguousStep",
            Error::DriverStartTimeout { .. } => "StartTimeout",
            Error::HealthCheckFailed { .. } => "HealthCheckFailed",
            Error::ProcessCrashed { .. } => "ProcessCrashed",
            Error::DriverUnavailable { .. } => "DriverUnavailable",
            Error::Protocol(e) => match e.kind {
                ProtocolErrorKind::Timeout => "Timeout",
                ProtocolErrorKind::ConnectionLost => "ConnectionLost",
                ProtocolErrorKind::MalformedResponse => "MalformedResponse",
                ProtocolErrorKind::RemoteActionError => "RemoteActionError",
            },
            Error::NotFound { .. } => "NotFound",
            Error::InvalidStateTransition { .. } => "InvalidStateTransition",
            Error::InvalidConfig(_) => "InvalidConfig",
            Error::Cancelled => "Cancelled",
        }
    }

    /// True for the lifecycle errors that make a driver unusable for the rest of a run
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Error::DriverStartTimeout { .. }
                | Error::HealthCheckFailed { .. }
                | Error::ProcessCrashed { .. }
                | Error::DriverUnavailable { .. }
        )
    }

    /// Driver the error is attributed to, when known
    pub fn driver_id(&self) -> Option<&str> {
        match self {
            Error::PatternCompile { driver_id, .. }
            | Error::DriverStartTimeout { driver_id, .. }
            | Error::HealthCheckFailed { driver_id, .. }
            | Error::ProcessCrashed { driver_id, .. }
            | Error::DriverUnavailable { driver_id, .. } => Some(driver_id),
            _ => None,
        }
    }

    pub fn not_found(kind: &str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }
}

/// Serializable error attached to step outcomes and reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

impl ErrorDetail {
    pub fn from_error(error: &Error) -> Self {
        Self {
            kind: error.kind().to_string(),
            message: error.to_string(),
            driver_id: error.driver_id().map(str::to_string),
            step_id: None,
        }
    }

    pub fn with_driver(mut self, driver_id: impl Into<String>) -> Self {
        self.driver_id = Some(driver_id.into());
        self
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }
}

impl std::fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}
