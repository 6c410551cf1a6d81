//! Stepwise runner
//!
//! Executes Gherkin-style feature files by routing each step to an
//! out-of-process driver.
//!
//! ```text
//! feature text ──► parser ──► FeatureDocument
//!                                  │
//!                                  ▼
//!                        ExecutionEngine ──► Report ──► ReportSink
//!                         │            │
//!                  StepRegistry   DriverRegistry ◄── Supervisor
//!                  (patterns)      │        │
//!                              Launcher   DriverClient (JSON lines)
//! ```

pub mod config;
pub mod engine;
pub mod launcher;
pub mod parser;
pub mod registry;
pub mod report;
pub mod session;
pub mod steps;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use config::{DriverConfig, ExecutionConfig, OutputConfig, RunnerConfig, CONFIG_FILE};
pub use engine::{ExecutionContext, ExecutionEngine, RunOptions, CONTINUE_ON_ERROR_TAG};
pub use launcher::{Launcher, ProcessLauncher};
pub use registry::{ConnectionInfo, DriverConnection, DriverRegistry};
pub use report::{JsonReportSink, Report, ReportSink, ScenarioReport, ScenarioStatus, Summary};
pub use session::Session;
pub use steps::{StepMatch, StepRegistry};
pub use supervisor::Supervisor;
