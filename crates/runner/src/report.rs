//! Run reports

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use stepwise_common::{Result, StepOutcome, StepStatus};
use tracing::info;

/// Overall status of one scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    Passed,
    Failed,
    Pending,
    Skipped,
}

impl ScenarioStatus {
    /// Worst status wins: failed, then pending, then skipped
    pub fn from_outcomes(outcomes: &[StepOutcome]) -> Self {
        let any = |status: StepStatus| outcomes.iter().any(|o| o.status == status);
        if any(StepStatus::Failed) {
            ScenarioStatus::Failed
        } else if any(StepStatus::Pending) {
            ScenarioStatus::Pending
        } else if any(StepStatus::Skipped) {
            ScenarioStatus::Skipped
        } else {
            ScenarioStatus::Passed
        }
    }
}

impl std::fmt::Display for ScenarioStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScenarioStatus::Passed => write!(f, "passed"),
            ScenarioStatus::Failed => write!(f, "failed"),
            ScenarioStatus::Pending => write!(f, "pending"),
            ScenarioStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Result of one scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub name: String,
    pub tags: Vec<String>,
    pub status: ScenarioStatus,
    pub duration_ms: u64,
    /// One per executed or skipped step, in execution order
    pub outcomes: Vec<StepOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub cancelled: bool,
}

impl ScenarioReport {
    pub fn is_success(&self) -> bool {
        self.status == ScenarioStatus::Passed && !self.cancelled
    }
}

/// Aggregate counts of a report
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub scenarios: usize,
    pub passed: usize,
    pub failed: usize,
    pub pending: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub steps_passed: usize,
    pub steps_failed: usize,
    pub steps_skipped: usize,
    pub steps_pending: usize,
}

impl Summary {
    pub fn from_scenarios(scenarios: &[ScenarioReport]) -> Self {
        let mut summary = Summary {
            scenarios: scenarios.len(),
            ..Default::default()
        };

        for scenario in scenarios {
            match scenario.status {
                ScenarioStatus::Passed => summary.passed += 1,
                ScenarioStatus::Failed => summary.failed += 1,
                ScenarioStatus::Pending => summary.pending += 1,
                ScenarioStatus::Skipped => summary.skipped += 1,
            }
            if scenario.cancelled {
                summary.cancelled += 1;
            }
            for outcome in &scenario.outcomes {
                match outcome.status {
                    StepStatus::Passed => summary.steps_passed += 1,
                    StepStatus::Failed => summary.steps_failed += 1,
                    StepStatus::Skipped => summary.steps_skipped += 1,
                    StepStatus::Pending => summary.steps_pending += 1,
                }
            }
        }

        summary
    }

    pub fn steps(&self) -> usize {
        self.steps_passed + self.steps_failed + self.steps_skipped + self.steps_pending
    }
}

/// Result of running one feature document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub run_id: String,
    pub feature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    /// True for resolution-only runs
    #[serde(default)]
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub scenarios: Vec<ScenarioReport>,
    pub summary: Summary,
}

impl Report {
    /// A run with no selected scenarios is empty, not failed
    pub fn is_success(&self) -> bool {
        self.summary.failed == 0 && self.summary.pending == 0 && self.summary.cancelled == 0
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }
}

/// Destination for completed reports. Sinks are write-only.
pub trait ReportSink: Send + Sync {
    fn store(&self, report: &Report) -> Result<()>;
}

/// Writes each report as pretty JSON into a directory
#[derive(Debug, Clone)]
pub struct JsonReportSink {
    dir: PathBuf,
}

impl JsonReportSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, report: &Report) -> PathBuf {
        self.dir.join(format!("report-{}.json", report.run_id))
    }
}

impl ReportSink for JsonReportSink {
    fn store(&self, report: &Report) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let path = self.path_for(report);
        let json = serde_json::to_string_pretty(report)?;
        std::fs::write(&path, json)?;

        info!("Report written to: {}", path.display());
        Ok(())
    }
}
