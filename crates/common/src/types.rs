//! Core types for Stepwise

use crate::error::ErrorDetail;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

// ============================================================================
// Feature documents
// ============================================================================

/// Position of an element in feature text (1-based)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePosition {
    pub line: usize,
    pub column: usize,
}

impl SourcePosition {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl std::fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Step keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepKeyword {
    Given,
    When,
    Then,
    And,
    But,
}

impl StepKeyword {
    pub const ALL: [StepKeyword; 5] = [
        StepKeyword::Given,
        StepKeyword::When,
        StepKeyword::Then,
        StepKeyword::And,
        StepKeyword::But,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKeyword::Given => "Given",
            StepKeyword::When => "When",
            StepKeyword::Then => "Then",
            StepKeyword::And => "And",
            StepKeyword::But => "But",
        }
    }
}

impl std::fmt::Display for StepKeyword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Block attached to a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepArgument {
    DataTable { rows: Vec<Vec<String>> },
    DocString {
        content: String,
        #[serde(default)]
        media_type: Option<String>,
    },
}

/// A single step of a scenario or background
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub keyword: StepKeyword,
    pub text: String,
    #[serde(default)]
    pub argument: Option<StepArgument>,
    pub position: SourcePosition,
}

impl Step {
    pub fn data_table(&self) -> Option<&[Vec<String>]> {
        match &self.argument {
            Some(StepArgument::DataTable { rows }) => Some(rows),
            _ => None,
        }
    }

    pub fn doc_string(&self) -> Option<&str> {
        match &self.argument {
            Some(StepArgument::DocString { content, .. }) => Some(content),
            _ => None,
        }
    }
}

/// Steps run before every scenario of a feature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Background {
    #[serde(default)]
    pub name: String,
    pub steps: Vec<Step>,
    pub position: SourcePosition,
}

/// Example row that produced a concrete scenario from an outline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleRow {
    /// 1-based row index across all Examples blocks of the outline
    pub index: usize,
    pub values: Vec<(String, String)>,
}

/// A concrete scenario (outlines are already expanded)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Tags without the leading `@`, in declaration order
    #[serde(default)]
    pub tags: Vec<String>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub example: Option<ExampleRow>,
    pub position: SourcePosition,
}

impl Scenario {
    pub fn has_tag(&self, tag: &str) -> bool {
        let tag = tag.trim_start_matches('@');
        self.tags.iter().any(|t| t == tag)
    }
}

/// A parsed feature file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureDocument {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub background: Option<Background>,
    pub scenarios: Vec<Scenario>,
    #[serde(default)]
    pub source: Option<PathBuf>,
}

impl FeatureDocument {
    /// Canonical textual form. Outlines are rendered as the concrete
    /// scenarios they expanded into, so re-parsing yields the same scenarios.
    pub fn to_gherkin(&self) -> String {
        let mut out = String::new();

        if !self.tags.is_empty() {
            out.push_str(&render_tags(&self.tags));
            out.push('\n');
        }
        out.push_str(&format!("Feature: {}\n", self.title));
        for line in self.description.lines() {
            out.push_str(&format!("  {}\n", line));
        }

        if let Some(background) = &self.background {
            out.push('\n');
            if background.name.is_empty() {
                out.push_str("  Background:\n");
            } else {
                out.push_str(&format!("  Background: {}\n", background.name));
            }
            render_steps(&mut out, &background.steps);
        }

        for scenario in &self.scenarios {
            out.push('\n');
            // Feature tags are inherited at parse time, only render the rest.
            let own: Vec<String> = scenario
                .tags
                .iter()
                .filter(|t| !self.tags.contains(t))
                .cloned()
                .collect();
            if !own.is_empty() {
                out.push_str(&format!("  {}\n", render_tags(&own)));
            }
            out.push_str(&format!("  Scenario: {}\n", scenario.name));
            for line in scenario.description.lines() {
                out.push_str(&format!("    {}\n", line));
            }
            render_steps(&mut out, &scenario.steps);
        }

        out
    }
}

fn render_tags(tags: &[String]) -> String {
    tags.iter()
        .map(|t| format!("@{}", t))
        .collect::<Vec<_>>()
        .join(" ")
}

fn render_steps(out: &mut String, steps: &[Step]) {
    for step in steps {
        out.push_str(&format!("    {} {}\n", step.keyword, step.text));
        match &step.argument {
            Some(StepArgument::DataTable { rows }) => {
                for row in rows {
                    let cells: Vec<String> = row
                        .iter()
                        .map(|c| {
                            c.replace('\\', "\\\\")
                                .replace('|', "\\|")
                                .replace('\n', "\\n")
                        })
                        .collect();
                    out.push_str(&format!("      | {} |\n", cells.join(" | ")));
                }
            }
            Some(StepArgument::DocString { content, media_type }) => {
                out.push_str(&format!(
                    "      \"\"\"{}\n",
                    media_type.as_deref().unwrap_or_default()
                ));
                for line in content.split('\n') {
                    out.push_str(&format!("      {}\n", line));
                }
                out.push_str("      \"\"\"\n");
            }
            None => {}
        }
    }
}

// ============================================================================
// Step definitions
// ============================================================================

/// Declared type of a step parameter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    #[default]
    String,
    Int,
    Float,
    Regex,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Int => "int",
            ParamType::Float => "float",
            ParamType::Regex => "regex",
        }
    }
}

impl std::str::FromStr for ParamType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "string" | "str" => Ok(ParamType::String),
            "int" | "integer" | "number" => Ok(ParamType::Int),
            "float" | "double" => Ok(ParamType::Float),
            "regex" | "regexp" => Ok(ParamType::Regex),
            other => Err(format!("unknown parameter type '{}'", other)),
        }
    }
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameter of a step definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "type")]
    pub param_type: ParamType,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

/// A driver-declared mapping from a step pattern to an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    pub driver_id: String,
    pub pattern: String,
    pub action: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<ParamSpec>,
}

impl StepDefinition {
    pub fn qualified_id(&self) -> String {
        format!("{}:{}", self.driver_id, self.id)
    }
}

// ============================================================================
// Drivers
// ============================================================================

/// Well-known capability flags a driver may declare
pub mod capability {
    pub const EXECUTE: &str = "execute";
    pub const INTROSPECTION: &str = "introspection";
    pub const HEALTH_CHECK: &str = "health-check";
    pub const MULTI_INSTANCE: &str = "multi-instance";
}

/// Transport strategy declared by a driver manifest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    /// Newline-delimited JSON over the child's stdin/stdout
    #[default]
    Stdio,
    /// Newline-delimited JSON over a Unix socket the driver listens on
    Unix,
}

impl std::str::FromStr for ProtocolKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "stdio" | "json-rpc" | "jsonrpc" => Ok(ProtocolKind::Stdio),
            "unix" | "unix-socket" | "ipc" => Ok(ProtocolKind::Unix),
            other => Err(format!("unsupported protocol '{}'", other)),
        }
    }
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolKind::Stdio => write!(f, "stdio"),
            ProtocolKind::Unix => write!(f, "unix"),
        }
    }
}

/// Validated description of a discovered driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub license: String,
    pub executable: PathBuf,
    pub protocol: ProtocolKind,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Directory the manifest was found in
    pub root: PathBuf,
}

impl DriverDescriptor {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn is_multi_instance(&self) -> bool {
        self.has_capability(capability::MULTI_INSTANCE)
    }
}

/// Lifecycle state of a driver connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Discovered,
    Starting,
    Ready,
    Degraded,
    Stopped,
    Failed,
}

impl DriverState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DriverState::Stopped | DriverState::Failed)
    }

    /// Whether the process is (or may soon be) able to take invocations
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            DriverState::Starting | DriverState::Ready | DriverState::Degraded
        )
    }

    pub fn can_transition_to(&self, next: DriverState) -> bool {
        use DriverState::*;
        matches!(
            (self, next),
            (Discovered, Starting)
                | (Starting, Ready)
                | (Starting, Failed)
                | (Starting, Stopped)
                | (Ready, Degraded)
                | (Ready, Stopped)
                | (Ready, Failed)
                | (Degraded, Ready)
                | (Degraded, Stopped)
                | (Degraded, Failed)
        )
    }
}

impl std::fmt::Display for DriverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverState::Discovered => write!(f, "discovered"),
            DriverState::Starting => write!(f, "starting"),
            DriverState::Ready => write!(f, "ready"),
            DriverState::Degraded => write!(f, "degraded"),
            DriverState::Stopped => write!(f, "stopped"),
            DriverState::Failed => write!(f, "failed"),
        }
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Status of one executed or skipped step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Passed,
    Failed,
    Skipped,
    Pending,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Passed => write!(f, "passed"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
            StepStatus::Pending => write!(f, "pending"),
        }
    }
}

/// Recorded result of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub keyword: StepKeyword,
    pub text: String,
    pub position: SourcePosition,
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
}

impl StepOutcome {
    pub fn new(step: &Step, status: StepStatus) -> Self {
        Self {
            keyword: step.keyword,
            text: step.text.clone(),
            position: step.position,
            status,
            duration_ms: 0,
            driver_id: None,
            action: None,
            error: None,
            artifacts: Vec::new(),
        }
    }

    pub fn skipped(step: &Step) -> Self {
        Self::new(step, StepStatus::Skipped)
    }
}
