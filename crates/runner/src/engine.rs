//! Scenario execution engine
//!
//! Runs the scenarios of a feature document against the step and driver
//! registries and produces a [`Report`]. Steps within a scenario run one
//! after another; scenarios run concurrently up to the parallelism limit.

use chrono::Utc;
use futures::StreamExt;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stepwise_common::{
    Background, Error, ErrorDetail, FeatureDocument, ProtocolErrorKind, Scenario, Step,
    StepArgument, StepOutcome, StepStatus,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ExecutionConfig;
use crate::registry::{DriverConnection, DriverRegistry};
use crate::report::{Report, ScenarioReport, ScenarioStatus, Summary};
use crate::steps::{StepMatch, StepRegistry};

/// Scenarios with this tag keep executing after a failed step
pub const CONTINUE_ON_ERROR_TAG: &str = "continue-on-error";

/// Per-run execution options
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub parallelism: usize,
    pub lazy_start: bool,
    pub step_timeout: Duration,
    pub timeout_retries: u32,
    pub include_tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    /// Cancels every scenario of the run at its next step boundary
    pub cancel: CancellationToken,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_config(&ExecutionConfig::default())
    }
}

impl RunOptions {
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            parallelism: config.parallelism.max(1),
            lazy_start: config.lazy_start,
            step_timeout: config.step_timeout(),
            timeout_retries: config.timeout_retries,
            include_tags: config.include_tags.clone(),
            exclude_tags: config.exclude_tags.clone(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Tag filter: any include tag (when given) and no exclude tag
    pub fn selects(&self, scenario: &Scenario) -> bool {
        if self.exclude_tags.iter().any(|t| scenario.has_tag(t)) {
            return false;
        }
        self.include_tags.is_empty() || self.include_tags.iter().any(|t| scenario.has_tag(t))
    }
}

/// State private to one scenario execution
#[derive(Debug)]
pub struct ExecutionContext {
    scenario: String,
    variables: BTreeMap<String, Value>,
    artifacts: Vec<String>,
    /// Dedicated instances of multi-instance drivers
    instances: HashMap<String, Arc<DriverConnection>>,
    cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(scenario: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            scenario: scenario.into(),
            variables: BTreeMap::new(),
            artifacts: Vec::new(),
            instances: HashMap::new(),
            cancel,
        }
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn artifacts(&self) -> &[String] {
        &self.artifacts
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Replace `${name}` with bound variables; unknown names are left as-is
    pub fn substitute(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                out.push_str(&rest[start..]);
                return out;
            };
            let name = &after[..end];
            match self.variables.get(name) {
                Some(Value::String(s)) => out.push_str(s),
                Some(other) => out.push_str(&other.to_string()),
                None => out.push_str(&rest[start..start + 2 + end + 1]),
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        out
    }

    /// Take `variables` and `artifacts` from a driver result; returns the new artifacts
    pub fn absorb(&mut self, result: &Value) -> Vec<String> {
        if let Some(variables) = result.get("variables").and_then(Value::as_object) {
            for (name, value) in variables {
                self.variables.insert(name.clone(), value.clone());
            }
        }

        let added: Vec<String> = result
            .get("artifacts")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => s.clone(),
                        other => other
                            .get("path")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .unwrap_or_else(|| other.to_string()),
                    })
                    .collect()
            })
            .unwrap_or_default();
        self.artifacts.extend(added.iter().cloned());
        added
    }
}

/// Executes feature documents
pub struct ExecutionEngine {
    steps: Arc<StepRegistry>,
    drivers: Arc<DriverRegistry>,
}

impl ExecutionEngine {
    pub fn new(steps: Arc<StepRegistry>, drivers: Arc<DriverRegistry>) -> Self {
        Self { steps, drivers }
    }

    /// Run every selected scenario of a document
    pub async fn run(&self, document: &FeatureDocument, options: &RunOptions) -> Report {
        let started_at = Utc::now();
        let start = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();

        let selected: Vec<&Scenario> = document
            .scenarios
            .iter()
            .filter(|s| options.selects(s))
            .collect();
        info!(
            run_id = %run_id,
            feature = %document.title,
            "Running {} of {} scenario(s)",
            selected.len(),
            document.scenarios.len()
        );

        let background = document.background.as_ref();
        let scenarios: Vec<ScenarioReport> = futures::stream::iter(
            selected
                .into_iter()
                .map(|scenario| self.run_scenario(background, scenario, options)),
        )
        .buffered(options.parallelism.max(1))
        .collect()
        .await;

        let summary = Summary::from_scenarios(&scenarios);
        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            run_id = %run_id,
            "Results: {} passed, {} failed, {} skipped ({} ms)",
            summary.passed,
            summary.failed,
            summary.skipped,
            duration_ms
        );

        Report {
            run_id,
            feature: document.title.clone(),
            source: document.source.clone(),
            dry_run: false,
            started_at,
            finished_at: Utc::now(),
            duration_ms,
            scenarios,
            summary,
        }
    }

    /// Resolve every step without contacting drivers. Unresolved steps are
    /// `pending`; resolved steps are `skipped`.
    pub fn check(&self, document: &FeatureDocument, options: &RunOptions) -> Report {
        let started_at = Utc::now();
        let background = document.background.as_ref();

        let scenarios: Vec<ScenarioReport> = document
            .scenarios
            .iter()
            .filter(|s| options.selects(s))
            .map(|scenario| {
                let outcomes: Vec<StepOutcome> = all_steps(background, scenario)
                    .map(|step| {
                        let mut outcome = StepOutcome::skipped(step);
                        match self.steps.resolve(&step.text) {
                            Ok(matched) => {
                                outcome.driver_id = Some(matched.driver_id().to_string());
                                outcome.action = Some(matched.action().to_string());
                            }
                            Err(e) => {
                                outcome.status = StepStatus::Pending;
                                outcome.error = Some(ErrorDetail::from_error(&e));
                            }
                        }
                        outcome
                    })
                    .collect();

                ScenarioReport {
                    name: scenario.name.clone(),
                    tags: scenario.tags.clone(),
                    status: ScenarioStatus::from_outcomes(&outcomes),
                    duration_ms: 0,
                    outcomes,
                    artifacts: Vec::new(),
                    cancelled: false,
                }
            })
            .collect();

        let summary = Summary::from_scenarios(&scenarios);
        Report {
            run_id: uuid::Uuid::new_v4().to_string(),
            feature: document.title.clone(),
            source: document.source.clone(),
            dry_run: true,
            started_at,
            finished_at: Utc::now(),
            duration_ms: 0,
            scenarios,
            summary,
        }
    }

    async fn run_scenario(
        &self,
        background: Option<&Background>,
        scenario: &Scenario,
        options: &RunOptions,
    ) -> ScenarioReport {
        let start = Instant::now();
        let mut ctx = ExecutionContext::new(&scenario.name, options.cancel.child_token());
        let continue_on_error = scenario.has_tag(CONTINUE_ON_ERROR_TAG);
        debug!(scenario = %scenario.name, "Scenario started");

        let mut outcomes = Vec::new();
        let mut halted = false;
        let mut cancelled = false;

        for step in all_steps(background, scenario) {
            if !halted && ctx.is_cancelled() {
                info!(scenario = %scenario.name, "Scenario cancelled");
                cancelled = true;
                halted = true;
            }
            if halted {
                outcomes.push(StepOutcome::skipped(step));
                continue;
            }

            let outcome = self.run_step(step, &mut ctx, options).await;
            if outcome.status == StepStatus::Failed && !continue_on_error {
                halted = true;
            }
            outcomes.push(outcome);
        }

        for (_, instance) in ctx.instances.drain() {
            self.drivers.release_instance(&instance).await;
        }

        let report = ScenarioReport {
            name: scenario.name.clone(),
            tags: scenario.tags.clone(),
            status: ScenarioStatus::from_outcomes(&outcomes),
            duration_ms: start.elapsed().as_millis() as u64,
            outcomes,
            artifacts: ctx.artifacts,
            cancelled,
        };

        if report.status == ScenarioStatus::Failed {
            let cause = report
                .outcomes
                .iter()
                .find_map(|o| o.error.as_ref())
                .map(|e| e.to_string())
                .unwrap_or_default();
            error!("✗ {} - {}", report.name, cause);
        } else {
            info!("✓ {} ({} ms)", report.name, report.duration_ms);
        }

        report
    }

    async fn run_step(
        &self,
        step: &Step,
        ctx: &mut ExecutionContext,
        options: &RunOptions,
    ) -> StepOutcome {
        let start = Instant::now();
        let mut outcome = StepOutcome::new(step, StepStatus::Passed);
        outcome.text = ctx.substitute(&step.text);

        let matched = match self.steps.resolve(&outcome.text) {
            Ok(matched) => matched,
            Err(e) => return failed(outcome, ErrorDetail::from_error(&e), start),
        };
        let driver_id = matched.driver_id().to_string();
        let step_id = matched.definition.id.clone();
        outcome.driver_id = Some(driver_id.clone());
        outcome.action = Some(matched.action().to_string());

        let detail = |e: &Error| {
            ErrorDetail::from_error(e)
                .with_driver(driver_id.clone())
                .with_step(step_id.clone())
        };

        let connection = match self.connection_for(&driver_id, ctx, options).await {
            Ok(connection) => connection,
            Err(e) => return failed(outcome, detail(&e), start),
        };

        let params = invoke_params(&matched, step, ctx);
        let mut attempt = 0;
        let result = loop {
            let result = connection
                .invoke(matched.action(), params.clone(), options.step_timeout)
                .await;
            match result {
                Err(Error::Protocol(ref e))
                    if e.kind == ProtocolErrorKind::Timeout && attempt < options.timeout_retries =>
                {
                    attempt += 1;
                    warn!(
                        scenario = %ctx.scenario,
                        driver_id = %driver_id,
                        action = matched.action(),
                        attempt,
                        "Step timed out, retrying"
                    );
                }
                other => break other,
            }
        };

        match result {
            Ok(value) => {
                outcome.artifacts = ctx.absorb(&value);
                outcome.duration_ms = start.elapsed().as_millis() as u64;
                outcome
            }
            Err(e) => failed(outcome, detail(&e), start),
        }
    }

    /// Shared connection, or a scenario-owned instance for multi-instance drivers
    async fn connection_for(
        &self,
        driver_id: &str,
        ctx: &mut ExecutionContext,
        options: &RunOptions,
    ) -> stepwise_common::Result<Arc<DriverConnection>> {
        let multi_instance = self
            .drivers
            .descriptor(driver_id)
            .map(|d| d.is_multi_instance())
            .unwrap_or(false);
        if !multi_instance {
            return self.drivers.connection(driver_id, options.lazy_start).await;
        }

        if let Some(instance) = ctx.instances.get(driver_id) {
            return Ok(instance.clone());
        }
        let instance = self
            .drivers
            .start_instance(driver_id)
            .await
            .map_err(|e| Error::DriverUnavailable {
                driver_id: driver_id.to_string(),
                reason: e.to_string(),
            })?;
        ctx.instances.insert(driver_id.to_string(), instance.clone());
        Ok(instance)
    }
}

fn all_steps<'a>(
    background: Option<&'a Background>,
    scenario: &'a Scenario,
) -> impl Iterator<Item = &'a Step> {
    background
        .into_iter()
        .flat_map(|b| b.steps.iter())
        .chain(scenario.steps.iter())
}

fn failed(mut outcome: StepOutcome, error: ErrorDetail, start: Instant) -> StepOutcome {
    debug!(step = %outcome.text, "Step failed: {}", error);
    outcome.status = StepStatus::Failed;
    outcome.error = Some(error);
    outcome.duration_ms = start.elapsed().as_millis() as u64;
    outcome
}

/// Captured parameters plus the step's table or doc string
fn invoke_params(matched: &StepMatch, step: &Step, ctx: &ExecutionContext) -> Value {
    let mut params: Map<String, Value> = matched.params.clone();
    match &step.argument {
        Some(StepArgument::DataTable { rows }) => {
            let rows: Vec<Value> = rows
                .iter()
                .map(|row| {
                    Value::Array(
                        row.iter()
                            .map(|cell| Value::String(ctx.substitute(cell)))
                            .collect(),
                    )
                })
                .collect();
            params.insert("table".to_string(), Value::Array(rows));
        }
        Some(StepArgument::DocString { content, .. }) => {
            params.insert(
                "docString".to_string(),
                Value::String(ctx.substitute(content)),
            );
        }
        None => {}
    }
    Value::Object(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::parser;
    use crate::testing::{descriptor, FakeDriver, FakeLauncher, FakeReply};
    use serde_json::json;
    use stepwise_common::{capability, DriverDescriptor, DriverState};

    struct Harness {
        engine: ExecutionEngine,
        drivers: Arc<DriverRegistry>,
        launcher: Arc<FakeLauncher>,
    }

    fn harness(launcher: FakeLauncher, drivers: Vec<DriverDescriptor>) -> Harness {
        let launcher = Arc::new(launcher);
        let config = DriverConfig {
            startup_timeout_ms: 200,
            shutdown_timeout_ms: 100,
            ..Default::default()
        };
        let registry = Arc::new(DriverRegistry::new(config, launcher.clone()));
        let steps = Arc::new(StepRegistry::new());
        for desc in drivers {
            steps.load(&desc.id, desc.steps.clone()).unwrap();
            registry.register(desc).unwrap();
        }
        Harness {
            engine: ExecutionEngine::new(steps, registry.clone()),
            drivers: registry,
            launcher,
        }
    }

    fn options() -> RunOptions {
        RunOptions {
            step_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    fn statuses(report: &ScenarioReport) -> Vec<StepStatus> {
        report.outcomes.iter().map(|o| o.status).collect()
    }

    fn checker() -> FakeDriver {
        FakeDriver::new(|action, params| match action {
            "fail" => FakeReply::Error(1, "assertion failed".to_string()),
            "remember" => FakeReply::Value(json!({"variables": {"value": params["value"]}})),
            _ => FakeReply::Value(json!({"ok": true})),
        })
    }

    const CHECKER_STEPS: &[(&str, &str)] = &[
        ("pass", "a step that passes"),
        ("fail", "a step that fails"),
        ("other", "another step"),
        ("remember", "I remember (value)"),
        ("recall", "I recall (value)"),
    ];

    #[tokio::test]
    async fn test_fail_fast_skips_remaining_steps() {
        let h = harness(
            FakeLauncher::new().with_driver("check", checker()),
            vec![descriptor("check", CHECKER_STEPS)],
        );
        let doc = parser::parse(
            "Feature: F\n  Scenario: s\n    Given a step that passes\n    When a step that fails\n    Then another step\n",
        )
        .unwrap();

        let report = h.engine.run(&doc, &options()).await;
        let scenario = &report.scenarios[0];
        assert_eq!(
            statuses(scenario),
            vec![StepStatus::Passed, StepStatus::Failed, StepStatus::Skipped]
        );
        assert_eq!(
            scenario.outcomes[1].error.as_ref().unwrap().kind,
            "RemoteActionError"
        );
        assert_eq!(h.launcher.actions(), vec!["pass", "fail"]);
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn test_continue_on_error_tag() {
        let h = harness(
            FakeLauncher::new().with_driver("check", checker()),
            vec![descriptor("check", CHECKER_STEPS)],
        );
        let doc = parser::parse(
            "Feature: F\n  @continue-on-error\n  Scenario: s\n    Given a step that fails\n    And nothing matches this\n    Then another step\n",
        )
        .unwrap();

        let report = h.engine.run(&doc, &options()).await;
        let scenario = &report.scenarios[0];
        assert_eq!(
            statuses(scenario),
            vec![StepStatus::Failed, StepStatus::Failed, StepStatus::Passed]
        );
        assert_eq!(scenario.outcomes[1].error.as_ref().unwrap().kind, "StepNotFound");
        assert_eq!(scenario.status, ScenarioStatus::Failed);
    }

    #[tokio::test]
    async fn test_failed_driver_does_not_affect_others() {
        let h = harness(
            FakeLauncher::new()
                .with_driver("a", FakeDriver::echo().never_ready())
                .with_driver("b", FakeDriver::echo()),
            vec![
                descriptor("a", &[("a_step", "driver a works")]),
                descriptor("b", &[("b_one", "driver b works"), ("b_two", "driver b still works")]),
            ],
        );

        let err = h.drivers.start("a").await.unwrap_err();
        assert_eq!(err.kind(), "StartTimeout");
        assert_eq!(h.drivers.state("a"), Some(DriverState::Failed));

        let doc = parser::parse(
            "Feature: F\n  Scenario: only b\n    Given driver b works\n    Then driver b still works\n  Scenario: uses a\n    Given driver a works\n",
        )
        .unwrap();
        let report = h.engine.run(&doc, &options()).await;

        assert_eq!(statuses(&report.scenarios[0]), vec![StepStatus::Passed, StepStatus::Passed]);
        let a_outcome = &report.scenarios[1].outcomes[0];
        assert_eq!(a_outcome.status, StepStatus::Failed);
        let error = a_outcome.error.as_ref().unwrap();
        assert_eq!(error.kind, "DriverUnavailable");
        assert_eq!(error.driver_id.as_deref(), Some("a"));
        assert_eq!(h.launcher.launches("a"), 1);
    }

    #[tokio::test]
    async fn test_timeout_fails_step_and_connection_stays_usable() {
        let h = harness(
            FakeLauncher::new().with_driver(
                "slow",
                FakeDriver::new(|action, _| match action {
                    "hang" => FakeReply::Silent,
                    _ => FakeReply::Value(json!({})),
                }),
            ),
            vec![descriptor("slow", &[("hang", "the driver hangs"), ("quick", "the driver answers")])],
        );
        let doc = parser::parse(
            "Feature: F\n  Scenario: hangs\n    When the driver hangs\n  Scenario: answers\n    When the driver answers\n",
        )
        .unwrap();
        let opts = RunOptions {
            step_timeout: Duration::from_millis(100),
            ..Default::default()
        };

        let report = h.engine.run(&doc, &opts).await;
        let timed_out = &report.scenarios[0].outcomes[0];
        assert_eq!(timed_out.status, StepStatus::Failed);
        assert_eq!(timed_out.error.as_ref().unwrap().kind, "Timeout");
        assert_eq!(report.scenarios[1].status, ScenarioStatus::Passed);
    }

    #[tokio::test]
    async fn test_timeout_retries() {
        let h = harness(
            FakeLauncher::new().with_driver(
                "slow",
                FakeDriver::new(|_, _| FakeReply::Silent),
            ),
            vec![descriptor("slow", &[("hang", "the driver hangs")])],
        );
        let doc = parser::parse("Feature: F\n  Scenario: s\n    When the driver hangs\n").unwrap();
        let opts = RunOptions {
            step_timeout: Duration::from_millis(50),
            timeout_retries: 2,
            ..Default::default()
        };

        let report = h.engine.run(&doc, &opts).await;
        assert_eq!(report.scenarios[0].status, ScenarioStatus::Failed);
        assert_eq!(h.launcher.actions().len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_scenarios_on_distinct_drivers() {
        let delayed = || FakeDriver::new(|_, params| {
            FakeReply::Delay(Duration::from_millis(50), json!({"seen": params}))
        });
        let h = harness(
            FakeLauncher::new().with_driver("x", delayed()).with_driver("y", delayed()),
            vec![
                descriptor("x", &[("x1", "x does (n:int)")]),
                descriptor("y", &[("y1", "y does (n:int)")]),
            ],
        );
        let doc = parser::parse(
            "Feature: F\n  Scenario: on x\n    Given x does 1\n    Then x does 2\n  Scenario: on y\n    Given y does 1\n    Then y does 2\n",
        )
        .unwrap();
        let opts = RunOptions {
            parallelism: 2,
            ..options()
        };

        let report = h.engine.run(&doc, &opts).await;
        assert!(report.is_success());
        for (scenario, driver) in report.scenarios.iter().zip(["x", "y"]) {
            let drivers: Vec<_> = scenario
                .outcomes
                .iter()
                .map(|o| o.driver_id.clone().unwrap())
                .collect();
            assert_eq!(drivers, vec![driver.to_string(), driver.to_string()]);
        }
        let x_calls: Vec<i64> = h
            .launcher
            .calls()
            .iter()
            .filter(|c| c.driver_id == "x")
            .map(|c| c.params["n"].as_i64().unwrap())
            .collect();
        assert_eq!(x_calls, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_shared_driver_serializes_without_context_leakage() {
        let h = harness(
            FakeLauncher::new().with_driver(
                "check",
                FakeDriver::new(|action, params| match action {
                    "remember" => FakeReply::Delay(
                        Duration::from_millis(30),
                        json!({"variables": {"value": params["value"]}}),
                    ),
                    _ => FakeReply::Delay(Duration::from_millis(30), json!({"got": params["value"]})),
                }),
            ),
            vec![descriptor("check", CHECKER_STEPS)],
        );
        let doc = parser::parse(
            "Feature: F\n  Scenario: first\n    Given I remember alpha\n    Then I recall ${value}\n  Scenario: second\n    Given I remember beta\n    Then I recall ${value}\n",
        )
        .unwrap();
        let opts = RunOptions {
            parallelism: 2,
            ..options()
        };

        let report = h.engine.run(&doc, &opts).await;
        assert!(report.is_success());
        assert_eq!(report.scenarios[0].outcomes[1].text, "I recall alpha");
        assert_eq!(report.scenarios[1].outcomes[1].text, "I recall beta");
        assert_eq!(h.launcher.launches("check"), 1);
        assert_eq!(h.launcher.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_multi_instance_driver_per_scenario() {
        let h = harness(FakeLauncher::new().with_driver("vm", FakeDriver::echo()), vec![]);
        let mut desc = descriptor("vm", &[("boot", "I boot a machine")]);
        desc.capabilities.insert(capability::MULTI_INSTANCE.to_string());
        h.engine.steps.load("vm", desc.steps.clone()).unwrap();
        h.drivers.register(desc).unwrap();

        let doc = parser::parse(
            "Feature: F\n  Scenario: one\n    Given I boot a machine\n    And I boot a machine\n  Scenario: two\n    Given I boot a machine\n",
        )
        .unwrap();
        let report = h.engine.run(&doc, &options()).await;

        assert!(report.is_success());
        assert_eq!(h.launcher.launches("vm"), 2);
        assert!(h.drivers.live_connections().is_empty());
    }

    #[tokio::test]
    async fn test_tag_filter_and_empty_run() {
        let h = harness(
            FakeLauncher::new().with_driver("check", checker()),
            vec![descriptor("check", CHECKER_STEPS)],
        );
        let doc = parser::parse(
            "Feature: F\n  @smoke\n  Scenario: a\n    Given a step that passes\n  @slow\n  Scenario: b\n    Given a step that passes\n",
        )
        .unwrap();

        let opts = RunOptions {
            include_tags: vec!["smoke".to_string()],
            ..options()
        };
        let report = h.engine.run(&doc, &opts).await;
        assert_eq!(report.scenarios.len(), 1);
        assert_eq!(report.scenarios[0].name, "a");

        let opts = RunOptions {
            include_tags: vec!["nightly".to_string()],
            ..options()
        };
        let report = h.engine.run(&doc, &opts).await;
        assert!(report.is_empty());
        assert!(report.is_success());
        assert_eq!(h.launcher.launches("check"), 1);
    }

    #[tokio::test]
    async fn test_background_runs_first_and_arguments_are_sent() {
        let h = harness(
            FakeLauncher::new().with_driver("check", FakeDriver::echo()),
            vec![descriptor("check", &[("setup", "a clean slate"), ("fill", "I fill the form")])],
        );
        let doc = parser::parse(
            "Feature: F\n  Background:\n    Given a clean slate\n  Scenario: s\n    When I fill the form\n      | field | value |\n      | name  | bob   |\n",
        )
        .unwrap();

        let report = h.engine.run(&doc, &options()).await;
        assert!(report.is_success());
        assert_eq!(report.scenarios[0].outcomes.len(), 2);

        let calls = h.launcher.calls();
        assert_eq!(calls[0].action, "setup");
        assert_eq!(calls[1].params["table"][1], json!(["name", "bob"]));
    }

    #[tokio::test]
    async fn test_cancellation_at_step_boundary() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let h = harness(
            FakeLauncher::new().with_driver(
                "check",
                FakeDriver::new(move |action, _| {
                    if action == "pass" {
                        trigger.cancel();
                    }
                    FakeReply::Delay(Duration::from_millis(20), json!({}))
                }),
            ),
            vec![descriptor("check", CHECKER_STEPS)],
        );
        let doc = parser::parse(
            "Feature: F\n  Scenario: s\n    Given a step that passes\n    Then another step\n",
        )
        .unwrap();

        let report = h.engine.run(&doc, &options().with_cancel(cancel)).await;
        let scenario = &report.scenarios[0];
        // The in-flight step completes and is recorded; the next is skipped
        assert_eq!(statuses(scenario), vec![StepStatus::Passed, StepStatus::Skipped]);
        assert!(scenario.cancelled);
        assert!(!report.is_success());
        assert_eq!(h.launcher.actions(), vec!["pass"]);
    }

    #[test]
    fn test_check_reports_pending_for_unresolved_steps() {
        let steps = Arc::new(StepRegistry::new());
        let desc = descriptor("check", CHECKER_STEPS);
        steps.load("check", desc.steps.clone()).unwrap();
        let registry = Arc::new(DriverRegistry::new(
            DriverConfig::default(),
            Arc::new(FakeLauncher::new()),
        ));
        let engine = ExecutionEngine::new(steps, registry);

        let doc = parser::parse(
            "Feature: F\n  Scenario: s\n    Given a step that passes\n    Then an unknown step\n",
        )
        .unwrap();
        let report = engine.check(&doc, &RunOptions::default());

        assert!(report.dry_run);
        assert_eq!(
            statuses(&report.scenarios[0]),
            vec![StepStatus::Skipped, StepStatus::Pending]
        );
        assert_eq!(report.scenarios[0].outcomes[0].driver_id.as_deref(), Some("check"));
        assert!(!report.is_success());
    }

    #[test]
    fn test_context_substitution() {
        let mut ctx = ExecutionContext::new("s", CancellationToken::new());
        ctx.set_variable("name", json!("alice"));
        ctx.set_variable("count", json!(3));
        assert_eq!(
            ctx.substitute("hi ${name}, ${count} new ${missing} ${open"),
            "hi alice, 3 new ${missing} ${open"
        );

        let added = ctx.absorb(&json!({
            "variables": {"token": "t-1"},
            "artifacts": ["shot.png", {"path": "trace.zip"}]
        }));
        assert_eq!(added, vec!["shot.png".to_string(), "trace.zip".to_string()]);
        assert_eq!(ctx.variable("token"), Some(&json!("t-1")));
        assert_eq!(ctx.artifacts().len(), 2);
    }
}
