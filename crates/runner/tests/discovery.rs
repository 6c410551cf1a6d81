//! Driver discovery and session tests
//!
//! Builds driver directories with real manifests and checks what a session
//! sees without launching anything, plus one end-to-end run against a
//! shell-script driver.

use std::fs;
use std::path::Path;

use stepwise_runner::{parser, RunnerConfig, Session};
use tempfile::TempDir;

fn write_driver(root: &Path, id: &str, manifest: serde_json::Value) {
    let dir = root.join(id);
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("manifest.json"),
        serde_json::to_string_pretty(&manifest).unwrap(),
    )
    .unwrap();
}

fn browser_manifest() -> serde_json::Value {
    serde_json::json!({
        "name": "Browser",
        "version": "1.2.0",
        "executable": "bin/browser-driver",
        "features": ["execute", "introspection"],
        "actions": ["open", "click"],
        "steps": [
            {
                "id": "open",
                "pattern": "I open (url)",
                "action": "open",
                "parameters": [{"name": "url", "type": "string"}]
            },
            {
                "id": "click",
                "pattern": "I click (times:int) times",
                "action": "click"
            }
        ]
    })
}

fn session_for(drivers: &Path) -> Session {
    let mut config = RunnerConfig::default();
    config.drivers.directory = drivers.to_path_buf();
    Session::new(config)
}

#[test]
fn test_discovery_skips_invalid_manifests() {
    let tmp = TempDir::new().unwrap();
    write_driver(tmp.path(), "browser", browser_manifest());
    write_driver(
        tmp.path(),
        "nameless",
        serde_json::json!({"executable": "x", "actions": ["a"]}),
    );
    write_driver(
        tmp.path(),
        "broken-pattern",
        serde_json::json!({
            "name": "Broken",
            "executable": "x",
            "steps": [{"id": "s", "pattern": "I (a)(b)", "action": "a"}]
        }),
    );
    fs::create_dir_all(tmp.path().join("not-a-driver")).unwrap();
    fs::write(tmp.path().join("stray.json"), "{}").unwrap();

    let session = session_for(tmp.path());
    let loaded = session.initialize_registries().unwrap();

    assert_eq!(loaded, vec!["browser".to_string()]);
    assert_eq!(session.list_driver_ids(), vec!["browser".to_string()]);
    assert_eq!(session.get_registered_drivers(), vec!["browser".to_string()]);

    let descriptor = session.get_driver_descriptor("browser").unwrap();
    assert_eq!(descriptor.name, "Browser");
    assert_eq!(descriptor.executable, tmp.path().join("browser/bin/browser-driver"));
    assert!(descriptor.has_capability("introspection"));
}

#[test]
fn test_metadata_only_session() {
    let tmp = TempDir::new().unwrap();
    write_driver(tmp.path(), "browser", browser_manifest());

    let session = session_for(tmp.path());
    session.initialize_registries().unwrap();

    let steps = session.get_driver_steps("browser").unwrap();
    let patterns: Vec<&str> = steps.iter().map(|s| s.pattern.as_str()).collect();
    assert_eq!(patterns, vec!["I open (url)", "I click (times:int) times"]);
    assert!(steps.iter().all(|s| s.driver_id == "browser"));

    // Resolution and dry runs work even though the executable does not exist
    let doc = parser::parse(
        "Feature: Browse\n  Scenario: s\n    Given I open /home\n    When I click 3 times\n    Then I see nothing\n",
    )
    .unwrap();
    let report = session.check(&doc);
    assert!(report.dry_run);
    assert_eq!(report.summary.steps_skipped, 2);
    assert_eq!(report.summary.steps_pending, 1);
    assert!(session.connection_infos().is_empty());
}

#[test]
fn test_register_steps_replaces_definitions() {
    let tmp = TempDir::new().unwrap();
    write_driver(tmp.path(), "browser", browser_manifest());
    let session = session_for(tmp.path());
    session.initialize_registries().unwrap();

    let mut steps = session.get_driver_steps("browser").unwrap();
    steps.truncate(1);
    steps[0].pattern = "I navigate to (url)".to_string();
    assert_eq!(session.register_steps("browser", steps).unwrap(), 1);

    assert!(session.steps().resolve("I open /x").is_err());
    let matched = session.steps().resolve("I navigate to /x").unwrap();
    assert_eq!(matched.params["url"], "/x");
}

#[cfg(unix)]
#[tokio::test]
async fn test_end_to_end_shell_driver() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = TempDir::new().unwrap();
    let drivers = tmp.path().join("drivers");
    write_driver(
        &drivers,
        "shell",
        serde_json::json!({
            "name": "Shell",
            "executable": "driver.sh",
            "actions": ["greet"],
            "steps": [{"id": "greet", "pattern": "I greet (name)", "action": "greet"}]
        }),
    );
    let script = drivers.join("shell/driver.sh");
    fs::write(
        &script,
        r#"#!/bin/sh
echo '{"type":"event","method":"ready"}'
while read -r line; do
  id=$(echo "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  method=$(echo "$line" | sed -n 's/.*"method":"\([^"]*\)".*/\1/p')
  echo "{\"id\":\"$id\",\"type\":\"response\",\"method\":\"$method\",\"result\":{\"ok\":true}}"
  if [ "$method" = "shutdown" ]; then exit 0; fi
done
"#,
    )
    .unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let mut config = RunnerConfig::default();
    config.drivers.directory = drivers;
    config.execution.step_timeout_ms = 5_000;
    config.output.report_dir = tmp.path().join("reports");
    let session = Session::new(config);
    session.initialize_registries().unwrap();

    let doc = parser::parse(
        "Feature: Greeting\n  Scenario: hello\n    Given I greet world\n    Then I greet everyone\n",
    )
    .unwrap();
    let report = session.run(&doc).await;
    session.shutdown().await;

    assert!(report.is_success(), "{:?}", report.scenarios);
    assert_eq!(report.summary.steps_passed, 2);

    let path = session.write_report(&report).unwrap();
    let written: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(written["feature"], "Greeting");
}
