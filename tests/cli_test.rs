//! Command-line integration tests
//!
//! Runs the `toolgate` binary against temporary configuration files and
//! `mock_tool_server` processes.

use assert_cmd::Command;
use predicates::prelude::*;

mod common;

fn toolgate(config: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("toolgate").unwrap();
    cmd.env_remove("RUST_LOG")
        .env_remove("TOOLGATE_CONFIG")
        .arg("--config")
        .arg(config);
    cmd
}

#[test]
fn test_validate_reports_servers() {
    let (_dir, path) = common::temp_config_file(&common::mock_config_yaml(&["alpha", "beta"]));
    toolgate(&path)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid: 2 server(s), 2 enabled"));
}

#[test]
fn test_validate_rejects_duplicate_ids() {
    let (_dir, path) = common::temp_config_file(&common::mock_config_yaml(&["alpha", "alpha"]));
    toolgate(&path)
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("duplicate server id"));
}

#[test]
fn test_validate_warns_about_missing_commands() {
    let (_dir, path) = common::temp_config_file(
        "servers:\n  - id: ghost\n    name: Ghost\n    command: /nonexistent/toolgate-server\n",
    );
    toolgate(&path)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid: 1 server(s), 1 enabled"))
        .stderr(predicate::str::contains(
            "server `ghost`: command `/nonexistent/toolgate-server` not found",
        ));
}

#[test]
fn test_malformed_config_fails() {
    let (_dir, path) = common::temp_config_file("servers: [");
    toolgate(&path).arg("validate").assert().failure();
}

#[test]
fn test_missing_config_uses_defaults() {
    let dir = tempfile::TempDir::new().unwrap();
    toolgate(&dir.path().join("absent.yaml"))
        .arg("servers")
        .assert()
        .success()
        .stdout(predicate::str::contains("No servers configured."));
}

#[test]
fn test_tools_json_lists_indexed_tools() {
    let (_dir, path) = common::temp_config_file(&common::mock_config_yaml(&["alpha"]));
    let output = toolgate(&path)
        .args(["tools", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let tools: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let names: Vec<&str> = tools
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["tool"]["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["echo", "add", "fail", "slow", "crash"]);
    assert!(tools.as_array().unwrap().iter().all(|t| t["serverId"] == "alpha"));
}

#[test]
fn test_tools_pattern_filters() {
    let (_dir, path) = common::temp_config_file(&common::mock_config_yaml(&["alpha"]));
    toolgate(&path)
        .args(["tools", "--pattern", "ad*"])
        .assert()
        .success()
        .stdout(predicate::str::contains("add").and(predicate::str::contains("echo").not()));
}

#[test]
fn test_call_prints_response() {
    let (_dir, path) = common::temp_config_file(&common::mock_config_yaml(&["alpha"]));
    let output = toolgate(&path)
        .args(["call", "add", "--args", r#"{"a": 1, "b": 2}"#])
        .output()
        .unwrap();
    assert!(output.status.success());
    let response: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(response["success"], true);
    assert_eq!(response["data"]["sum"], 3.0);
    assert_eq!(response["serverId"], "alpha");
}

#[test]
fn test_failed_call_exits_non_zero() {
    let (_dir, path) = common::temp_config_file(&common::mock_config_yaml(&["alpha"]));
    toolgate(&path)
        .args(["call", "fail", "--args", r#"{"message": "nope"}"#])
        .assert()
        .failure()
        .stdout(predicate::str::contains("TOOL_EXECUTION_ERROR"));

    toolgate(&path)
        .args(["call", "missing_tool"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("TOOL_NOT_FOUND"));
}

#[test]
fn test_call_rejects_non_object_arguments() {
    let (_dir, path) = common::temp_config_file(&common::mock_config_yaml(&["alpha"]));
    toolgate(&path)
        .args(["call", "echo", "--args", "[1, 2]"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("JSON object"));
}

#[test]
fn test_servers_and_health() {
    let (_dir, path) = common::temp_config_file(&common::mock_config_yaml(&["alpha"]));
    toolgate(&path)
        .arg("servers")
        .assert()
        .success()
        .stdout(predicate::str::contains("alpha").and(predicate::str::contains("Mock alpha")));

    let output = toolgate(&path).args(["health", "--json"]).output().unwrap();
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["summary"]["total"], 1);
    assert_eq!(report["servers"][0]["serverId"], "alpha");
    assert_eq!(report["servers"][0]["totalChecks"], 1);
}
