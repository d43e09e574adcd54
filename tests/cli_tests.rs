use assert_cmd::Command;
use predicates::prelude::*;
use std::path::PathBuf;
use tempfile::TempDir;

fn bundle(dir: &TempDir, name: &str, code: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, code).unwrap();
    path
}

fn rill_run() -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("rill-run").unwrap();
    cmd.env_remove("RILL_PROVIDER").arg("--provider").arg("quickjs");
    cmd
}

const LIST_BUNDLE: &str = r#"
const { createNode, appendChild, setText, onEvent, ROOT_ID } = require('rill');
module.exports = function (props) {
  const list = createNode('List', { title: props.title });
  appendChild(ROOT_ID, list);
  onEvent('add', function (item) {
    const row = createNode('Row', {});
    setText(row, item.label);
    appendChild(list, row);
  });
};
"#;

#[test]
fn test_prints_tree_with_props() {
    let dir = TempDir::new().unwrap();
    let path = bundle(&dir, "list.js", LIST_BUNDLE);

    let output = rill_run()
        .arg(&path)
        .arg("--props")
        .arg(r#"{"title":"Inbox"}"#)
        .output()
        .unwrap();
    assert!(output.status.success());

    let tree: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let list = &tree["root"]["children"][0];
    assert_eq!(list["type"], "List");
    assert_eq!(list["props"]["title"], "Inbox");
}

#[test]
fn test_events_are_delivered_after_load() {
    let dir = TempDir::new().unwrap();
    let path = bundle(&dir, "list.js", LIST_BUNDLE);

    let output = rill_run()
        .arg(&path)
        .arg("--event")
        .arg(r#"add={"label":"first"}"#)
        .arg("--event")
        .arg(r#"add={"label":"second"}"#)
        .output()
        .unwrap();
    assert!(output.status.success());

    let tree: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let rows = tree["root"]["children"][0]["children"].as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1]["props"]["text"], "second");
}

#[test]
fn test_health_output() {
    let dir = TempDir::new().unwrap();
    let path = bundle(&dir, "list.js", LIST_BUNDLE);

    let output = rill_run()
        .arg(&path)
        .arg("--output")
        .arg("health")
        .output()
        .unwrap();
    assert!(output.status.success());

    let health: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(health["loaded"], true);
    assert_eq!(health["state"], "loaded");
    assert_eq!(health["errorCount"], 0);
    assert_eq!(health["receiverNodes"], 2);
}

#[test]
fn test_all_output_has_every_section() {
    let dir = TempDir::new().unwrap();
    let path = bundle(&dir, "list.js", LIST_BUNDLE);

    let output = rill_run().arg(&path).arg("--output").arg("all").output().unwrap();
    assert!(output.status.success());

    let all: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(all["tree"]["root"].is_object());
    assert_eq!(all["diagnostics"]["provider"], "quickjs");
    assert_eq!(all["health"]["destroyed"], false);
}

#[test]
fn test_timeout_fails_with_error_kind() {
    let dir = TempDir::new().unwrap();
    let path = bundle(&dir, "spin.js", "while (true) {}");

    rill_run()
        .arg(&path)
        .arg("--timeout-ms")
        .arg("200")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("TimeoutError"));
}

#[test]
fn test_require_outside_whitelist_fails() {
    let dir = TempDir::new().unwrap();
    let path = bundle(&dir, "fs.js", "require('fs');");

    rill_run()
        .arg(&path)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("UnsupportedRequireError"))
        .stderr(predicate::str::contains("'fs'"));
}

#[test]
fn test_allow_extends_nothing_but_what_is_listed() {
    let dir = TempDir::new().unwrap();
    let path = bundle(&dir, "sdk.js", "require('rill/sdk');");

    // `--allow rill` replaces the default list, so `rill/sdk` is rejected
    rill_run()
        .arg(&path)
        .arg("--allow")
        .arg("rill")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("UnsupportedRequireError"));
}

#[test]
fn test_config_file_is_applied() {
    let dir = TempDir::new().unwrap();
    let path = bundle(&dir, "spin.js", "while (true) {}");
    let config = dir.path().join("engine.json");
    std::fs::write(&config, r#"{"timeoutMs": 150}"#).unwrap();

    rill_run()
        .arg(&path)
        .arg("--config")
        .arg(&config)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("150ms"));
}

#[test]
fn test_missing_bundle_is_a_usage_error() {
    let dir = TempDir::new().unwrap();

    rill_run()
        .arg(dir.path().join("nope.js"))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("failed to read bundle"));
}

#[test]
fn test_invalid_props_are_rejected() {
    let dir = TempDir::new().unwrap();
    let path = bundle(&dir, "list.js", LIST_BUNDLE);

    rill_run()
        .arg(&path)
        .arg("--props")
        .arg("{not json")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--props"));
}
