// tests/cli_run.rs
//! The `flowrun` binary end to end

use flowrun_engine::persistence::{DocumentStore, SqlQuery, SqliteStore};
use serde_json::{json, Value};
use std::path::Path;
use std::process::Command;

fn flowrun() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_flowrun"));
    command.env("RUST_LOG", "warn");
    command
}

fn write_dataset(path: &Path, rows: &[Value]) {
    let body: Vec<String> = rows.iter().map(Value::to_string).collect();
    std::fs::write(path, body.join("\n")).unwrap();
}

#[test]
fn test_flows_lists_builtins() {
    let output = flowrun().arg("flows").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.lines().any(|line| line == "echo"));
    assert!(stdout.lines().any(|line| line == "greet"));
}

#[test]
fn test_run_writes_envelopes_and_summary() {
    let dir = tempfile::tempdir().unwrap();
    let dataset = dir.path().join("data.jsonl");
    let results = dir.path().join("results.jsonl");
    write_dataset(&dataset, &[json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]);

    let output = flowrun()
        .args(["run", "--flow", "echo", "--workers", "2", "--strategy", "spawn", "--run-id", "cli-run"])
        .arg(&dataset)
        .arg("--output")
        .arg(&results)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let summary: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["run_id"], json!("cli-run"));
    assert_eq!(summary["stats"]["succeeded"], json!(3));
    assert_eq!(summary["persistence"]["persisted"], json!(3));

    let written = std::fs::read_to_string(&results).unwrap();
    let envelopes: Vec<Value> = written
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(envelopes.len(), 3);
    assert!(envelopes.iter().all(|e| e["status"] == json!("Success")));
}

#[tokio::test]
async fn test_run_persists_to_sqlite_from_environment_config() {
    let dir = tempfile::tempdir().unwrap();
    let dataset = dir.path().join("data.jsonl");
    let database = dir.path().join("runs.db");
    write_dataset(&dataset, &[json!({"name": "Ada"}), json!({"age": 3})]);

    let output = flowrun()
        .env("FLOWRUN__PERSISTENCE__STORE", "sqlite")
        .env("FLOWRUN__PERSISTENCE__SQLITE_PATH", &database)
        .args(["run", "--flow", "greet", "--strategy", "spawn", "--run-id", "sqlite-cli"])
        .arg(&dataset)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let summary: Value = serde_json::from_slice(&output.stdout).unwrap();
    // The second row has no `name`
    assert_eq!(summary["stats"]["succeeded"], json!(1));
    assert_eq!(summary["stats"]["user_errors"], json!(1));

    let store = SqliteStore::open(&database).await.unwrap();
    let records = store
        .query_items(&SqlQuery::equality(&[("batch_run_id", json!("sqlite-cli"))]))
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
    let statuses: Vec<&Value> = records.iter().map(|r| &r["status"]).collect();
    assert!(statuses.contains(&&json!("Ok")));
    assert!(statuses.contains(&&json!("Error")));
}

#[test]
fn test_run_rejects_malformed_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let dataset = dir.path().join("data.jsonl");
    std::fs::write(&dataset, "{\"ok\": 1}\nnot json\n").unwrap();

    let output = flowrun()
        .args(["run", "--flow", "echo"])
        .arg(&dataset)
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("data.jsonl:2"));
}

#[test]
fn test_run_rejects_unknown_flow() {
    let dir = tempfile::tempdir().unwrap();
    let dataset = dir.path().join("data.jsonl");
    write_dataset(&dataset, &[json!({"n": 1})]);

    let output = flowrun()
        .args(["run", "--flow", "missing", "--strategy", "spawn"])
        .arg(&dataset)
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("flow not registered: missing"));
}
