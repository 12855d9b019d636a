//! End-to-end smoke tests for the fieldbox binary.

use assert_cmd::Command;
use predicates::prelude::*;

fn write_config(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let db = dir.path().join("queue.db");
    let path = dir.path().join("fieldbox.toml");
    std::fs::write(
        &path,
        format!("[storage]\ndb_path = \"{}\"\n", db.display()),
    )
    .unwrap();
    path
}

fn fieldbox() -> Command {
    Command::cargo_bin("fieldbox").unwrap()
}

#[test]
fn stats_on_fresh_queue_is_empty() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(&dir);

    fieldbox()
        .args(["stats", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("pending:     0"));
}

#[test]
fn enqueue_then_stats_shows_one_pending() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(&dir);

    fieldbox()
        .args(["enqueue", "health", "--data", r#"{"bpm":62}"#, "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("enqueued record 1"));

    let output = fieldbox()
        .args(["stats", "--json", "--config"])
        .arg(&config)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let parsed: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(parsed["queue"]["pending"], 1);
    assert_eq!(parsed["streams"]["health"], 1);
}

#[test]
fn enqueue_rejects_unknown_stream() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(&dir);

    fieldbox()
        .args(["enqueue", "seismic", "--data", "{}", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown stream"));
}

#[test]
fn enqueue_rejects_empty_payload() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(&dir);

    fieldbox()
        .args(["enqueue", "health", "--data", "", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("empty"));
}

#[test]
fn cleanup_on_fresh_queue_removes_nothing() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(&dir);

    fieldbox()
        .args(["cleanup", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("removed 0 records"));
}
