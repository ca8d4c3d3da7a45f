use std::path::Path;
use std::process::Command as StdCommand;

use assert_cmd::Command;
use predicates::prelude::*;

fn foreman() -> Command {
    let mut cmd = Command::cargo_bin("foreman").unwrap();
    cmd.env_remove("OTEL_EXPORTER_OTLP_ENDPOINT");
    cmd
}

#[test]
fn schema_prints_config_schema() {
    foreman()
        .arg("schema")
        .assert()
        .success()
        .stdout(predicate::str::contains("idle_timeout_secs"))
        .stdout(predicate::str::contains("quota_command"));
}

#[test]
fn run_without_config_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    foreman()
        .arg("run")
        .arg("--project-root")
        .arg(dir.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains(".foreman.toml"));
}

#[test]
fn run_with_malformed_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(".foreman.toml"), "[project\nname=").unwrap();
    foreman()
        .arg("run")
        .arg("--project-root")
        .arg(dir.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("invalid .foreman.toml"));
}

fn write_identity(dir: &Path, name: &str, record: &str) {
    let sub = dir.join(name);
    std::fs::create_dir_all(&sub).unwrap();
    std::fs::write(sub.join("identity.json"), record).unwrap();
}

#[test]
fn identities_list_shows_valid_records() {
    let root = tempfile::tempdir().unwrap();
    let ids = root.path().join("ids");
    write_identity(&ids, "alice", r#"{"name": "alice", "auth_kind": "api-key"}"#);
    write_identity(&ids, "bob", "{}");
    write_identity(&ids, "broken", "not json");

    foreman()
        .args(["identities", "list", "--project-root"])
        .arg(root.path())
        .arg("--dir")
        .arg(&ids)
        .assert()
        .success()
        .stdout(predicate::str::contains("alice  api-key"))
        .stdout(predicate::str::contains("bob  oauth"))
        .stdout(predicate::str::contains("broken").not());
}

#[test]
fn identities_list_json() {
    let root = tempfile::tempdir().unwrap();
    let ids = root.path().join("ids");
    write_identity(&ids, "alice", "{}");

    let output = foreman()
        .args(["identities", "list", "--format", "json", "--project-root"])
        .arg(root.path())
        .arg("--dir")
        .arg(&ids)
        .output()
        .unwrap();
    assert!(output.status.success());
    let rows: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(rows[0]["name"], "alice");
    assert_eq!(rows[0]["auth_kind"], "oauth");
}

#[test]
fn identities_quota_requires_command() {
    let root = tempfile::tempdir().unwrap();
    foreman()
        .args(["identities", "quota", "--project-root"])
        .arg(root.path())
        .arg("--dir")
        .arg(root.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("quota_command"));
}

#[test]
fn identities_quota_runs_command_per_identity() {
    let root = tempfile::tempdir().unwrap();
    let ids = root.path().join("ids");
    write_identity(&ids, "alice", "{}");
    std::fs::write(
        root.path().join(".foreman.toml"),
        r#"
[project]
name = "demo"

[identities]
directory = "ids"
quota_command = ["sh", "-c", "printf '{\"buckets\":[{\"modelId\":\"gemini-pro\",\"remainingFraction\":0.25}]}'"]
"#,
    )
    .unwrap();

    foreman()
        .args(["identities", "quota", "--project-root"])
        .arg(root.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("alice  pro=25%"));
}

fn git_available() -> bool {
    StdCommand::new("git")
        .arg("--version")
        .output()
        .is_ok_and(|o| o.status.success())
}

fn git(dir: &Path, args: &[&str]) {
    let status = StdCommand::new("git")
        .args(["-c", "user.name=Test", "-c", "user.email=test@example.com"])
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        status.status.success(),
        "git {args:?}: {}",
        String::from_utf8_lossy(&status.stderr)
    );
}

#[test]
fn run_once_completes_a_task() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let repo = root.path();
    git(repo, &["init", "-q", "-b", "main"]);
    std::fs::write(repo.join("README.md"), "demo\n").unwrap();
    git(repo, &["add", "README.md"]);
    git(repo, &["commit", "-q", "-m", "init"]);

    let tracker = repo.join("tracker.sh");
    std::fs::write(
        &tracker,
        r#"#!/bin/sh
case "$1" in
  ready)
    if [ -f .tracker-claimed ]; then echo '[]'; else echo '[{"id":"t-1","title":"Say hello","status":"open"}]'; fi ;;
  list) echo '[]' ;;
  show) echo "$2: Say hello" ;;
  update) touch .tracker-claimed ;;
  *) exit 0 ;;
esac
"#,
    )
    .unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tracker, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    std::fs::write(
        repo.join(".foreman.toml"),
        format!(
            r#"
[project]
name = "demo"
workers = 1

[scheduler]
tick_ms = 50

[tracker]
program = "{tracker}"

[worker]
command = ["sh", "-c", "echo '{{\"type\":\"result\",\"status\":\"success\"}}'"]

[identities]
directory = "ids"
"#,
            tracker = tracker.display(),
        ),
    )
    .unwrap();

    foreman()
        .arg("run")
        .arg("--once")
        .arg("--project-root")
        .arg(repo)
        .timeout(std::time::Duration::from_secs(60))
        .assert()
        .success()
        .stderr(predicate::str::contains("started t-1"))
        .stderr(predicate::str::contains("completed t-1"));
}
