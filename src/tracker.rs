//! Adapter for the task tracker CLI.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::subprocess::Tool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    #[serde(alias = "open")]
    Ready,
    #[serde(alias = "in-progress")]
    InProgress,
    #[serde(alias = "closed")]
    Done,
    #[serde(other)]
    Other,
}

impl TaskStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "open",
            Self::InProgress => "in_progress",
            Self::Done => "closed",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub assignee: Option<String>,
}

/// Operations the scheduler needs from the tracker.
pub trait TaskTracker {
    fn list(&self) -> anyhow::Result<Vec<Task>>;
    /// Unblocked, unassigned tasks in the tracker's order.
    fn ready(&self) -> anyhow::Result<Vec<Task>>;
    /// Human-readable detail for the directive.
    fn show(&self, id: &str) -> anyhow::Result<String>;
    fn update(&self, id: &str, status: TaskStatus, assignee: &str) -> anyhow::Result<()>;
    /// Re-import the tracker's local cache.
    fn import(&self) -> anyhow::Result<()>;
}

/// [`TaskTracker`] that shells out to a `bd`-style CLI.
#[derive(Debug, Clone)]
pub struct CliTracker {
    program: String,
    cwd: PathBuf,
    import_args: Vec<String>,
    timeout: Duration,
}

impl CliTracker {
    pub fn new(program: &str, cwd: PathBuf, timeout: Duration) -> Self {
        Self {
            program: program.to_string(),
            cwd,
            import_args: vec!["sync".to_string(), "--import-only".to_string()],
            timeout,
        }
    }

    #[must_use]
    pub fn with_import_args(mut self, args: Vec<String>) -> Self {
        self.import_args = args;
        self
    }

    fn tool(&self) -> Tool {
        Tool::new(&self.program)
            .current_dir(&self.cwd)
            .timeout(self.timeout)
    }

    fn tasks(&self, subcommand: &str) -> anyhow::Result<Vec<Task>> {
        let output = self.tool().args(&[subcommand, "--json"]).run_ok()?;
        parse_tasks(&output.stdout)
            .with_context(|| format!("parsing `{} {subcommand} --json`", self.program))
    }
}

impl TaskTracker for CliTracker {
    fn list(&self) -> anyhow::Result<Vec<Task>> {
        self.tasks("list")
    }

    fn ready(&self) -> anyhow::Result<Vec<Task>> {
        self.tasks("ready")
    }

    fn show(&self, id: &str) -> anyhow::Result<String> {
        let output = self.tool().args(&["show", id]).run_ok()?;
        Ok(output.stdout)
    }

    fn update(&self, id: &str, status: TaskStatus, assignee: &str) -> anyhow::Result<()> {
        self.tool()
            .args(&[
                "update",
                id,
                &format!("--status={}", status.as_str()),
                &format!("--assignee={assignee}"),
            ])
            .run_ok()?;
        Ok(())
    }

    fn import(&self) -> anyhow::Result<()> {
        self.tool().args(&self.import_args).run_ok()?;
        Ok(())
    }
}

/// Decode tracker JSON. Empty output and `null` mean no tasks.
pub fn parse_tasks(stdout: &str) -> anyhow::Result<Vec<Task>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(trimmed)?)
}

/// Tasks assigned to `worker` that are already in progress; these are
/// resumed before new work is picked.
pub fn assigned_in_progress<'a>(tasks: &'a [Task], worker: &str) -> impl Iterator<Item = &'a Task> {
    tasks.iter().filter(move |t| {
        t.status == TaskStatus::InProgress && t.assignee.as_deref() == Some(worker)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tracker_output() {
        let json = r#"[
            {"id": "bd-1", "title": "Fix parser", "status": "open", "priority": 1},
            {"id": "bd-2", "title": "Add flag", "status": "in_progress", "priority": 2, "assignee": "worker-1"},
            {"id": "bd-3", "title": "Old", "status": "closed", "priority": 3, "labels": ["x"]},
            {"id": "bd-4", "status": "blocked"}
        ]"#;
        let tasks = parse_tasks(json).unwrap();
        assert_eq!(tasks.len(), 4);
        assert_eq!(tasks[0].status, TaskStatus::Ready);
        assert_eq!(tasks[1].status, TaskStatus::InProgress);
        assert_eq!(tasks[1].assignee.as_deref(), Some("worker-1"));
        assert_eq!(tasks[2].status, TaskStatus::Done);
        assert_eq!(tasks[3].status, TaskStatus::Other);
        assert_eq!(tasks[3].title, "");
    }

    #[test]
    fn parse_empty_output() {
        assert!(parse_tasks("").unwrap().is_empty());
        assert!(parse_tasks("null\n").unwrap().is_empty());
        assert!(parse_tasks("not json").is_err());
    }

    #[test]
    fn in_progress_filter_matches_assignee() {
        let tasks = parse_tasks(
            r#"[
            {"id": "a", "status": "in_progress", "assignee": "worker-2"},
            {"id": "b", "status": "in_progress", "assignee": "worker-1"},
            {"id": "c", "status": "open", "assignee": "worker-1"}
        ]"#,
        )
        .unwrap();
        let ids: Vec<_> = assigned_in_progress(&tasks, "worker-1")
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[test]
    fn cli_tracker_runs_program() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("tracker.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\ncase \"$1\" in\n  ready) echo '[{\"id\":\"t-1\",\"title\":\"one\",\"status\":\"open\"}]' ;;\n  show) echo \"detail for $2\" ;;\n  update) echo \"$@\" > updated.txt ;;\n  *) exit 1 ;;\nesac\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let tracker = CliTracker::new(
            &script.to_string_lossy(),
            dir.path().to_path_buf(),
            Duration::from_secs(5),
        );
        let ready = tracker.ready().unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "t-1");
        assert_eq!(tracker.show("t-1").unwrap().trim(), "detail for t-1");

        tracker
            .update("t-1", TaskStatus::InProgress, "worker-1")
            .unwrap();
        let updated = std::fs::read_to_string(dir.path().join("updated.txt")).unwrap();
        assert_eq!(
            updated.trim(),
            "update t-1 --status=in_progress --assignee=worker-1"
        );

        assert!(tracker.import().is_err());
    }
}
