use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::events::{EventHistory, HISTORY_CAP};
use crate::identity::Identity;
use crate::tracker::Task;

use super::process::ProcessHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Idle,
    Claiming,
    Preparing,
    Running,
    Completing,
    Failing,
}

impl WorkerPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Claiming => "claiming",
            Self::Preparing => "preparing",
            Self::Running => "running",
            Self::Completing => "completing",
            Self::Failing => "failing",
        }
    }
}

/// One worker slot. Owned and mutated by the scheduler only.
#[derive(Debug)]
pub struct WorkerState {
    pub id: usize,
    pub name: String,
    pub workspace: Option<PathBuf>,
    pub phase: WorkerPhase,
    pub task: Option<Task>,
    pub process: Option<Box<dyn ProcessHandle>>,
    pub identity: Option<Identity>,
    pub started_at: Option<Instant>,
    pub last_event_at: Option<Instant>,
    /// Tasks this worker failed, with when.
    pub failed: HashMap<String, Instant>,
    /// Generation of the current run; output tagged with any other value is stale.
    pub run_id: u64,
    pub history: EventHistory,
    /// Cleared by an operator stop.
    pub enabled: bool,
}

impl WorkerState {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            name: worker_name(id),
            workspace: None,
            phase: WorkerPhase::Idle,
            task: None,
            process: None,
            identity: None,
            started_at: None,
            last_event_at: None,
            failed: HashMap::new(),
            run_id: 0,
            history: EventHistory::with_capacity(HISTORY_CAP),
            enabled: true,
        }
    }

    pub const fn is_running(&self) -> bool {
        self.process.is_some()
    }

    /// Ready for a new task.
    pub fn is_idle(&self) -> bool {
        self.enabled && self.phase == WorkerPhase::Idle && self.process.is_none()
    }

    pub fn task_id(&self) -> Option<&str> {
        self.task.as_ref().map(|t| t.id.as_str())
    }

    /// Whether `task_id` failed here less than `cooldown` before `now`.
    /// Expired entries are dropped.
    pub fn in_cooldown(&mut self, task_id: &str, now: Instant, cooldown: Duration) -> bool {
        self.failed
            .retain(|_, at| now.saturating_duration_since(*at) < cooldown);
        self.failed.contains_key(task_id)
    }

    pub fn terminate(&mut self) {
        if let Some(process) = self.process.take() {
            process.terminate();
        }
    }

    /// Back to idle with no task. The workspace, failure history and event
    /// history are kept.
    pub fn clear_run(&mut self) {
        self.terminate();
        self.phase = WorkerPhase::Idle;
        self.task = None;
        self.identity = None;
        self.started_at = None;
        self.last_event_at = None;
    }
}

pub fn worker_name(id: usize) -> String {
    format!("worker-{id}")
}

/// Read-only view of a worker for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    pub id: usize,
    pub name: String,
    pub phase: WorkerPhase,
    pub enabled: bool,
    pub running: bool,
    pub task: Option<String>,
    pub identity: Option<String>,
    pub running_secs: Option<u64>,
    pub idle_secs: Option<u64>,
    pub retries: u32,
    pub events: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_worker_is_idle() {
        let worker = WorkerState::new(2);
        assert_eq!(worker.name, "worker-2");
        assert!(worker.is_idle());
        assert!(!worker.is_running());
        assert_eq!(worker.task_id(), None);
    }

    #[test]
    fn disabled_worker_is_not_idle() {
        let mut worker = WorkerState::new(1);
        worker.enabled = false;
        assert!(!worker.is_idle());
    }

    #[test]
    fn cooldown_expires() {
        let mut worker = WorkerState::new(1);
        let t0 = Instant::now();
        worker.failed.insert("t".into(), t0);
        let cooldown = Duration::from_secs(300);

        assert!(worker.in_cooldown("t", t0 + Duration::from_secs(10), cooldown));
        assert!(!worker.in_cooldown("other", t0, cooldown));
        assert!(!worker.in_cooldown("t", t0 + Duration::from_secs(301), cooldown));
        assert!(worker.failed.is_empty());
    }
}
