//! Process-wide task ownership.
//!
//! The registry maps a task id to the worker that owns it, masks recently
//! completed tasks from re-selection (the tracker may not reflect a finished
//! task yet), and counts "uncommitted changes, retrying" cycles per task. All
//! three maps sit behind one mutex; reads take the same lock as writes.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// How long a completed task stays masked from selection.
pub const COMPLETION_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Retries allowed after a run leaves significant uncommitted changes.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Debug, Default)]
struct ClaimState {
    claims: HashMap<String, String>,
    completed: HashMap<String, Instant>,
    retries: HashMap<String, u32>,
}

/// Result of bumping a task's retry counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryCheck {
    pub count: u32,
    /// True once `count` is strictly greater than the maximum.
    pub exceeded: bool,
}

#[derive(Debug)]
pub struct ClaimRegistry {
    state: Mutex<ClaimState>,
    completion_window: Duration,
}

impl Default for ClaimRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClaimRegistry {
    pub fn new() -> Self {
        Self::with_completion_window(COMPLETION_WINDOW)
    }

    pub fn with_completion_window(completion_window: Duration) -> Self {
        Self {
            state: Mutex::new(ClaimState::default()),
            completion_window,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClaimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `task_id` for `worker` if nobody holds it. Returns whether the
    /// caller won.
    pub fn claim(&self, task_id: &str, worker: &str) -> bool {
        let mut state = self.lock();
        if state.claims.contains_key(task_id) {
            return false;
        }
        state.claims.insert(task_id.to_string(), worker.to_string());
        true
    }

    /// Drop the claim on `task_id`, whoever holds it.
    pub fn release(&self, task_id: &str) {
        self.lock().claims.remove(task_id);
    }

    pub fn is_claimed(&self, task_id: &str) -> bool {
        self.lock().claims.contains_key(task_id)
    }

    pub fn claimed_by(&self, task_id: &str) -> Option<String> {
        self.lock().claims.get(task_id).cloned()
    }

    /// Number of live claims.
    pub fn claim_count(&self) -> usize {
        self.lock().claims.len()
    }

    pub fn mark_completed(&self, task_id: &str) {
        let now = Instant::now();
        let window = self.completion_window;
        let mut state = self.lock();
        state
            .completed
            .retain(|_, at| now.duration_since(*at) < window);
        state.completed.insert(task_id.to_string(), now);
    }

    /// Whether `task_id` completed within the window. Expired entries are
    /// purged here.
    pub fn is_completed(&self, task_id: &str) -> bool {
        let mut state = self.lock();
        match state.completed.get(task_id) {
            Some(at) if at.elapsed() < self.completion_window => true,
            Some(_) => {
                state.completed.remove(task_id);
                false
            }
            None => false,
        }
    }

    pub fn increment_retry(&self, task_id: &str, max: u32) -> RetryCheck {
        let mut state = self.lock();
        let count = state.retries.entry(task_id.to_string()).or_insert(0);
        *count += 1;
        RetryCheck {
            count: *count,
            exceeded: *count > max,
        }
    }

    pub fn retry_count(&self, task_id: &str) -> u32 {
        self.lock().retries.get(task_id).copied().unwrap_or(0)
    }

    pub fn clear_retry(&self, task_id: &str) {
        self.lock().retries.remove(task_id);
    }
}
