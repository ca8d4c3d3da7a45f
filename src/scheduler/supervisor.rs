//! Staleness checks for running workers.

use std::time::{Duration, Instant};

use crate::error::DispatchError;

use super::worker::WorkerState;

/// How long a task stays off-limits to the worker that failed it.
pub const FAILURE_COOLDOWN: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessLimits {
    pub idle_timeout: Duration,
    pub max_runtime: Duration,
}

/// The timeout a running worker has hit, if any. Idle is checked first.
pub fn check(worker: &WorkerState, now: Instant, limits: StalenessLimits) -> Option<DispatchError> {
    if !worker.is_running() {
        return None;
    }
    if let Some(last) = worker.last_event_at.or(worker.started_at) {
        let idle = now.saturating_duration_since(last);
        if idle > limits.idle_timeout {
            return Some(DispatchError::IdleTimeout {
                idle_secs: idle.as_secs(),
            });
        }
    }
    if let Some(started) = worker.started_at
        && now.saturating_duration_since(started) > limits.max_runtime
    {
        return Some(DispatchError::RuntimeTimeout {
            limit_secs: limits.max_runtime.as_secs(),
        });
    }
    None
}
