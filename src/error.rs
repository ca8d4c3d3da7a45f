use std::process::ExitCode;

/// Errors that cause foreman to exit with a specific code.
#[derive(Debug, thiserror::Error)]
pub enum ExitError {
    #[error("config error: {0}")]
    Config(String),

    #[error("tool not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("{tool} failed (exit {code}): {message}")]
    ToolFailed {
        tool: String,
        code: i32,
        message: String,
    },

    #[error("{tool} timed out after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },

    #[error("{0}")]
    Other(String),
}

impl ExitError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ExitError::Config(_) => ExitCode::from(2),
            ExitError::ToolNotFound { .. } => ExitCode::from(3),
            ExitError::ToolFailed { .. } => ExitCode::from(4),
            ExitError::Timeout { .. } => ExitCode::from(5),
            ExitError::Other(_) => ExitCode::from(1),
        }
    }
}

/// Why a dispatch attempt or a running task ended without completing.
///
/// None of these stop the scheduler: the worker goes back to idle, the
/// claim is released and (for most variants) the task is put on cooldown
/// for that worker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("task {task} is already claimed by another worker")]
    ClaimConflict { task: String },

    #[error("workspace setup failed: {0}")]
    WorkspaceCreationFailed(String),

    #[error("git conflict while syncing: {0}")]
    GitConflict(String),

    #[error("could not build directive: {0}")]
    DirectiveBuildFailed(String),

    #[error("could not spawn worker process: {0}")]
    ProcessSpawnFailed(String),

    #[error("fatal worker output: {0}")]
    FatalWorkerOutput(String),

    #[error("no output for {idle_secs}s")]
    IdleTimeout { idle_secs: u64 },

    #[error("exceeded max runtime of {limit_secs}s")]
    RuntimeTimeout { limit_secs: u64 },

    #[error("gave up after {max} retries with uncommitted changes")]
    RetryLimitExceeded { max: u32 },

    #[error("all identities are exhausted")]
    NoAvailableIdentity,

    #[error("could not inspect workspace after run: {0}")]
    ReconcileFailed(String),

    #[error("stopped by operator")]
    Stopped,
}

impl DispatchError {
    /// Stable short code shown in the activity log.
    pub const fn reason_code(&self) -> &'static str {
        match self {
            Self::ClaimConflict { .. } => "CLAIM_CONFLICT",
            Self::WorkspaceCreationFailed(_) => "WORKSPACE_FAILED",
            Self::GitConflict(_) => "GIT_CONFLICT",
            Self::DirectiveBuildFailed(_) => "DIRECTIVE_FAILED",
            Self::ProcessSpawnFailed(_) => "SPAWN_FAILED",
            Self::FatalWorkerOutput(_) => "FATAL_OUTPUT",
            Self::IdleTimeout { .. } => "IDLE_TIMEOUT",
            Self::RuntimeTimeout { .. } => "RUNTIME_TIMEOUT",
            Self::RetryLimitExceeded { .. } => "RETRY_LIMIT",
            Self::NoAvailableIdentity => "NO_IDENTITY",
            Self::ReconcileFailed(_) => "RECONCILE_FAILED",
            Self::Stopped => "STOPPED",
        }
    }

    /// Whether the failed task should be kept away from this worker for a while.
    pub const fn applies_cooldown(&self) -> bool {
        !matches!(
            self,
            Self::Stopped | Self::NoAvailableIdentity | Self::ClaimConflict { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_are_distinct_for_conflict_and_timeouts() {
        assert_eq!(
            DispatchError::GitConflict("diverged".into()).reason_code(),
            "GIT_CONFLICT"
        );
        assert_eq!(
            DispatchError::IdleTimeout { idle_secs: 5 }.reason_code(),
            "IDLE_TIMEOUT"
        );
        assert_eq!(
            DispatchError::RuntimeTimeout { limit_secs: 5 }.reason_code(),
            "RUNTIME_TIMEOUT"
        );
    }

    #[test]
    fn operator_stop_has_no_cooldown() {
        assert!(!DispatchError::Stopped.applies_cooldown());
        assert!(DispatchError::FatalWorkerOutput("x".into()).applies_cooldown());
    }

    #[test]
    fn exit_codes() {
        assert_eq!(ExitError::Config("x".into()).exit_code(), ExitCode::from(2));
        assert_eq!(
            ExitError::Timeout {
                tool: "git".into(),
                timeout_secs: 1
            }
            .exit_code(),
            ExitCode::from(5)
        );
    }
}
