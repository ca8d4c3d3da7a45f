//! The dispatch loop.
//!
//! A single-threaded [`Scheduler`] owns every worker slot. Each tick it
//! drains worker output and exits from the bounded queues, kills stale runs,
//! and hands ready tasks to idle workers:
//!
//! `Idle -> Claiming -> Preparing -> Running -> {Completing | Failing} -> Idle`
//!
//! Any failure returns the worker to idle, releases its claim and (for most
//! failures) keeps the task away from that worker for [`FAILURE_COOLDOWN`].

mod activity;
mod process;
mod supervisor;
mod worker;


use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::time::{Duration, Instant};

pub use activity::{ACTIVITY_CAP, ActivityEntry, ActivityLog};
pub use process::{
    EVENT_QUEUE_CAPACITY, EXIT_QUEUE_CAPACITY, LaunchRequest, ProcessHandle, ProcessLauncher,
    WorkerExit, WorkerLauncher, WorkerMessage, WorkerSink,
};
pub use supervisor::{FAILURE_COOLDOWN, StalenessLimits};
pub use worker::{WorkerPhase, WorkerSnapshot, WorkerState, worker_name};

use crate::claims::ClaimRegistry;
use crate::config::Config;
use crate::error::DispatchError;
use crate::events::{FatalDetector, FatalKind};
use crate::identity::{IdentityPool, QuotaChecker};
use crate::template::{DirectiveContext, TaskInfo, render_directive};
use crate::tracker::{Task, TaskStatus, TaskTracker, assigned_in_progress};
use crate::workspace::{Reconciliation, SyncOutcome, Workspaces, task_branch};

/// Scheduler knobs, usually taken from the project config.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub project: String,
    pub tracker_program: String,
    pub idle_timeout: Duration,
    pub max_runtime: Duration,
    pub max_retries: u32,
    /// Quit after the first terminal outcome.
    pub exit_once: bool,
    /// `None` disables periodic quota checks.
    pub quota_refresh: Option<Duration>,
    pub context_file: Option<PathBuf>,
    pub fatal_patterns: Vec<String>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            project: String::new(),
            tracker_program: "bd".to_string(),
            idle_timeout: Duration::from_secs(600),
            max_runtime: Duration::from_secs(3600),
            max_retries: crate::claims::DEFAULT_MAX_RETRIES,
            exit_once: false,
            quota_refresh: None,
            context_file: None,
            fatal_patterns: Vec::new(),
        }
    }
}

impl SchedulerSettings {
    pub fn from_config(config: &Config, root: &Path) -> Self {
        let refresh = config.scheduler.quota_refresh_secs;
        Self {
            project: config.project.name.clone(),
            tracker_program: config.tracker.program.clone(),
            idle_timeout: Duration::from_secs(config.scheduler.idle_timeout_secs),
            max_runtime: Duration::from_secs(config.scheduler.max_runtime_secs),
            max_retries: config.scheduler.max_retries,
            exit_once: config.scheduler.exit_once,
            quota_refresh: (refresh > 0).then(|| Duration::from_secs(refresh)),
            context_file: config.context_file(root),
            fatal_patterns: config.worker.fatal_patterns.clone(),
        }
    }

    const fn limits(&self) -> StalenessLimits {
        StalenessLimits {
            idle_timeout: self.idle_timeout,
            max_runtime: self.max_runtime,
        }
    }
}

pub struct Scheduler {
    settings: SchedulerSettings,
    workers: Vec<WorkerState>,
    claims: Arc<ClaimRegistry>,
    identities: IdentityPool,
    tracker: Box<dyn TaskTracker>,
    workspaces: Box<dyn Workspaces>,
    launcher: Box<dyn WorkerLauncher>,
    quota_checker: Option<Box<dyn QuotaChecker>>,
    last_quota_refresh: Option<Instant>,
    detector: FatalDetector,
    event_tx: SyncSender<WorkerMessage>,
    event_rx: Receiver<WorkerMessage>,
    exit_tx: SyncSender<WorkerExit>,
    exit_rx: Receiver<WorkerExit>,
    next_run_id: u64,
    activity: ActivityLog,
    quit: bool,
}

impl Scheduler {
    pub fn new(
        settings: SchedulerSettings,
        workers: usize,
        tracker: Box<dyn TaskTracker>,
        workspaces: Box<dyn Workspaces>,
        launcher: Box<dyn WorkerLauncher>,
        identities: IdentityPool,
    ) -> Self {
        let (event_tx, event_rx) = sync_channel(EVENT_QUEUE_CAPACITY);
        let (exit_tx, exit_rx) = sync_channel(EXIT_QUEUE_CAPACITY);
        let detector = FatalDetector::new(&settings.fatal_patterns);
        Self {
            settings,
            workers: (1..=workers).map(WorkerState::new).collect(),
            claims: Arc::new(ClaimRegistry::new()),
            identities,
            tracker,
            workspaces,
            launcher,
            quota_checker: None,
            last_quota_refresh: None,
            detector,
            event_tx,
            event_rx,
            exit_tx,
            exit_rx,
            next_run_id: 0,
            activity: ActivityLog::default(),
            quit: false,
        }
    }

    #[must_use]
    pub fn with_claims(mut self, claims: Arc<ClaimRegistry>) -> Self {
        self.claims = claims;
        self
    }

    #[must_use]
    pub fn with_quota_checker(mut self, checker: Box<dyn QuotaChecker>) -> Self {
        self.quota_checker = Some(checker);
        self
    }

    pub fn claims(&self) -> &Arc<ClaimRegistry> {
        &self.claims
    }

    pub const fn identities(&self) -> &IdentityPool {
        &self.identities
    }

    pub fn workers(&self) -> &[WorkerState] {
        &self.workers
    }

    pub fn worker(&self, id: usize) -> Option<&WorkerState> {
        self.workers.iter().find(|w| w.id == id)
    }

    pub const fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    pub const fn activity_mut(&mut self) -> &mut ActivityLog {
        &mut self.activity
    }

    pub const fn should_quit(&self) -> bool {
        self.quit
    }

    fn index_of(&self, id: usize) -> Option<usize> {
        self.workers.iter().position(|w| w.id == id)
    }

    const fn next_run_id(&mut self) -> u64 {
        self.next_run_id += 1;
        self.next_run_id
    }

    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    /// One scheduling pass, with `now` standing in for the clock.
    pub fn tick_at(&mut self, now: Instant) {
        self.drain_events(now);
        self.drain_exits(now);
        self.supervise(now);
        self.maybe_refresh_quota(now);
        if self.quit {
            return;
        }
        for idx in 0..self.workers.len() {
            if self.quit {
                break;
            }
            if self.workers[idx].is_idle() {
                self.try_dispatch(idx, now);
            }
        }
    }

    fn drain_events(&mut self, now: Instant) {
        while let Ok(message) = self.event_rx.try_recv() {
            let Some(idx) = self.index_of(message.worker) else {
                continue;
            };
            let worker = &mut self.workers[idx];
            if !worker.is_running() || worker.run_id != message.run_id {
                continue;
            }
            worker.last_event_at = Some(now);
            tracing::debug!(
                worker = %worker.name,
                kind = message.event.kind.as_str(),
                summary = %message.event.summary(),
                "worker event"
            );
            let fatal = self.detector.detect(&message.event);
            worker.history.push(message.event);

            if let Some(fatal) = fatal {
                if fatal.kind == FatalKind::RateLimit
                    && let Some(identity) = &worker.identity
                {
                    let name = identity.name.clone();
                    self.identities.mark_exhausted(&name);
                    self.activity
                        .push(None, format!("identity {name} marked exhausted"));
                }
                let detail = format!("{} (matched {:?})", fatal.reason, fatal.pattern);
                self.fail_task(idx, &DispatchError::FatalWorkerOutput(detail), now);
            }
        }
    }

    fn drain_exits(&mut self, now: Instant) {
        while let Ok(exit) = self.exit_rx.try_recv() {
            let Some(idx) = self.index_of(exit.worker) else {
                continue;
            };
            let worker = &self.workers[idx];
            if !worker.is_running() || worker.run_id != exit.run_id {
                tracing::debug!(worker = exit.worker, run_id = exit.run_id, "ignoring stale exit");
                continue;
            }
            self.handle_exit(idx, exit.code, now);
        }
    }

    fn supervise(&mut self, now: Instant) {
        let limits = self.settings.limits();
        for idx in 0..self.workers.len() {
            if let Some(err) = supervisor::check(&self.workers[idx], now, limits) {
                self.fail_task(idx, &err, now);
            }
        }
    }

    fn maybe_refresh_quota(&mut self, now: Instant) {
        let Some(interval) = self.settings.quota_refresh else {
            return;
        };
        if !self.identities.pooling() || self.identities.is_empty() {
            return;
        }
        let Some(checker) = self.quota_checker.as_deref() else {
            return;
        };
        if self
            .last_quota_refresh
            .is_some_and(|last| now.saturating_duration_since(last) < interval)
        {
            return;
        }
        self.last_quota_refresh = Some(now);

        let exhausted_before: Vec<String> = self
            .identities
            .identities()
            .filter(|i| self.identities.is_exhausted(&i.name))
            .map(|i| i.name.clone())
            .collect();
        let report = self.identities.refresh_quota(checker);
        for (name, quota) in &report {
            tracing::debug!(identity = %name, percent = ?quota.percent, "quota");
        }
        for name in exhausted_before {
            if !self.identities.is_exhausted(&name) {
                self.activity
                    .push(None, format!("identity {name} has quota again"));
            }
        }
    }

    /// Candidate tasks for a worker: its own in-progress tasks first, then
    /// ready tasks in tracker order.
    fn candidates(&mut self, idx: usize, now: Instant) -> Vec<Task> {
        let name = self.workers[idx].name.clone();
        let mut candidates = Vec::new();

        match self.tracker.list() {
            Ok(tasks) => candidates.extend(assigned_in_progress(&tasks, &name).cloned()),
            Err(e) => tracing::warn!(worker = %name, error = %format!("{e:#}"), "tracker list failed"),
        }
        match self.tracker.ready() {
            Ok(tasks) => candidates.extend(tasks),
            Err(e) => tracing::warn!(worker = %name, error = %format!("{e:#}"), "tracker ready failed"),
        }

        let mut seen = HashSet::new();
        candidates.retain(|t| seen.insert(t.id.clone()));
        let worker = &mut self.workers[idx];
        candidates.retain(|t| {
            !self.claims.is_claimed(&t.id)
                && !self.claims.is_completed(&t.id)
                && !worker.in_cooldown(&t.id, now, FAILURE_COOLDOWN)
        });
        candidates
    }

    /// Claim and start the first available task. Returns whether a run started.
    pub fn try_dispatch(&mut self, idx: usize, now: Instant) -> bool {
        if !self.workers[idx].is_idle() {
            return false;
        }
        if !self.identities.has_available() {
            tracing::debug!(
                worker = %self.workers[idx].name,
                reason = DispatchError::NoAvailableIdentity.reason_code(),
                "not dispatching"
            );
            return false;
        }

        self.workers[idx].phase = WorkerPhase::Claiming;
        let name = self.workers[idx].name.clone();
        for task in self.candidates(idx, now) {
            if self.claims.claim(&task.id, &name) {
                return self.start_task(idx, task, now);
            }
            let conflict = DispatchError::ClaimConflict { task: task.id };
            tracing::debug!(worker = %name, reason = conflict.reason_code(), "{conflict}");
        }
        self.workers[idx].phase = WorkerPhase::Idle;
        false
    }

    fn start_task(&mut self, idx: usize, task: Task, now: Instant) -> bool {
        let name = self.workers[idx].name.clone();
        self.workers[idx].task = Some(task.clone());

        match self.identities.next_available() {
            Ok(identity) => self.workers[idx].identity = identity,
            Err(e) => {
                self.fail_task(idx, &e, now);
                return false;
            }
        }

        self.workers[idx].phase = WorkerPhase::Preparing;
        let workspace = match self.prepare_workspace(&name, &task.id) {
            Ok(path) => path,
            Err(e) => {
                self.fail_task(idx, &e, now);
                return false;
            }
        };
        self.workers[idx].workspace = Some(workspace);

        if let Err(e) = self.tracker.update(&task.id, TaskStatus::InProgress, &name) {
            tracing::warn!(worker = %name, task = %task.id, error = %format!("{e:#}"), "could not mark task in progress");
        }

        self.launch(idx, None, now)
    }

    fn prepare_workspace(&self, worker: &str, task_id: &str) -> Result<PathBuf, DispatchError> {
        let path = self
            .workspaces
            .ensure(worker)
            .map_err(|e| DispatchError::WorkspaceCreationFailed(format!("{e:#}")))?;
        self.workspaces
            .prepare_branch(&path, task_id)
            .map_err(|e| DispatchError::WorkspaceCreationFailed(format!("{e:#}")))?;
        match self.workspaces.sync_latest(&path) {
            SyncOutcome::Synced | SyncOutcome::NothingToSync => Ok(path),
            SyncOutcome::Blocked(detail) => Err(DispatchError::GitConflict(detail)),
        }
    }

    fn build_directive(&self, task: &Task, worker: &str, attempt: Option<u32>) -> Result<String, DispatchError> {
        let detail = self
            .tracker
            .show(&task.id)
            .map_err(|e| DispatchError::DirectiveBuildFailed(format!("{e:#}")))?;
        let context = match &self.settings.context_file {
            Some(path) if path.exists() => Some(std::fs::read_to_string(path).map_err(|e| {
                DispatchError::DirectiveBuildFailed(format!("reading {}: {e}", path.display()))
            })?),
            _ => None,
        };
        let ctx = DirectiveContext {
            project: self.settings.project.clone(),
            worker: worker.to_string(),
            branch: task_branch(&task.id),
            tracker: self.settings.tracker_program.clone(),
            task: TaskInfo {
                id: task.id.clone(),
                title: task.title.clone(),
                detail,
            },
            context,
            attempt,
            max_attempts: self.settings.max_retries + 1,
        };
        render_directive(&ctx).map_err(|e| DispatchError::DirectiveBuildFailed(format!("{e:#}")))
    }

    /// Start a run for the worker's current task in its current workspace.
    fn launch(&mut self, idx: usize, attempt: Option<u32>, now: Instant) -> bool {
        let (Some(task), Some(workspace)) = (
            self.workers[idx].task.clone(),
            self.workers[idx].workspace.clone(),
        ) else {
            return false;
        };
        let name = self.workers[idx].name.clone();

        let directive = match self.build_directive(&task, &name, attempt) {
            Ok(d) => d,
            Err(e) => {
                self.fail_task(idx, &e, now);
                return false;
            }
        };

        let run_id = self.next_run_id();
        let request = LaunchRequest {
            worker: self.workers[idx].id,
            worker_name: name.clone(),
            run_id,
            task_id: task.id.clone(),
            workspace,
            identity: self.workers[idx].identity.clone(),
            directive,
        };
        let sink = WorkerSink::new(request.worker, run_id, self.event_tx.clone(), self.exit_tx.clone());
        match self.launcher.launch(&request, sink) {
            Ok(handle) => {
                let worker = &mut self.workers[idx];
                worker.process = Some(handle);
                worker.run_id = run_id;
                worker.started_at = Some(now);
                worker.last_event_at = Some(now);
                worker.phase = WorkerPhase::Running;

                let who = request
                    .identity
                    .as_ref()
                    .map(|i| format!(" as {}", i.name))
                    .unwrap_or_default();
                let message = match attempt {
                    Some(n) => format!("retrying {} (attempt {n}){who}", task.id),
                    None => format!("started {}{who}", task.id),
                };
                self.activity.push(Some(name.as_str()), message);
                tracing::info!(worker = %name, task = %task.id, run_id, "worker launched");
                true
            }
            Err(e) => {
                self.fail_task(idx, &DispatchError::ProcessSpawnFailed(format!("{e:#}")), now);
                false
            }
        }
    }

    fn handle_exit(&mut self, idx: usize, code: Option<i32>, now: Instant) {
        let worker = &mut self.workers[idx];
        worker.process = None;
        worker.phase = WorkerPhase::Completing;
        let name = worker.name.clone();
        let (Some(task), Some(workspace)) = (worker.task.clone(), worker.workspace.clone()) else {
            worker.clear_run();
            return;
        };
        tracing::info!(worker = %name, task = %task.id, code = ?code, "worker exited");

        let outcome = match self.workspaces.reconcile(&workspace) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fail_task(idx, &DispatchError::ReconcileFailed(format!("{e:#}")), now);
                return;
            }
        };

        match outcome {
            Reconciliation::Clean | Reconciliation::Minor { .. } => {
                self.claims.clear_retry(&task.id);
                self.claims.mark_completed(&task.id);
                self.claims.release(&task.id);
                let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                self.activity
                    .push(Some(name.as_str()), format!("completed {} (exit {code})", task.id));
                self.workers[idx].clear_run();
                if self.settings.exit_once {
                    self.quit = true;
                    return;
                }
                self.try_dispatch(idx, now);
            }
            Reconciliation::Significant { files, lines } => {
                let check = self.claims.increment_retry(&task.id, self.settings.max_retries);
                if check.exceeded {
                    let err = DispatchError::RetryLimitExceeded {
                        max: self.settings.max_retries,
                    };
                    self.fail_task(idx, &err, now);
                    return;
                }
                self.activity.push(
                    Some(name.as_str()),
                    format!(
                        "{} left {files} file(s), {lines} line(s) uncommitted; retry {}/{}",
                        task.id, check.count, self.settings.max_retries
                    ),
                );
                self.workers[idx].phase = WorkerPhase::Preparing;
                self.launch(idx, Some(check.count + 1), now);
            }
        }
    }

    /// Kill any run, release the claim, record the failure and go idle.
    fn fail_task(&mut self, idx: usize, err: &DispatchError, now: Instant) {
        let worker = &mut self.workers[idx];
        worker.phase = WorkerPhase::Failing;
        worker.terminate();
        let name = worker.name.clone();

        if let Some(task_id) = worker.task_id().map(str::to_string) {
            if err.applies_cooldown() {
                worker.failed.insert(task_id.clone(), now);
            }
            self.claims.release(&task_id);
            self.claims.clear_retry(&task_id);
            if let Err(e) = self.tracker.update(&task_id, TaskStatus::Ready, "") {
                tracing::debug!(task = %task_id, error = %format!("{e:#}"), "could not reopen task");
            }
            self.activity
                .push(Some(name.as_str()), format!("failed {task_id}: {}", err.reason_code()));
            tracing::warn!(worker = %name, task = %task_id, reason = err.reason_code(), error = %err, "task failed");
        } else {
            tracing::warn!(worker = %name, reason = err.reason_code(), error = %err, "dispatch failed");
        }

        self.workers[idx].clear_run();
        if self.settings.exit_once && *err != DispatchError::Stopped {
            self.quit = true;
        }
    }

    /// Kill the worker's run (if any) and keep it from taking new tasks.
    pub fn stop_worker(&mut self, id: usize) -> bool {
        let Some(idx) = self.index_of(id) else {
            return false;
        };
        if self.workers[idx].task.is_some() {
            self.fail_task(idx, &DispatchError::Stopped, Instant::now());
        }
        self.workers[idx].enabled = false;
        self.activity.push(Some(self.workers[idx].name.as_str()), "stopped");
        true
    }

    pub fn resume_worker(&mut self, id: usize) -> bool {
        let Some(idx) = self.index_of(id) else {
            return false;
        };
        self.workers[idx].enabled = true;
        self.activity.push(Some(self.workers[idx].name.as_str()), "resumed");
        true
    }

    /// Add a slot. Returns its id.
    pub fn add_worker(&mut self) -> usize {
        let id = self.workers.iter().map(|w| w.id).max().unwrap_or(0) + 1;
        self.workers.push(WorkerState::new(id));
        self.activity.push(Some(worker_name(id).as_str()), "added");
        id
    }

    /// Stop the worker, remove its working tree and drop the slot.
    pub fn remove_worker(&mut self, id: usize) -> bool {
        if !self.stop_worker(id) {
            return false;
        }
        let Some(idx) = self.index_of(id) else {
            return false;
        };
        let worker = self.workers.remove(idx);
        if let Some(path) = &worker.workspace
            && let Err(e) = self.workspaces.remove(path)
        {
            tracing::warn!(worker = %worker.name, error = %format!("{e:#}"), "could not remove workspace");
        }
        self.activity.push(Some(worker.name.as_str()), "removed");
        true
    }

    /// Kill every run and release every claim.
    pub fn shutdown(&mut self) {
        let exit_once = self.settings.exit_once;
        self.settings.exit_once = false;
        let now = Instant::now();
        for idx in 0..self.workers.len() {
            if self.workers[idx].task.is_some() {
                self.fail_task(idx, &DispatchError::Stopped, now);
            }
        }
        self.settings.exit_once = exit_once;
        self.quit = true;
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let now = Instant::now();
        self.workers
            .iter()
            .map(|w| WorkerSnapshot {
                id: w.id,
                name: w.name.clone(),
                phase: w.phase,
                enabled: w.enabled,
                running: w.is_running(),
                task: w.task_id().map(str::to_string),
                identity: w.identity.as_ref().map(|i| i.name.clone()),
                running_secs: w.started_at.map(|t| now.saturating_duration_since(t).as_secs()),
                idle_secs: w.last_event_at.map(|t| now.saturating_duration_since(t).as_secs()),
                retries: w.task_id().map_or(0, |t| self.claims.retry_count(t)),
                events: w.history.len(),
            })
            .collect()
    }
}
