//! Per-worker isolated working trees.
//!
//! Each worker slot gets its own `git worktree` sharing the source repo's
//! object store. Worktrees cannot share a branch, so each task runs on a
//! disposable `isolated/<task>` branch cut from the target branch tip.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Context;
use regex::Regex;

use crate::subprocess::{RunOutput, Tool};

/// Leftover changes touching at most this many files may be minor.
pub const MINOR_MAX_FILES: usize = 1;
/// Leftover changes must stay strictly below this many lines to be minor.
pub const MINOR_MAX_LINES: usize = 20;

/// Prefix of per-task branches.
pub const TASK_BRANCH_PREFIX: &str = "isolated/";

/// `true` when a leftover change set is small enough to discard.
pub const fn is_minor(files: usize, lines: usize) -> bool {
    files <= MINOR_MAX_FILES && lines < MINOR_MAX_LINES
}

/// Totals from the summary line of `git diff --stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStat {
    pub files: usize,
    pub insertions: usize,
    pub deletions: usize,
}

impl DiffStat {
    pub const fn total_lines(&self) -> usize {
        self.insertions + self.deletions
    }
}

fn re_files() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+) files? changed").expect("valid regex"))
}

fn re_insertions() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+) insertions?\(\+\)").expect("valid regex"))
}

fn re_deletions() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+) deletions?\(-\)").expect("valid regex"))
}

/// Parse `git diff --stat` output. Only the summary line matters; anything
/// unparseable counts as zero.
pub fn parse_diff_stat(output: &str) -> DiffStat {
    let Some(summary) = output.lines().rev().find(|l| re_files().is_match(l)) else {
        return DiffStat::default();
    };
    let capture = |re: &Regex| {
        re.captures(summary)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0)
    };
    DiffStat {
        files: capture(re_files()),
        insertions: capture(re_insertions()),
        deletions: capture(re_deletions()),
    }
}

/// Paths from `git status --porcelain -z`: every changed path, and the
/// untracked subset. Rename and copy entries carry their source path as an
/// extra record, which is skipped.
pub fn parse_porcelain_z(output: &str) -> (Vec<String>, Vec<String>) {
    let mut changed = Vec::new();
    let mut untracked = Vec::new();
    let mut records = output.split('\0').filter(|r| !r.is_empty());
    while let Some(record) = records.next() {
        let Some((code, path)) = record.split_at_checked(3) else {
            continue;
        };
        if code.starts_with("??") {
            untracked.push(path.to_string());
        } else if code.starts_with(['R', 'C']) {
            records.next();
        }
        changed.push(path.to_string());
    }
    (changed, untracked)
}

/// Line count as git's diff stat would report for a new file.
pub fn count_lines(bytes: &[u8]) -> usize {
    let newlines = bytes.iter().filter(|b| **b == b'\n').count();
    if bytes.last().is_some_and(|b| *b != b'\n') {
        newlines + 1
    } else {
        newlines
    }
}

/// Outcome of a fast-forward-only pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced,
    /// The pull failed for a benign reason (no remote yet, offline, ...).
    NothingToSync,
    /// History diverged or conflicted; the task must fail, not retry.
    Blocked(String),
}

/// What a finished run left behind in its working tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    Clean,
    /// Small leftovers, already discarded.
    Minor { files: usize, lines: usize },
    /// Substantial leftovers, kept in place for a retry.
    Significant { files: usize, lines: usize },
}

impl Reconciliation {
    pub const fn classify(files: usize, lines: usize) -> Self {
        if files == 0 && lines == 0 {
            Self::Clean
        } else if is_minor(files, lines) {
            Self::Minor { files, lines }
        } else {
            Self::Significant { files, lines }
        }
    }
}

/// Whether pull output describes divergence rather than a transient failure.
pub fn is_blocking_pull_failure(output: &str) -> bool {
    let lower = output.to_lowercase();
    [
        "not possible to fast-forward",
        "diverging branches",
        "have diverged",
        "non-fast-forward",
        "conflict",
        "would be overwritten by merge",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

/// Branch name for a task, with anything git would reject replaced by `-`.
pub fn task_branch(task_id: &str) -> String {
    let safe: String = task_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("{TASK_BRANCH_PREFIX}{}", safe.trim_matches('.'))
}

/// Working-tree lifecycle used by the scheduler.
pub trait Workspaces {
    /// Path of the worker's tree, creating it if needed.
    fn ensure(&self, worker_name: &str) -> anyhow::Result<PathBuf>;
    /// Put the tree on a fresh branch for `task_id`.
    fn prepare_branch(&self, path: &Path, task_id: &str) -> anyhow::Result<()>;
    fn sync_latest(&self, path: &Path) -> SyncOutcome;
    /// Classify leftover changes; minor ones are discarded.
    fn reconcile(&self, path: &Path) -> anyhow::Result<Reconciliation>;
    fn remove(&self, path: &Path) -> anyhow::Result<()>;
}

/// [`Workspaces`] backed by `git worktree`.
#[derive(Debug, Clone)]
pub struct GitWorkspaces {
    source_repo: PathBuf,
    workspace_dir: PathBuf,
    branch: String,
    remote: String,
    tracker_program: String,
    tracker_cache_dir: String,
    tracker_import_args: Vec<String>,
    timeout: Duration,
}

impl GitWorkspaces {
    pub fn new(source_repo: PathBuf, workspace_dir: PathBuf, branch: String) -> Self {
        Self {
            source_repo,
            workspace_dir,
            branch,
            remote: "origin".to_string(),
            tracker_program: "bd".to_string(),
            tracker_cache_dir: ".beads".to_string(),
            tracker_import_args: vec!["sync".to_string(), "--import-only".to_string()],
            timeout: Duration::from_secs(120),
        }
    }

    #[must_use]
    pub fn with_tracker(mut self, program: &str, cache_dir: &str, import_args: &[String]) -> Self {
        self.tracker_program = program.to_string();
        self.tracker_cache_dir = cache_dir.to_string();
        self.tracker_import_args = import_args.to_vec();
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn path_for(&self, worker_name: &str) -> PathBuf {
        self.workspace_dir.join(worker_name)
    }

    fn git(&self, dir: &Path, args: &[&str]) -> anyhow::Result<RunOutput> {
        Tool::new("git")
            .args(args)
            .current_dir(dir)
            .timeout(self.timeout)
            .run()
    }

    fn git_ok(&self, dir: &Path, args: &[&str]) -> anyhow::Result<RunOutput> {
        Tool::new("git")
            .args(args)
            .current_dir(dir)
            .timeout(self.timeout)
            .run_ok()
    }

    fn current_branch(&self, path: &Path) -> Option<String> {
        self.git(path, &["rev-parse", "--abbrev-ref", "HEAD"])
            .ok()
            .filter(RunOutput::success)
            .map(|o| o.stdout.trim().to_string())
    }

    fn discard_changes(&self, path: &Path) -> anyhow::Result<()> {
        self.git_ok(path, &["reset", "--hard", "HEAD"])
            .context("discarding tracked changes")?;
        self.git_ok(path, &["clean", "-fd"])
            .context("removing untracked files")?;
        Ok(())
    }

    fn configure_hooks(&self, path: &Path) {
        let hooks = self.source_repo.join(".githooks");
        if !hooks.is_dir() {
            return;
        }
        let hooks = hooks.to_string_lossy();
        if let Err(e) = self.git_ok(path, &["config", "core.hooksPath", &hooks]) {
            tracing::warn!(path = %path.display(), error = %format!("{e:#}"), "could not set hooks path");
        }
    }

    fn reimport_tracker_cache(&self, path: &Path) {
        if !path.join(&self.tracker_cache_dir).exists() {
            return;
        }
        let result = Tool::new(&self.tracker_program)
            .args(&self.tracker_import_args)
            .current_dir(path)
            .timeout(self.timeout)
            .run_ok();
        if let Err(e) = result {
            tracing::debug!(path = %path.display(), error = %format!("{e:#}"), "tracker cache import failed");
        }
    }
}

impl Workspaces for GitWorkspaces {
    fn ensure(&self, worker_name: &str) -> anyhow::Result<PathBuf> {
        let path = self.path_for(worker_name);
        if path.exists() {
            return Ok(path);
        }
        std::fs::create_dir_all(&self.workspace_dir)
            .with_context(|| format!("creating {}", self.workspace_dir.display()))?;

        let target = path.to_string_lossy();
        self.git_ok(
            &self.source_repo,
            &["worktree", "add", "--detach", &target, &self.branch],
        )
        .with_context(|| format!("adding worktree {}", path.display()))?;

        self.configure_hooks(&path);
        self.reimport_tracker_cache(&path);
        tracing::info!(worker = worker_name, path = %path.display(), "created workspace");
        Ok(path)
    }

    fn prepare_branch(&self, path: &Path, task_id: &str) -> anyhow::Result<()> {
        if self.current_branch(path).as_deref() == Some(self.branch.as_str()) {
            return Ok(());
        }

        self.discard_changes(path)?;

        let remote_ref = format!("{}/{}", self.remote, self.branch);
        let tip = match self.git(path, &["fetch", &self.remote, &self.branch]) {
            Ok(out) if out.success() => remote_ref,
            Ok(out) => {
                tracing::debug!(stderr = out.stderr.trim(), "fetch failed, using local branch");
                self.branch.clone()
            }
            Err(e) => {
                tracing::debug!(error = %format!("{e:#}"), "fetch failed, using local branch");
                self.branch.clone()
            }
        };

        let branch = task_branch(task_id);
        // Stale branch from an earlier attempt; absence is fine.
        let _ = self.git(path, &["branch", "-D", &branch]);
        self.git_ok(path, &["checkout", "-B", &branch, &tip])
            .with_context(|| format!("creating branch {branch} from {tip}"))?;
        Ok(())
    }

    fn sync_latest(&self, path: &Path) -> SyncOutcome {
        match self.git(path, &["pull", "--ff-only", &self.remote, &self.branch]) {
            Ok(out) if out.success() => SyncOutcome::Synced,
            Ok(out) => {
                let detail = format!("{}\n{}", out.stdout.trim(), out.stderr.trim());
                if is_blocking_pull_failure(&detail) {
                    SyncOutcome::Blocked(detail.trim().to_string())
                } else {
                    tracing::debug!(path = %path.display(), detail = detail.trim(), "nothing to pull");
                    SyncOutcome::NothingToSync
                }
            }
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %format!("{e:#}"), "pull failed");
                SyncOutcome::NothingToSync
            }
        }
    }

    fn reconcile(&self, path: &Path) -> anyhow::Result<Reconciliation> {
        let status = self
            .git_ok(path, &["status", "--porcelain", "-z", "--untracked-files=all"])
            .context("reading workspace status")?;
        let (changed, untracked) = parse_porcelain_z(&status.stdout);
        if changed.is_empty() {
            return Ok(Reconciliation::Clean);
        }

        // diff --stat only sees tracked files; new files count in full, and
        // an unreadable one never counts as minor.
        let stat = self
            .git_ok(path, &["diff", "--stat", "HEAD"])
            .map(|o| parse_diff_stat(&o.stdout))
            .unwrap_or_default();
        let untracked_lines: usize = untracked
            .iter()
            .map(|file| std::fs::read(path.join(file)).map_or(MINOR_MAX_LINES, |b| count_lines(&b)))
            .sum();
        let files = changed.len().max(stat.files);
        let outcome = Reconciliation::classify(files, stat.total_lines() + untracked_lines);

        if let Reconciliation::Minor { files, lines } = outcome {
            self.discard_changes(path)?;
            tracing::info!(path = %path.display(), files, lines, "discarded minor leftover changes");
        }
        Ok(outcome)
    }

    fn remove(&self, path: &Path) -> anyhow::Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let target = path.to_string_lossy();
        self.git_ok(&self.source_repo, &["worktree", "remove", "--force", &target])
            .with_context(|| format!("removing worktree {}", path.display()))?;
        Ok(())
    }
}
