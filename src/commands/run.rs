use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Args;

use crate::config::Config;
use crate::identity::{CommandQuotaChecker, IdentityPool};
use crate::scheduler::{ProcessLauncher, Scheduler, SchedulerSettings};
use crate::tracker::{CliTracker, TaskTracker};
use crate::workspace::GitWorkspaces;

/// How often the worker table is written to the debug log.
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Project root directory
    #[arg(long)]
    pub project_root: Option<PathBuf>,
    /// Number of worker slots (overrides the config)
    #[arg(long)]
    pub workers: Option<usize>,
    /// Quit after the first task completes or fails
    #[arg(long)]
    pub once: bool,
}

impl RunArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let root = super::project_root(self.project_root.as_deref())?;
        let mut config = super::load_config(&root)?;
        if let Some(workers) = self.workers {
            config.project.workers = workers;
        }
        if self.once {
            config.scheduler.exit_once = true;
        }

        let _span = tracing::info_span!("run", project = %config.project.name).entered();
        let mut scheduler = build_scheduler(&config, &root)?;

        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            eprintln!("Received interrupt signal, stopping workers...");
            flag.store(true, Ordering::SeqCst);
        })
        .context("installing Ctrl-C handler")?;

        eprintln!(
            "foreman: {} worker(s) on {} ({} identit{})",
            config.project.workers,
            config.project.name,
            scheduler.identities().len(),
            if scheduler.identities().len() == 1 { "y" } else { "ies" },
        );

        run_loop(&mut scheduler, &stop, config.tick_interval());

        scheduler.shutdown();
        print_activity(&mut scheduler);
        eprintln!("foreman: stopped");
        Ok(())
    }
}

fn build_scheduler(config: &Config, root: &Path) -> anyhow::Result<Scheduler> {
    let timeout = config.command_timeout();

    let tracker = CliTracker::new(&config.tracker.program, root.to_path_buf(), timeout)
        .with_import_args(config.tracker.import_args.clone());
    if let Err(e) = tracker.import() {
        tracing::debug!(error = %format!("{e:#}"), "tracker import failed");
    }

    let workspaces = GitWorkspaces::new(
        config.source_repo(root),
        config.workspace_dir(root),
        config.project.branch.clone(),
    )
    .with_tracker(
        &config.tracker.program,
        &config.tracker.cache_dir,
        &config.tracker.import_args,
    );

    let identities = match config.identity_dir(root) {
        Some(dir) => IdentityPool::load(&dir, config.identities.pooling)?,
        None => IdentityPool::new(Vec::new(), config.identities.pooling),
    }
    .with_categories(config.identities.categories.clone());
    for identity in identities.identities() {
        tracing::debug!(identity = %identity.name, home = %identity.home.display(), "loaded identity");
    }

    let launcher = ProcessLauncher::new(config.worker.command.clone(), config.env.clone());

    let mut scheduler = Scheduler::new(
        SchedulerSettings::from_config(config, root),
        config.project.workers,
        Box::new(tracker),
        Box::new(workspaces),
        Box::new(launcher),
        identities,
    );
    if !config.identities.quota_command.is_empty() {
        scheduler = scheduler.with_quota_checker(Box::new(CommandQuotaChecker::new(
            config.identities.quota_command.clone(),
            timeout,
        )));
    }
    Ok(scheduler)
}

fn run_loop(scheduler: &mut Scheduler, stop: &AtomicBool, interval: Duration) {
    let mut last_snapshot = Instant::now();
    while !stop.load(Ordering::SeqCst) {
        scheduler.tick();
        print_activity(scheduler);
        if scheduler.should_quit() {
            break;
        }
        if last_snapshot.elapsed() >= SNAPSHOT_INTERVAL {
            last_snapshot = Instant::now();
            tracing::debug!(workers = ?scheduler.snapshot(), "worker status");
        }
        std::thread::sleep(interval);
    }
}

fn print_activity(scheduler: &mut Scheduler) {
    for entry in scheduler.activity_mut().take_new() {
        eprintln!("{entry}");
    }
}
