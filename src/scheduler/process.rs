//! Worker process launching and output plumbing.
//!
//! Reader threads turn each output line into an [`Event`] and `try_send` it
//! to the scheduler. Queues are bounded; a full queue drops the message.
//! Every message carries the run generation it belongs to so the scheduler
//! can ignore output from a run it already killed.
//!
//! Each run leads its own process group. Killing a run kills the group, and
//! when the worker exits on its own any descendants it left behind are
//! killed too, so nothing keeps writing into a workspace that is about to be
//! reconciled or reused.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;

use crate::events::{Event, parse_line};
use crate::identity::Identity;
use crate::subprocess::{kill_process_group, kill_tree, new_process_group};

pub const EVENT_QUEUE_CAPACITY: usize = 100;
pub const EXIT_QUEUE_CAPACITY: usize = 10;

const EXIT_POLL: Duration = Duration::from_millis(50);

/// One parsed output line from a worker run.
#[derive(Debug, Clone)]
pub struct WorkerMessage {
    pub worker: usize,
    pub run_id: u64,
    pub event: Event,
}

/// A worker run ended. `code` is `None` when the process was killed by a
/// signal or its status could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub worker: usize,
    pub run_id: u64,
    pub code: Option<i32>,
}

/// Sending half handed to a launched run.
#[derive(Debug, Clone)]
pub struct WorkerSink {
    worker: usize,
    run_id: u64,
    events: SyncSender<WorkerMessage>,
    exits: SyncSender<WorkerExit>,
}

impl WorkerSink {
    pub const fn new(
        worker: usize,
        run_id: u64,
        events: SyncSender<WorkerMessage>,
        exits: SyncSender<WorkerExit>,
    ) -> Self {
        Self {
            worker,
            run_id,
            events,
            exits,
        }
    }

    /// Returns false if the message was dropped.
    pub fn send_event(&self, event: Event) -> bool {
        let message = WorkerMessage {
            worker: self.worker,
            run_id: self.run_id,
            event,
        };
        match self.events.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!(worker = self.worker, run_id = self.run_id, "event queue full, dropping event");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn send_exit(&self, code: Option<i32>) -> bool {
        let exit = WorkerExit {
            worker: self.worker,
            run_id: self.run_id,
            code,
        };
        match self.exits.try_send(exit) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(worker = self.worker, run_id = self.run_id, "exit queue full, dropping exit");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Opaque handle to a running worker process. Killing is the only control.
pub trait ProcessHandle: Send + std::fmt::Debug {
    fn terminate(&self);
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Everything needed to start one run.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub worker: usize,
    pub worker_name: String,
    pub run_id: u64,
    pub task_id: String,
    pub workspace: PathBuf,
    pub identity: Option<Identity>,
    pub directive: String,
}

pub trait WorkerLauncher {
    fn launch(
        &self,
        request: &LaunchRequest,
        sink: WorkerSink,
    ) -> anyhow::Result<Box<dyn ProcessHandle>>;
}

/// Launches the configured worker command with the directive as its final
/// argument.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    command: Vec<String>,
    env: BTreeMap<String, String>,
}

impl ProcessLauncher {
    pub const fn new(command: Vec<String>, env: BTreeMap<String, String>) -> Self {
        Self { command, env }
    }
}

#[derive(Debug)]
struct ChildHandle {
    child: Arc<Mutex<Child>>,
    pid: u32,
}

impl ProcessHandle for ChildHandle {
    fn terminate(&self) {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        kill_tree(&mut child);
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(
        &self,
        request: &LaunchRequest,
        sink: WorkerSink,
    ) -> anyhow::Result<Box<dyn ProcessHandle>> {
        let Some((program, args)) = self.command.split_first() else {
            anyhow::bail!("worker command is empty");
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(&request.directive)
            .current_dir(&request.workspace)
            .envs(&self.env)
            .env("FOREMAN_WORKER", &request.worker_name)
            .env("FOREMAN_TASK", &request.task_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        new_process_group(&mut cmd);
        if let Some(identity) = &request.identity {
            cmd.env("HOME", &identity.home);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning {program} in {}", request.workspace.display()))?;
        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let readers: Vec<JoinHandle<()>> = [
            stdout.map(|s| spawn_reader(s, sink.clone())),
            stderr.map(|s| spawn_reader(s, sink.clone())),
        ]
        .into_iter()
        .flatten()
        .collect();

        let child = Arc::new(Mutex::new(child));
        let waited = Arc::clone(&child);
        thread::spawn(move || {
            let code = wait_for_exit(&waited);
            // Orphans still hold the output pipes; the readers end once they die.
            kill_process_group(pid);
            for reader in readers {
                let _ = reader.join();
            }
            sink.send_exit(code);
        });

        tracing::debug!(worker = %request.worker_name, run_id = request.run_id, pid, "worker process started");
        Ok(Box::new(ChildHandle { child, pid }))
    }
}

fn spawn_reader<R: Read + Send + 'static>(stream: R, sink: WorkerSink) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']);
                    if line.trim().is_empty() {
                        continue;
                    }
                    sink.send_event(parse_line(line));
                }
            }
        }
    })
}

/// Poll without holding the lock across a blocking wait, so `terminate`
/// can always get in.
fn wait_for_exit(child: &Mutex<Child>) -> Option<i32> {
    loop {
        let status = child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_wait();
        match status {
            Ok(Some(status)) => return status.code(),
            Ok(None) => thread::sleep(EXIT_POLL),
            Err(e) => {
                tracing::warn!(error = %e, "could not read worker exit status");
                return None;
            }
        }
    }
}
