use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;

use crate::error::ExitError;

/// Minimum time spent collecting output after the child exits.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Result of running a subprocess.
#[derive(Debug)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl RunOutput {
    /// Returns true if the process exited successfully.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Parse stdout as JSON.
    pub fn parse_json<T: serde::de::DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_str(&self.stdout)
            .with_context(|| "parsing JSON output from subprocess".to_string())
    }
}

/// Builder for running external tools (git, the tracker, quota checks).
#[derive(Debug, Clone)]
pub struct Tool {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
    cwd: Option<PathBuf>,
    envs: Vec<(String, String)>,
}

impl Tool {
    /// Create a new tool invocation.
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            timeout: None,
            cwd: None,
            envs: Vec::new(),
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_string());
        self
    }

    /// Add multiple arguments.
    pub fn args<S: AsRef<str>>(mut self, args: &[S]) -> Self {
        self.args
            .extend(args.iter().map(|s| s.as_ref().to_string()));
        self
    }

    /// Set a timeout for the subprocess.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Run in the given directory.
    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.envs.push((key.to_string(), value.to_string()));
        self
    }

    /// Human-readable form used in log lines.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    /// Run the tool, capturing stdout and stderr.
    ///
    /// The child leads its own process group, and a timeout kills the whole
    /// group. Output is collected until the pipes close or the deadline
    /// passes, whichever is first, so a background descendant holding a pipe
    /// open cannot stall the caller past its timeout.
    pub fn run(&self) -> anyhow::Result<RunOutput> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        new_process_group(&mut cmd);
        if let Some(ref dir) = self.cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }

        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut child = cmd.spawn().map_err(|e| self.not_found_or_other(e))?;

        // Drain both pipes concurrently so a chatty child can't fill a pipe
        // buffer and stall while we wait on it.
        let (tx, rx) = mpsc::channel();
        spawn_drain(child.stdout.take(), Pipe::Stdout, &tx);
        spawn_drain(child.stderr.take(), Pipe::Stderr, &tx);
        drop(tx);

        let status = match self.timeout {
            Some(timeout) => wait_with_timeout(&mut child, timeout, &self.program)?,
            None => child
                .wait()
                .with_context(|| format!("waiting for {}", self.program))?,
        };

        // A child that exited just before its deadline still gets its output read.
        let deadline = deadline.map(|d| d.max(Instant::now() + DRAIN_GRACE));
        let (stdout, stderr) = collect_output(&rx, deadline, &self.program);
        Ok(RunOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: status.code().unwrap_or(-1),
        })
    }

    /// Run the tool and return an error if it fails.
    pub fn run_ok(&self) -> anyhow::Result<RunOutput> {
        let output = self.run()?;
        if output.success() {
            Ok(output)
        } else {
            Err(ExitError::ToolFailed {
                tool: self.program.clone(),
                code: output.exit_code,
                message: output.stderr.trim().to_string(),
            }
            .into())
        }
    }

    fn not_found_or_other(&self, e: std::io::Error) -> anyhow::Error {
        if e.kind() == std::io::ErrorKind::NotFound {
            ExitError::ToolNotFound {
                tool: self.program.clone(),
            }
            .into()
        } else {
            anyhow::Error::new(e).context(format!("running {}", self.program))
        }
    }
}

/// Make the child the leader of a new process group, so the group can be
/// killed as a unit with [`kill_process_group`].
#[cfg(unix)]
pub fn new_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
pub const fn new_process_group(_cmd: &mut Command) {}

/// SIGKILL every process in the group led by `pid`. A group that is already
/// gone is not an error.
#[cfg(unix)]
pub fn kill_process_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // 0 and 1 would address our own group and init.
    if pgid <= 1 {
        return;
    }
    // SAFETY: killpg takes no pointers; a stale group id fails with ESRCH.
    let result = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if result == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::debug!(pgid, error = %err, "killpg failed");
        }
    }
}

#[cfg(not(unix))]
pub const fn kill_process_group(_pid: u32) {}

/// Kill the child's process group, then the child itself.
pub fn kill_tree(child: &mut Child) {
    kill_process_group(child.id());
    let _ = child.kill();
}

#[derive(Debug, Clone, Copy)]
enum Pipe {
    Stdout,
    Stderr,
}

fn spawn_drain<R: Read + Send + 'static>(pipe: Option<R>, which: Pipe, tx: &Sender<(Pipe, Vec<u8>)>) {
    let Some(mut reader) = pipe else {
        return;
    };
    let tx = tx.clone();
    thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send((which, buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
    });
}

/// Gather drained output until every pipe closes or `deadline` passes.
fn collect_output(
    rx: &Receiver<(Pipe, Vec<u8>)>,
    deadline: Option<Instant>,
    tool_name: &str,
) -> (Vec<u8>, Vec<u8>) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    loop {
        let chunk = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(remaining) {
                    Ok(chunk) => Some(chunk),
                    Err(RecvTimeoutError::Disconnected) => None,
                    Err(RecvTimeoutError::Timeout) => {
                        tracing::debug!(tool = tool_name, "output pipes still open at deadline, returning partial output");
                        None
                    }
                }
            }
            None => rx.recv().ok(),
        };
        match chunk {
            Some((Pipe::Stdout, bytes)) => stdout.extend_from_slice(&bytes),
            Some((Pipe::Stderr, bytes)) => stderr.extend_from_slice(&bytes),
            None => break,
        }
    }
    (stdout, stderr)
}

fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
    tool_name: &str,
) -> anyhow::Result<ExitStatus> {
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {
                if start.elapsed() >= timeout {
                    kill_tree(child);
                    let _ = child.wait();
                    return Err(ExitError::Timeout {
                        tool: tool_name.to_string(),
                        timeout_secs: timeout.as_secs(),
                    }
                    .into());
                }
                thread::sleep(Duration::from_millis(20));
            }
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("waiting for {tool_name}")));
            }
        }
    }
}
