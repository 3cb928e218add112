//! Backend process supervision.
//!
//! Spawns one child per backend descriptor with piped stdio, forwards its
//! stderr into the gateway log, and terminates/reaps it at shutdown. Each
//! child leads its own process group on Unix so signals also reach anything
//! it launched (e.g. `npx` → `node`).

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use super::config::BackendDescriptor;
use super::errors::GatewayError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// How long to wait for a SIGKILLed child to be reaped.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// How long the stderr drain may keep running after the child is reaped.
const DRAIN_FINISH_TIMEOUT: Duration = Duration::from_millis(200);

/// Longest stderr line forwarded to the log, in bytes.
const MAX_STDERR_LINE: usize = 2000;

// ─── ManagedProcess ──────────────────────────────────────────────────────────

/// A freshly spawned backend with its stdio pipes split off.
pub struct SpawnedBackend {
    pub process: ManagedProcess,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// Owns a backend child process until it has been reaped.
pub struct ManagedProcess {
    name: String,
    pid: Option<u32>,
    /// `None` once the child has been reaped.
    child: Option<Child>,
    exit_status: Option<ExitStatus>,
    drain_task: Option<JoinHandle<()>>,
}

impl ManagedProcess {
    /// OS process id, as observed at spawn time.
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status, once reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Whether the child is still running. Reaps it if it has exited.
    pub fn is_alive(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        let polled = child.try_wait();
        match &polled {
            Ok(Some(status)) => self.record_exit(*status),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(backend = %self.name, error = %e, "failed to poll backend process");
            }
        }
        running_after_poll(&polled)
    }

    /// Ask the backend to exit (SIGTERM to its process group).
    ///
    /// Failures are logged, not returned; `wait` escalates regardless.
    pub fn terminate(&mut self) {
        if self.child.is_none() {
            return;
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            if let Some(pid) = self.pid {
                tracing::debug!(backend = %self.name, pid, "sending SIGTERM to process group");
                if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    tracing::warn!(backend = %self.name, pid, error = %e, "SIGTERM failed");
                }
            }
        }

        #[cfg(not(unix))]
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.start_kill() {
                tracing::warn!(backend = %self.name, error = %e, "terminate failed");
            }
        }
    }

    /// Wait up to `grace` for the child to exit, then kill it.
    ///
    /// Returns the exit status once reaped, or `None` if the child could not
    /// be reaped even after SIGKILL. The child handle is released only here.
    pub async fn wait(&mut self, grace: Duration) -> Option<ExitStatus> {
        let Some(child) = self.child.as_mut() else {
            return self.exit_status;
        };

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(backend = %self.name, status = %status, "backend exited");
                self.record_exit(status);
                self.finish_drain().await;
                return self.exit_status;
            }
            Ok(Err(e)) => {
                tracing::warn!(backend = %self.name, error = %e, "wait failed; killing backend");
            }
            Err(_) => {
                tracing::warn!(
                    backend = %self.name,
                    grace_ms = grace.as_millis() as u64,
                    "backend did not exit within grace period; killing"
                );
            }
        }

        self.kill_group();
        let Some(child) = self.child.as_mut() else {
            return self.exit_status;
        };
        if let Err(e) = child.start_kill() {
            tracing::debug!(backend = %self.name, error = %e, "start_kill failed");
        }

        match tokio::time::timeout(KILL_REAP_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(backend = %self.name, status = %status, "backend killed");
                self.record_exit(status);
            }
            Ok(Err(e)) => {
                tracing::error!(backend = %self.name, error = %e, "failed to reap killed backend");
            }
            Err(_) => {
                tracing::error!(backend = %self.name, "killed backend was not reaped in time");
            }
        }
        self.finish_drain().await;
        self.exit_status
    }

    /// `terminate` followed by `wait`.
    pub async fn shutdown(&mut self, grace: Duration) -> Option<ExitStatus> {
        if !self.is_alive() {
            self.finish_drain().await;
            return self.exit_status;
        }
        self.terminate();
        self.wait(grace).await
    }

    #[cfg(unix)]
    fn kill_group(&self) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = self.pid {
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                tracing::debug!(backend = %self.name, pid, error = %e, "SIGKILL to process group failed");
            }
        }
    }

    #[cfg(not(unix))]
    fn kill_group(&self) {}

    fn record_exit(&mut self, status: ExitStatus) {
        self.exit_status = Some(status);
        self.child = None;
    }

    async fn finish_drain(&mut self) {
        let Some(mut handle) = self.drain_task.take() else {
            return;
        };
        if tokio::time::timeout(DRAIN_FINISH_TIMEOUT, &mut handle).await.is_err() {
            // Something else still holds the stderr pipe open.
            handle.abort();
        }
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Spawn the backend described by `descriptor` with piped stdio.
///
/// Must be called inside a tokio runtime (the stderr drain starts here).
pub fn spawn(descriptor: &BackendDescriptor) -> Result<SpawnedBackend, GatewayError> {
    let name = descriptor.name.as_str();

    let mut cmd = Command::new(&descriptor.command);
    cmd.args(&descriptor.args);
    cmd.envs(&descriptor.env);
    if let Some(dir) = &descriptor.working_dir {
        cmd.current_dir(dir);
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    let mut child = cmd.spawn().map_err(|e| GatewayError::SpawnFailed {
        name: name.to_string(),
        reason: format!("{}: {e}", descriptor.command),
    })?;

    let stdin = child.stdin.take().ok_or(GatewayError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdin".into(),
    })?;
    let stdout = child.stdout.take().ok_or(GatewayError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdout".into(),
    })?;
    let drain_task = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(drain_stderr(name.to_string(), stderr)));

    let pid = child.id();
    tracing::info!(
        backend = name,
        pid = ?pid,
        command = %descriptor.command,
        "spawned backend process"
    );

    Ok(SpawnedBackend {
        process: ManagedProcess {
            name: name.to_string(),
            pid,
            child: Some(child),
            exit_status: None,
            drain_task,
        },
        stdin,
        stdout,
    })
}

/// Forward each stderr line to the log until the pipe closes.
async fn drain_stderr(name: String, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let mut line = String::from_utf8_lossy(&buf).trim_end().to_string();
                if line.is_empty() {
                    continue;
                }
                if line.len() > MAX_STDERR_LINE {
                    let mut cut = MAX_STDERR_LINE;
                    while !line.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    line.truncate(cut);
                    line.push_str("...(truncated)");
                }
                tracing::info!(target: "mcp_gateway::backend", backend = %name, "{line}");
            }
            Err(e) => {
                tracing::warn!(backend = %name, error = %e, "stderr read failed");
                break;
            }
        }
    }
}

/// A child is only known to be gone once `try_wait` has returned its status.
/// A failed poll leaves it counted as running so shutdown still signals it.
fn running_after_poll(polled: &std::io::Result<Option<ExitStatus>>) -> bool {
    !matches!(polled, Ok(Some(_)))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
