//! Managed process — direct child spawning with stdio relay.
//!
//! The supervisor owns exactly one of these per live service:
//! - stdout/stderr are captured line-by-line and relayed into `tracing`
//!   (the collaborator's logging sink), with a bounded ring buffer of the
//!   most recent lines for status reporting
//! - process exit is observed through a `watch` channel so the supervisor's
//!   exit watcher can react without polling
//! - termination goes by PID signal, since the `Child` handle itself lives
//!   inside the waiter task

use std::collections::VecDeque;
use std::sync::Arc;
use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{watch, Mutex};

use super::error::SupervisorError;

/// Maximum number of recent console lines kept per process.
const OUTPUT_BUFFER_LINES: usize = 1_000;

struct OutputBuffer {
    lines: VecDeque<String>,
}

impl OutputBuffer {
    fn new() -> Self {
        Self {
            lines: VecDeque::with_capacity(OUTPUT_BUFFER_LINES),
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() >= OUTPUT_BUFFER_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn recent(&self, count: usize) -> Vec<String> {
        self.lines.iter().rev().take(count).rev().cloned().collect()
    }
}

/// One externally-specified executable under supervision.
pub struct ManagedProcess {
    pub pid: u32,
    output: Arc<Mutex<OutputBuffer>>,
    running_rx: watch::Receiver<bool>,
}

impl ManagedProcess {
    /// Spawn the child with stdio piped. `service` labels the relayed log
    /// lines so interleaved output from several services stays readable.
    pub async fn spawn(
        program: &str,
        args: &[String],
        working_dir: &str,
        env_vars: &[(String, String)],
        service: &str,
    ) -> Result<Self, SupervisorError> {
        let mut cmd = TokioCommand::new(program);
        cmd.args(args)
            .current_dir(working_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);

        for (key, value) in env_vars {
            cmd.env(key, value);
        }

        // Windows: hide console window
        apply_creation_flags(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| SupervisorError::SpawnFailed {
            program: program.to_string(),
            reason: e.to_string(),
        })?;

        let pid = child.id().ok_or_else(|| SupervisorError::SpawnFailed {
            program: program.to_string(),
            reason: "no PID for spawned process".to_string(),
        })?;

        let (running_tx, running_rx) = watch::channel(true);
        let output = Arc::new(Mutex::new(OutputBuffer::new()));

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // ── stdout reader ────────────────────────────────────
        if let Some(stdout) = stdout {
            let buf = output.clone();
            let label = service.to_string();
            tokio::spawn(async move {
                let reader = BufReader::new(stdout);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("[{}] {}", label, line);
                    buf.lock().await.push(line);
                }
            });
        }

        // ── stderr reader ────────────────────────────────────
        if let Some(stderr) = stderr {
            let buf = output.clone();
            let label = service.to_string();
            tokio::spawn(async move {
                let reader = BufReader::new(stderr);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!("[{}] {}", label, line);
                    buf.lock().await.push(line);
                }
            });
        }

        // ── process waiter ───────────────────────────────────
        {
            let label = service.to_string();
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => {
                        tracing::info!("Service '{}' (pid {}) exited with {}", label, pid, status)
                    }
                    Err(e) => {
                        tracing::warn!("Failed to wait for service '{}' (pid {}): {}", label, pid, e)
                    }
                }
                let _ = running_tx.send(false);
            });
        }

        tracing::info!("Service '{}' started with PID {}", service, pid);

        Ok(Self {
            pid,
            output,
            running_rx,
        })
    }

    /// Whether the OS still reports the child as running.
    pub fn is_running(&self) -> bool {
        *self.running_rx.borrow()
    }

    /// A receiver that flips to `false` when the child exits.
    pub fn exit_signal(&self) -> watch::Receiver<bool> {
        self.running_rx.clone()
    }

    /// The most recent `count` captured console lines.
    pub async fn recent_output(&self, count: usize) -> Vec<String> {
        self.output.lock().await.recent(count)
    }

    /// Send a termination signal (SIGTERM, or SIGKILL when `force`).
    pub fn terminate(&self, force: bool) -> Result<(), SupervisorError> {
        signal_pid(self.pid, force)
    }

    /// Wait for the child to exit, up to `timeout`. Returns whether it did.
    pub async fn wait_for_exit(&self, timeout: std::time::Duration) -> bool {
        let mut rx = self.running_rx.clone();
        tokio::time::timeout(timeout, rx.wait_for(|running| !*running))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}

/// Hide the console window of spawned children on Windows; no-op elsewhere.
#[cfg(target_os = "windows")]
fn apply_creation_flags(cmd: &mut TokioCommand) -> &mut TokioCommand {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW)
}

#[cfg(not(target_os = "windows"))]
fn apply_creation_flags(cmd: &mut TokioCommand) -> &mut TokioCommand {
    cmd
}

/// Cross-platform PID signalling.
fn signal_pid(pid: u32, force: bool) -> Result<(), SupervisorError> {
    #[cfg(target_os = "windows")]
    {
        use winapi::um::handleapi::CloseHandle;
        use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
        use winapi::um::winnt::PROCESS_TERMINATE;

        let _ = force;
        unsafe {
            let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
            if handle.is_null() {
                return Err(SupervisorError::TerminationFailed {
                    pid,
                    reason: "OpenProcess failed".to_string(),
                });
            }
            let result = TerminateProcess(handle, 0);
            CloseHandle(handle);
            if result == 0 {
                return Err(SupervisorError::TerminationFailed {
                    pid,
                    reason: "TerminateProcess failed".to_string(),
                });
            }
        }
        Ok(())
    }

    #[cfg(not(target_os = "windows"))]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        signal::kill(Pid::from_raw(pid as i32), sig).map_err(|e| {
            SupervisorError::TerminationFailed {
                pid,
                reason: e.to_string(),
            }
        })
    }
}
