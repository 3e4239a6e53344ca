use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{debug, error, warn};
use serde::Serialize;
use tokio::process::Command;
use tokio::time::{sleep, timeout};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace window between SIGTERM and SIGKILL when a command exceeds its
/// deadline. Kept short so a hung `git` never outlives its caller by much.
pub const KILL_GRACE: Duration = Duration::from_millis(1000);
const LIVENESS_SLICE: Duration = Duration::from_millis(100);

/// Captured result of a finished git subprocess. Non-zero exit is data, not
/// an error: probing callers inspect `exit_code` themselves.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// Failure modes of the async runner that are not expressible as an exit
/// code: the process never ran, ran past its deadline, or died to a signal
/// we did not send.
#[derive(Debug)]
pub enum GitCommandError {
    Spawn { command: String, message: String },
    TimedOut { command: String, limit: Duration },
    Signaled { command: String },
}

impl fmt::Display for GitCommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GitCommandError::Spawn { command, message } => {
                write!(f, "failed to spawn `{command}`: {message}")
            }
            GitCommandError::TimedOut { command, limit } => {
                write!(f, "`{command}` timed out after {}ms", limit.as_millis())
            }
            GitCommandError::Signaled { command } => {
                write!(f, "`{command}` was terminated by a signal")
            }
        }
    }
}

impl std::error::Error for GitCommandError {}

fn render_command(args: &[&str]) -> String {
    let mut rendered = String::from("git");
    for arg in args {
        rendered.push(' ');
        rendered.push_str(arg);
    }
    rendered
}

/// Runs `git` asynchronously with a deadline. On timeout the child gets a
/// SIGTERM, a grace window to exit, then a SIGKILL, and the call reports
/// `TimedOut`, distinguishable from both non-zero exit (a `CommandOutput`)
/// and signal death (`Signaled`).
pub async fn run_git(cwd: &Path, args: &[&str], limit: Duration) -> Result<CommandOutput, GitCommandError> {
    let command = render_command(args);
    debug!("running `{command}` in {}", cwd.display());

    let child = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| GitCommandError::Spawn {
            command: command.clone(),
            message: e.to_string(),
        })?;

    let pid = child.id();
    let wait = child.wait_with_output();
    tokio::pin!(wait);

    tokio::select! {
        result = &mut wait => {
            let output = result.map_err(|e| GitCommandError::Spawn {
                command: command.clone(),
                message: e.to_string(),
            })?;
            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            match output.status.code() {
                Some(exit_code) => {
                    if exit_code != 0 {
                        debug!("`{command}` exited with {exit_code}: {}", stderr.trim());
                    }
                    Ok(CommandOutput { stdout, stderr, exit_code })
                }
                None => {
                    warn!("`{command}` was killed by a signal");
                    Err(GitCommandError::Signaled { command })
                }
            }
        }
        _ = sleep(limit) => {
            warn!("`{command}` exceeded {}ms deadline, escalating", limit.as_millis());
            if let Some(pid) = pid {
                terminate_gracefully(pid as i32).await;
            }
            // Reap the child so no zombie outlives the timeout path.
            let _ = timeout(KILL_GRACE, &mut wait).await;
            Err(GitCommandError::TimedOut { command, limit })
        }
    }
}

/// Runs `git` synchronously and fails on non-zero exit, surfacing stderr
/// (falling back to stdout) in the error. Used for destructive operations
/// where callers convert failures into structured results.
pub fn run_git_sync(cwd: &Path, args: &[&str]) -> Result<String> {
    let command = render_command(args);
    debug!("running `{command}` in {}", cwd.display());

    let output = std::process::Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .with_context(|| format!("failed to execute `{command}`"))?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if output.status.success() {
        return Ok(stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    error!(
        "`{command}` failed with status {:?}: {stderr}",
        output.status.code()
    );
    let detail = if stderr.is_empty() { stdout } else { stderr };
    Err(anyhow!("`{command}` failed: {detail}"))
}

/// SIGTERM, bounded liveness polling, then SIGKILL. The second signal is
/// unconditional once the grace window closes.
async fn terminate_gracefully(pid: i32) {
    let pid_t = pid as libc::pid_t;

    debug!("sending SIGTERM to process {pid}");
    let term = unsafe { libc::kill(pid_t, libc::SIGTERM) };
    if term == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return;
        }
        warn!("failed to SIGTERM process {pid}: {err}");
    }

    let mut waited = Duration::from_millis(0);
    while waited < KILL_GRACE {
        if !process_alive(pid_t) {
            return;
        }
        sleep(LIVENESS_SLICE).await;
        waited += LIVENESS_SLICE;
    }

    debug!("escalating to SIGKILL for process {pid}");
    let kill = unsafe { libc::kill(pid_t, libc::SIGKILL) };
    if kill == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!("failed to SIGKILL process {pid}: {err}");
        }
    }
}

fn process_alive(pid: libc::pid_t) -> bool {
    unsafe {
        if libc::kill(pid, 0) == 0 {
            true
        } else {
            matches!(
                std::io::Error::last_os_error().raw_os_error(),
                Some(libc::EPERM)
            )
        }
    }
}
