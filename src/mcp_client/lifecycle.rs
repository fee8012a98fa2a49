//! Server process lifecycle helpers.
//!
//! Spawning stdio servers, capturing their stderr, graceful-then-forced
//! shutdown, and the reconnect backoff schedule shared by every client.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;

use super::errors::McpError;
use crate::config::ServerConfig;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for graceful shutdown before force-killing.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Stderr lines kept per server for error context.
const STDERR_TAIL_LINES: usize = 20;

/// Max characters of stderr appended to an error message.
const STDERR_SUFFIX_MAX: usize = 2000;

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Spawn a stdio server process with all three standard streams piped.
pub fn spawn_process(config: &ServerConfig) -> Result<Child, McpError> {
    let command = config.command.as_deref().ok_or_else(|| McpError::SpawnFailed {
        name: config.name.clone(),
        reason: "no command configured".into(),
    })?;

    let mut cmd = Command::new(command);
    cmd.args(&config.args);
    for (key, value) in &config.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &config.cwd {
        cmd.current_dir(dir);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
        name: config.name.clone(),
        reason: format!("{command}: {e}"),
    })?;

    tracing::info!(
        server = %config.name,
        command = %command,
        pid = ?child.id(),
        "spawned server process"
    );
    Ok(child)
}

// ─── Stderr Capture ──────────────────────────────────────────────────────────

/// Rolling window over the last lines a server wrote to stderr.
#[derive(Clone, Default)]
pub struct StderrTail(Arc<Mutex<VecDeque<String>>>);

impl StderrTail {
    pub fn push(&self, line: String) {
        let mut lines = match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn snapshot(&self) -> String {
        let lines = match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Suffix for error messages (empty string if no stderr).
    pub fn suffix(&self) -> String {
        format_stderr_suffix(&self.snapshot())
    }
}

/// Drain a server's stderr into tracing and the tail buffer.
pub fn spawn_stderr_drain(server: &str, stderr: ChildStderr, tail: StderrTail) -> JoinHandle<()> {
    let server = server.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::debug!(server = %server, stderr = %line, "server stderr");
                    tail.push(line);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(server = %server, error = %e, "stderr read failed");
                    break;
                }
            }
        }
    })
}

/// Format a stderr suffix for error messages (empty string if no stderr).
pub fn format_stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.len() > STDERR_SUFFIX_MAX {
        let mut cut = STDERR_SUFFIX_MAX;
        while !trimmed.is_char_boundary(cut) {
            cut -= 1;
        }
        format!(" | stderr: {}...(truncated)", &trimmed[..cut])
    } else {
        format!(" | stderr: {trimmed}")
    }
}

// ─── Shutdown ────────────────────────────────────────────────────────────────

/// Ask the process to exit, wait up to [`SHUTDOWN_TIMEOUT`], then kill it.
///
/// Stdin should already be closed by the caller; many servers exit on EOF.
pub async fn terminate_child(server: &str, child: &mut Child) {
    if let Ok(Some(status)) = child.try_wait() {
        tracing::debug!(server = %server, %status, "server process already exited");
        return;
    }

    send_terminate(server, child);

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!(server = %server, %status, "server process exited");
        }
        Ok(Err(e)) => {
            tracing::warn!(server = %server, error = %e, "failed waiting for server process");
            let _ = child.kill().await;
        }
        Err(_) => {
            tracing::warn!(
                server = %server,
                timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                "server did not exit in time, killing"
            );
            let _ = child.kill().await;
        }
    }
}

#[cfg(unix)]
fn send_terminate(server: &str, child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        tracing::debug!(server = %server, error = %e, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn send_terminate(_server: &str, _child: &Child) {
    // No graceful signal available; the timeout path kills the process.
}

// ─── Backoff ─────────────────────────────────────────────────────────────────

/// Delay before reconnect attempt `attempt` (1-based): `base * 2^(attempt-1)`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let base = Duration::from_secs(5);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(5));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(10));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(20));
    }

    #[test]
    fn test_backoff_zero_base() {
        assert_eq!(backoff_delay(Duration::ZERO, 3), Duration::ZERO);
    }

    #[test]
    fn test_format_stderr_suffix_empty() {
        assert_eq!(format_stderr_suffix(""), "");
        assert_eq!(format_stderr_suffix("  \n "), "");
    }

    #[test]
    fn test_format_stderr_suffix_truncates() {
        let long = "x".repeat(3000);
        let suffix = format_stderr_suffix(&long);
        assert!(suffix.starts_with(" | stderr: "));
        assert!(suffix.ends_with("...(truncated)"));
    }

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let tail = StderrTail::default();
        for i in 0..30 {
            tail.push(format!("line {i}"));
        }
        let snap = tail.snapshot();
        assert!(!snap.contains("line 9\n"));
        assert!(snap.starts_with("line 10"));
        assert!(snap.ends_with("line 29"));
    }

    #[tokio::test]
    async fn test_spawn_missing_command_fails() {
        let cfg = ServerConfig::stdio("ghost", "/nonexistent/definitely-not-here", &[]);
        let err = spawn_process(&cfg).unwrap_err();
        assert!(matches!(err, McpError::SpawnFailed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_child_stops_process() {
        let cfg = ServerConfig::stdio("sleeper", "sleep", &["30"]);
        let mut child = spawn_process(&cfg).unwrap();
        terminate_child("sleeper", &mut child).await;
        assert!(child.try_wait().unwrap().is_some());
    }
}
