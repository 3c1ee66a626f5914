//! One-shot worker CLI invocations
//!
//! The worker binary exposes short-lived subcommands (status, doctor,
//! devices, ...) that exit on their own and print text or JSON. Every
//! invocation runs under a bounded timeout with a SIGTERM → SIGKILL
//! fallback so a wedged subcommand can never hang its caller, and all
//! captured output is redacted before it leaves this module.

use crate::error::{Error, Result};
use crate::redact::redact_secrets;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Default budget for a one-shot subcommand.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace between SIGTERM and SIGKILL when a subcommand overruns.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Captured result of a one-shot worker command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code (`-1` when killed by signal)
    pub exit_code: i32,
    /// Combined stdout, secrets masked
    pub stdout: String,
    /// Combined stderr, secrets masked
    pub stderr: String,
    /// Whether the command overran its budget and was terminated
    pub timed_out: bool,
}

impl CommandOutput {
    /// Whether the command completed with exit code zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Run `<bin> <args...>` and capture its output within `timeout`.
pub async fn run_worker_command(
    bin: &Path,
    args: &[&str],
    timeout: Duration,
) -> Result<CommandOutput> {
    debug!(bin = %bin.display(), ?args, "running one-shot worker command");

    let mut child = Command::new(bin)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::SpawnFailure(format!("{}: {e}", bin.display())))?;

    // Drain pipes on their own tasks so a chatty subcommand can't
    // deadlock on a full pipe buffer while we wait on it.
    let stdout_task = spawn_drain(child.stdout.take());
    let stderr_task = spawn_drain(child.stderr.take());

    let (exit_code, timed_out) = tokio::select! {
        status = child.wait() => {
            let status = status.map_err(|e| Error::Io(e.to_string()))?;
            (status.code().unwrap_or(-1), false)
        }
        () = tokio::time::sleep(timeout) => {
            warn!(bin = %bin.display(), ?args, timeout_secs = timeout.as_secs(),
                "worker command overran its budget, terminating");
            terminate_child(&mut child).await;
            (-1, true)
        }
    };

    let out = stdout_task.await.unwrap_or_default();
    let err = stderr_task.await.unwrap_or_default();
    Ok(CommandOutput {
        exit_code,
        stdout: redact_secrets(&String::from_utf8_lossy(&out)),
        stderr: redact_secrets(&String::from_utf8_lossy(&err)),
        timed_out,
    })
}

fn spawn_drain<R>(pipe: Option<R>) -> tokio::task::JoinHandle<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    })
}

/// SIGTERM the child, wait out the grace window, SIGKILL if needed, and
/// always observe the exit so the caller resolves.
async fn terminate_child(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
        return;
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}
