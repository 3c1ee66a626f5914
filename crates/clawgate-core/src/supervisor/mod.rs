//! Worker lifecycle supervisor
//!
//! Owns the worker subprocess end to end: stale-resource cleanup,
//! spawn, readiness gating, crash detection with exponential-backoff
//! auto-restart, and graceful-then-forced shutdown. The supervisor is
//! the single source of truth for "is the worker usable"; every other
//! component only reads the ready flag or calls the operations here.
//!
//! Concurrency model:
//! - `ensure_running` collapses concurrent callers into one shared
//!   in-flight start attempt (no duplicate spawns).
//! - A monitor task owns each spawned child's `wait()`; the supervisor
//!   keeps only the PID. Exits are published on a watch channel keyed
//!   by spawn epoch, so `stop` observes the actual exit rather than
//!   assuming a kill landed.
//! - `stop` and the spawn section of a start attempt serialize on an
//!   operation lock; whole restarts serialize on a second lock so
//!   back-to-back restarts never overlap.

mod policy;

pub use policy::RestartSettings;

use crate::error::{Error, Result};
use crate::lock::{self, LockFile};
use crate::probe::{probe_target, ProxyTarget};
use crate::worker::{run_worker_command, COMMAND_TIMEOUT};
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Minimum spacing between automatic `doctor` diagnostic runs, so a
/// crash loop cannot trigger a diagnostic storm.
const DOCTOR_MIN_INTERVAL: Duration = Duration::from_secs(60);

/// Worker process configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Worker binary (long-lived `gateway run` plus one-shot subcommands)
    pub bin: PathBuf,
    /// Internal address the worker is told to bind
    pub target: ProxyTarget,
    /// Token passed to the worker's `--auth token` mode
    pub auth_token: String,
    /// Root of the worker's persistent state (also the archive root)
    pub data_dir: PathBuf,
    /// Default readiness budget for `ensure_running`
    pub start_timeout: Duration,
    /// Spacing between readiness probes
    pub probe_interval: Duration,
    /// SIGTERM → SIGKILL grace during stop
    pub stop_grace: Duration,
}

impl WorkerSettings {
    /// Lock file location (inside the data dir, next to the state).
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join("worker.lock")
    }
}

/// Observable lifecycle state of the managed worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// No live process
    Stopped,
    /// Spawned, not yet confirmed reachable
    Starting,
    /// Probe confirmed the listener accepts connections
    Ready,
    /// Died outside an intentional stop
    Crashed,
}

/// Recorded details of the most recent worker exit.
#[derive(Debug, Clone, Serialize)]
pub struct ExitInfo {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Terminating signal, if any
    pub signal: Option<i32>,
    /// When the exit was observed
    pub at: DateTime<Utc>,
}

/// Snapshot of supervisor state for the admin API and terminal.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    /// Current lifecycle state
    pub state: WorkerState,
    /// Readiness flag (set only after a successful probe)
    pub ready: bool,
    /// PID of the live worker, if any
    pub pid: Option<i32>,
    /// Consecutive failed restart attempts
    pub restart_attempts: u32,
    /// Most recent exit
    pub last_exit: Option<ExitInfo>,
    /// Most recent failure description
    pub last_error: Option<String>,
    /// Redacted output of the last automatic `doctor` run
    pub diagnostics: Option<String>,
}

type SharedStart = Shared<BoxFuture<'static, Result<()>>>;

struct Inner {
    state: WorkerState,
    pid: Option<i32>,
    /// Incremented per spawn; monitor reports and exit notifications
    /// carry the epoch so stale events are ignored.
    epoch: u64,
    attempts: u32,
    stop_requested: bool,
    restart_timer: Option<tokio::task::JoinHandle<()>>,
    start_in_flight: Option<SharedStart>,
    /// Incremented per registered start attempt; a finished attempt
    /// only deregisters itself, never a successor.
    start_seq: u64,
    last_exit: Option<ExitInfo>,
    last_error: Option<String>,
    diagnostics: Option<String>,
    last_doctor: Option<Instant>,
}

/// Supervises the single worker subprocess.
pub struct Supervisor {
    settings: WorkerSettings,
    restart_policy: RestartSettings,
    inner: Mutex<Inner>,
    /// Readiness flag; observers subscribe for changes.
    ready_tx: watch::Sender<bool>,
    /// Latest epoch whose exit has been observed.
    exit_tx: watch::Sender<u64>,
    /// Serializes stop and the spawn section of a start attempt.
    op_lock: Mutex<()>,
    /// Serializes whole restart (stop-then-start) sequences, and is
    /// held across maintenance windows (state import).
    restart_lock: Arc<Mutex<()>>,
    /// While set, `ensure_running` refuses to spawn at all.
    maintenance: AtomicBool,
}

/// Exclusive hold on the worker while its on-disk state is replaced.
///
/// Produced by [`Supervisor::begin_maintenance`]: the worker is stopped
/// and stays down; `ensure_running` fails fast and `restart` blocks
/// until the guard is dropped. Afterwards the stop is still sticky, so
/// bringing the worker back takes `clear_stop` plus `ensure_running`.
pub struct MaintenanceGuard {
    sup: Arc<Supervisor>,
    _restart: tokio::sync::OwnedMutexGuard<()>,
}

impl Drop for MaintenanceGuard {
    fn drop(&mut self) {
        self.sup.maintenance.store(false, Ordering::SeqCst);
    }
}

impl Supervisor {
    /// Create a supervisor; nothing is spawned until `ensure_running`.
    #[must_use]
    pub fn new(settings: WorkerSettings, restart_policy: RestartSettings) -> Arc<Self> {
        let (ready_tx, _) = watch::channel(false);
        let (exit_tx, _) = watch::channel(0);
        Arc::new(Self {
            settings,
            restart_policy,
            inner: Mutex::new(Inner {
                state: WorkerState::Stopped,
                pid: None,
                epoch: 0,
                attempts: 0,
                stop_requested: false,
                restart_timer: None,
                start_in_flight: None,
                start_seq: 0,
                last_exit: None,
                last_error: None,
                diagnostics: None,
                last_doctor: None,
            }),
            ready_tx,
            exit_tx,
            op_lock: Mutex::new(()),
            restart_lock: Arc::new(Mutex::new(())),
            maintenance: AtomicBool::new(false),
        })
    }

    /// Worker settings this supervisor was built with.
    #[must_use]
    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Current readiness flag.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    /// Subscribe to readiness changes.
    #[must_use]
    pub fn ready_watch(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    /// Snapshot of the current state.
    pub async fn status(&self) -> SupervisorStatus {
        let inner = self.inner.lock().await;
        SupervisorStatus {
            state: inner.state,
            ready: self.is_ready(),
            pid: inner.pid,
            restart_attempts: inner.attempts,
            last_exit: inner.last_exit.clone(),
            last_error: inner.last_error.clone(),
            diagnostics: inner.diagnostics.clone(),
        }
    }

    // ── ensure_running ───────────────────────────────────────────────

    /// Guarantee a worker reaches Ready within `timeout`.
    ///
    /// Idempotent and safe to call concurrently: all callers share the
    /// single in-flight attempt and observe the same outcome.
    pub async fn ensure_running(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        if self.maintenance.load(Ordering::SeqCst) {
            return Err(Error::LockConflict(
                "worker is held down for maintenance".into(),
            ));
        }
        let fut = {
            let mut inner = self.inner.lock().await;
            if self.is_ready() && inner.pid.is_some() {
                return Ok(());
            }
            match &inner.start_in_flight {
                Some(f) => f.clone(),
                None => {
                    inner.start_seq += 1;
                    let seq = inner.start_seq;
                    let sup = Arc::clone(self);
                    let f: SharedStart = async move { sup.start_attempt(seq, timeout).await }
                        .boxed()
                        .shared();
                    inner.start_in_flight = Some(f.clone());
                    f
                }
            }
        };
        fut.await
    }

    async fn start_attempt(self: Arc<Self>, seq: u64, timeout: Duration) -> Result<()> {
        let result = self.start_attempt_inner(timeout).await;

        {
            let mut inner = self.inner.lock().await;
            // A crash may already have deregistered this attempt and a
            // successor may be registered; only clear our own slot.
            if inner.start_seq == seq {
                inner.start_in_flight = None;
            }
            match &result {
                Ok(()) => {
                    inner.state = WorkerState::Ready;
                    inner.attempts = 0;
                    inner.last_error = None;
                }
                Err(e) => {
                    inner.last_error = Some(e.to_string());
                }
            }
        }

        if let Err(e) = &result {
            warn!(error = %e, "worker start attempt failed");
            self.collect_diagnostics().await;
            if matches!(e, Error::SpawnFailure(_)) {
                let mut inner = self.inner.lock().await;
                self.schedule_restart_locked(&mut inner);
            }
        }

        result
    }

    async fn start_attempt_inner(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        let epoch = {
            let _op = self.op_lock.lock().await;

            if self.maintenance.load(Ordering::SeqCst) {
                return Err(Error::LockConflict(
                    "worker is held down for maintenance".into(),
                ));
            }
            let inner = self.inner.lock().await;
            if self.is_ready() && inner.pid.is_some() {
                return Ok(());
            }
            // An operator stop is sticky: nothing spawns again until an
            // explicit start clears it.
            if inner.stop_requested {
                return Err(Error::Internal(
                    "worker was stopped; an explicit start is required".into(),
                ));
            }
            let need_spawn = match inner.pid {
                Some(pid) => !lock::pid_alive(pid),
                None => true,
            };
            drop(inner);

            if need_spawn {
                self.cleanup_stale().await?;
                self.spawn_worker().await?
            } else {
                // A previous attempt left a live, slow-starting child;
                // just resume polling it.
                self.inner.lock().await.epoch
            }
        };

        self.poll_ready(epoch, timeout).await
    }

    /// Spawn the long-lived worker process. Returns the new epoch.
    async fn spawn_worker(self: &Arc<Self>) -> Result<u64> {
        let s = &self.settings;
        info!(bin = %s.bin.display(), target = %s.target, "spawning worker");

        let mut child = Command::new(&s.bin)
            .arg("gateway")
            .arg("run")
            .arg("--bind")
            .arg(s.target.host.to_string())
            .arg("--port")
            .arg(s.target.port.to_string())
            .arg("--auth")
            .arg("token")
            .arg("--token")
            .arg(&s.auth_token)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::SpawnFailure(format!("{}: {e}", s.bin.display())))?;

        let pid = child.id().map(|p| p as i32).unwrap_or(-1);
        LockFile::new(s.lock_path()).acquire(pid as u32)?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_worker_logs(stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_worker_logs(stderr, true));
        }

        let epoch = {
            let mut inner = self.inner.lock().await;
            inner.epoch += 1;
            inner.pid = Some(pid);
            inner.state = WorkerState::Starting;
            inner.epoch
        };

        let sup = Arc::clone(self);
        tokio::spawn(async move { sup.monitor_exit(child, epoch).await });

        Ok(epoch)
    }

    /// Poll readiness until success, observed child death, or timeout.
    async fn poll_ready(self: &Arc<Self>, epoch: u64, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if probe_target(self.settings.target).await {
                self.ready_tx.send_replace(true);
                info!(target = %self.settings.target, "worker is ready");
                return Ok(());
            }

            {
                let inner = self.inner.lock().await;
                if inner.stop_requested {
                    return Err(Error::Internal("start aborted by operator stop".into()));
                }
                // Fail fast if the child died mid-poll instead of
                // burning the rest of the budget.
                if inner.epoch != epoch || inner.pid.is_none() {
                    let detail = inner
                        .last_exit
                        .as_ref()
                        .map(describe_exit)
                        .unwrap_or_else(|| "process disappeared during startup".into());
                    return Err(Error::UnexpectedExit(detail));
                }
            }

            if Instant::now() >= deadline {
                // Slow starter: leave it alive and keep probing in the
                // background so it still becomes usable eventually.
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "worker not reachable within budget; background probe continues"
                );
                self.spawn_background_probe(epoch);
                return Err(Error::ReadinessTimeout {
                    timeout_secs: timeout.as_secs(),
                });
            }

            tokio::time::sleep(self.settings.probe_interval).await;
        }
    }

    fn spawn_background_probe(self: &Arc<Self>, epoch: u64) {
        let sup = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(sup.settings.probe_interval).await;
                {
                    let inner = sup.inner.lock().await;
                    if inner.epoch != epoch || inner.pid.is_none() || inner.stop_requested {
                        return;
                    }
                }
                if probe_target(sup.settings.target).await {
                    let mut inner = sup.inner.lock().await;
                    if inner.epoch == epoch && inner.pid.is_some() {
                        inner.state = WorkerState::Ready;
                        inner.attempts = 0;
                        inner.last_error = None;
                        sup.ready_tx.send_replace(true);
                        info!("slow-starting worker became ready after the timeout");
                    }
                    return;
                }
            }
        });
    }

    // ── crash handling ───────────────────────────────────────────────

    /// Owns the child's `wait()`; records the exit and decides whether
    /// the restart policy applies.
    async fn monitor_exit(self: Arc<Self>, mut child: tokio::process::Child, epoch: u64) {
        let status = child.wait().await;

        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            // A newer spawn superseded this child.
            return;
        }
        inner.pid = None;
        self.ready_tx.send_replace(false);
        // Any registered start attempt was polling this child (or an
        // older one) and is doomed; deregister it so the next
        // `ensure_running`, including a backoff timer's, starts fresh
        // instead of joining it.
        inner.start_in_flight = None;

        let exit = match &status {
            Ok(st) => {
                use std::os::unix::process::ExitStatusExt;
                ExitInfo {
                    code: st.code(),
                    signal: st.signal(),
                    at: Utc::now(),
                }
            }
            Err(_) => ExitInfo {
                code: None,
                signal: None,
                at: Utc::now(),
            },
        };
        let detail = describe_exit(&exit);
        inner.last_exit = Some(exit.clone());
        let _ = LockFile::new(self.settings.lock_path()).release();

        let intentional = inner.stop_requested;
        let clean = exit.code == Some(0);
        self.exit_tx.send_replace(epoch);

        if intentional || clean {
            info!(%detail, "worker exited cleanly");
            inner.state = WorkerState::Stopped;
            return;
        }

        warn!(%detail, "worker exited unexpectedly");
        inner.state = WorkerState::Crashed;
        inner.last_error = Some(Error::UnexpectedExit(detail).to_string());
        self.schedule_restart_locked(&mut inner);
    }

    /// Schedule a backoff restart. At most one timer is pending;
    /// scheduling while one is pending is a no-op.
    fn schedule_restart_locked(self: &Arc<Self>, inner: &mut Inner) {
        if inner
            .restart_timer
            .as_ref()
            .is_some_and(|t| !t.is_finished())
        {
            debug!("restart timer already pending");
            return;
        }
        if !self.restart_policy.may_retry(inner.attempts) {
            let err = Error::RestartsExhausted {
                attempts: inner.attempts,
            };
            error!(attempts = inner.attempts, "auto-restart stopped; operator action required");
            inner.last_error = Some(err.to_string());
            return;
        }

        let delay = self.restart_policy.delay_for(inner.attempts);
        inner.attempts += 1;
        info!(delay_ms = delay.as_millis() as u64, attempt = inner.attempts, "scheduling worker restart");

        let sup = Arc::clone(self);
        inner.restart_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut inner = sup.inner.lock().await;
                inner.restart_timer = None;
                if inner.stop_requested {
                    return;
                }
            }
            if let Err(e) = sup.ensure_running(sup.settings.start_timeout).await {
                warn!(error = %e, "scheduled restart attempt failed");
            }
        }));
    }

    // ── stop / restart ───────────────────────────────────────────────

    /// Terminate the worker without rescheduling a restart.
    pub async fn stop(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.stop_locked().await
    }

    async fn stop_locked(&self) -> Result<()> {
        let (pid, epoch) = {
            let mut inner = self.inner.lock().await;
            inner.stop_requested = true;
            inner.attempts = 0;
            if let Some(timer) = inner.restart_timer.take() {
                timer.abort();
            }
            (inner.pid, inner.epoch)
        };
        self.ready_tx.send_replace(false);

        let Some(pid) = pid else {
            self.inner.lock().await.state = WorkerState::Stopped;
            return Ok(());
        };

        info!(pid, "stopping worker (SIGTERM)");
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid),
            nix::sys::signal::Signal::SIGTERM,
        );

        if !self.await_exit(epoch, self.settings.stop_grace).await {
            warn!(pid, "worker ignored SIGTERM, sending SIGKILL");
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGKILL,
            );
            self.await_exit(epoch, self.settings.stop_grace).await;
        }

        let mut inner = self.inner.lock().await;
        inner.state = WorkerState::Stopped;
        inner.pid = None;
        Ok(())
    }

    /// Wait until the exit of `epoch` has been observed.
    async fn await_exit(&self, epoch: u64, timeout: Duration) -> bool {
        let mut rx = self.exit_tx.subscribe();
        let deadline = Instant::now() + timeout;
        loop {
            if *rx.borrow() >= epoch {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if tokio::time::timeout(remaining, rx.changed()).await.is_err() {
                return false;
            }
        }
    }

    /// Stop-then-start; back-to-back restarts fully serialize.
    ///
    /// An explicit restart is an operator action: it resets the
    /// restart-attempt counter.
    pub async fn restart(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        let _restart = self.restart_lock.lock().await;
        self.stop().await?;
        {
            let mut inner = self.inner.lock().await;
            inner.stop_requested = false;
            inner.attempts = 0;
        }
        self.ensure_running(timeout).await
    }

    /// Stop the worker and keep it down for a maintenance window.
    ///
    /// Serializes with `restart` via the restart lock, which stays held
    /// for the guard's lifetime, and flips the maintenance flag so any
    /// concurrent `ensure_running` (proxy gate, admin start, backoff
    /// timer) fails fast instead of respawning mid-window.
    pub async fn begin_maintenance(self: &Arc<Self>) -> Result<MaintenanceGuard> {
        let restart = Arc::clone(&self.restart_lock).lock_owned().await;
        self.maintenance.store(true, Ordering::SeqCst);
        if let Err(e) = self.stop().await {
            self.maintenance.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(MaintenanceGuard {
            sup: Arc::clone(self),
            _restart: restart,
        })
    }

    /// Re-arm after an operator stop so `ensure_running` may spawn again.
    pub async fn clear_stop(&self) {
        let mut inner = self.inner.lock().await;
        inner.stop_requested = false;
        inner.attempts = 0;
    }

    // ── startup cleanup & diagnostics ────────────────────────────────

    /// Best-effort removal of orphaned prior instances: the PID lock
    /// file and any foreign process still bound to the target port.
    async fn cleanup_stale(&self) -> Result<()> {
        if let Some(conflict) = LockFile::new(self.settings.lock_path())
            .resolve_stale()
            .await?
        {
            info!(resolved = %conflict, "resolved worker lock conflict");
        }

        for pid in listeners_on_port(self.settings.target.port).await {
            if pid == std::process::id() as i32 {
                continue;
            }
            warn!(pid, port = self.settings.target.port, "killing process squatting on worker port");
            lock::terminate_pid(pid).await;
        }
        Ok(())
    }

    /// Run the worker's own `doctor` for a "why" snapshot, rate-limited
    /// so crash loops don't spawn diagnostic storms.
    async fn collect_diagnostics(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner
                .last_doctor
                .is_some_and(|at| at.elapsed() < DOCTOR_MIN_INTERVAL)
            {
                return;
            }
            inner.last_doctor = Some(Instant::now());
        }

        match run_worker_command(&self.settings.bin, &["doctor"], COMMAND_TIMEOUT).await {
            Ok(out) => {
                let mut report = out.stdout;
                if !out.stderr.is_empty() {
                    report.push_str(&out.stderr);
                }
                self.inner.lock().await.diagnostics = Some(report);
            }
            Err(e) => debug!(error = %e, "doctor diagnostic run failed"),
        }
    }
}

/// PIDs of processes listening on `port` (best-effort, via `lsof`).
async fn listeners_on_port(port: u16) -> Vec<i32> {
    let output = Command::new("lsof")
        .arg("-t")
        .arg(format!("-iTCP:{port}"))
        .arg("-sTCP:LISTEN")
        .output()
        .await;
    match output {
        Ok(out) => String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter_map(|l| l.trim().parse::<i32>().ok())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Forward worker log lines into our own tracing output.
async fn forward_worker_logs<R>(pipe: R, is_stderr: bool)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            warn!(source = "worker", "{line}");
        } else {
            debug!(source = "worker", "{line}");
        }
    }
}

fn describe_exit(exit: &ExitInfo) -> String {
    match (exit.code, exit.signal) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(sig)) => format!("terminated by signal {sig}"),
        (None, None) => "exit status unavailable".into(),
    }
}
