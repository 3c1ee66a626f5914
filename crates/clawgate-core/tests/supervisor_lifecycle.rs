//! End-to-end supervisor tests against fake worker scripts.
//!
//! Each test writes a small shell script standing in for the worker
//! binary. Scripts that need to look "ready" either bind the target
//! port themselves (via a tiny TCP helper) or rely on the test holding
//! a listener open on the probed port.

use clawgate_core::supervisor::{RestartSettings, Supervisor, WorkerSettings};
use clawgate_core::{probe_target, ProxyTarget, WorkerState};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn settings(bin: PathBuf, data_dir: PathBuf, port: u16) -> WorkerSettings {
    WorkerSettings {
        bin,
        target: ProxyTarget::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
        auth_token: "test-token".into(),
        data_dir,
        start_timeout: Duration::from_secs(3),
        probe_interval: Duration::from_millis(50),
        stop_grace: Duration::from_secs(2),
    }
}

fn fast_restarts() -> RestartSettings {
    RestartSettings {
        base_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
        max_attempts: 3,
    }
}

/// Reserve a loopback port that is currently closed.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Spawn-count lines in `path`, or 0 while the script has not written yet.
fn spawn_count(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

/// Readiness can come from a listener the test holds, so the
/// supervisor may report Ready before the script's `echo` has run.
/// Poll until at least `want` spawns are recorded (or `timeout`).
async fn wait_for_spawns(path: &Path, want: usize, timeout: Duration) -> usize {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let n = spawn_count(path);
        if n >= want || std::time::Instant::now() >= deadline {
            return n;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn ensure_running_reaches_ready_when_listener_appears() {
    let dir = tempfile::tempdir().unwrap();
    // The script sleeps; readiness comes from a listener the test holds
    // open on the probed port, standing in for the worker's own bind.
    let bin = write_script(dir.path(), "worker", "sleep 30");
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let sup = Supervisor::new(
        settings(bin, dir.path().join("state"), port),
        fast_restarts(),
    );

    sup.ensure_running(Duration::from_secs(3)).await.unwrap();
    assert!(sup.is_ready());
    let status = sup.status().await;
    assert_eq!(status.state, WorkerState::Ready);
    assert!(status.pid.is_some());

    sup.stop().await.unwrap();
    assert!(!sup.is_ready());
    assert_eq!(sup.status().await.state, WorkerState::Stopped);
    drop(listener);
}

#[tokio::test]
async fn concurrent_ensure_running_spawns_once() {
    let dir = tempfile::tempdir().unwrap();
    // Every spawn appends a line; one line at the end proves a single spawn.
    let count_file = dir.path().join("spawns");
    let bin = write_script(
        dir.path(),
        "worker",
        &format!(
            "[ \"$1\" = gateway ] || exit 0\necho spawned >> {}\nsleep 30",
            count_file.display()
        ),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let sup = Supervisor::new(
        settings(bin, dir.path().join("state"), port),
        fast_restarts(),
    );

    let calls: Vec<_> = (0..8)
        .map(|_| {
            let sup = Arc::clone(&sup);
            tokio::spawn(async move { sup.ensure_running(Duration::from_secs(3)).await })
        })
        .collect();
    for call in calls {
        call.await.unwrap().unwrap();
    }

    wait_for_spawns(&count_file, 1, Duration::from_secs(2)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(spawn_count(&count_file), 1);

    sup.stop().await.unwrap();
    drop(listener);
}

#[tokio::test]
async fn clean_exit_is_not_restarted() {
    let dir = tempfile::tempdir().unwrap();
    let count_file = dir.path().join("spawns");
    let bin = write_script(
        dir.path(),
        "worker",
        &format!(
            "[ \"$1\" = gateway ] || exit 0\necho spawned >> {}\nexit 0",
            count_file.display()
        ),
    );
    let port = free_port().await;

    let sup = Supervisor::new(
        settings(bin, dir.path().join("state"), port),
        fast_restarts(),
    );

    // No listener ever appears, so the start reports a failure; the
    // point is what happens afterwards.
    let _ = sup.ensure_running(Duration::from_secs(1)).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    let spawns = std::fs::read_to_string(&count_file).unwrap();
    assert_eq!(spawns.lines().count(), 1, "clean exit must not trigger restarts");
    assert_eq!(sup.status().await.state, WorkerState::Stopped);
}

#[tokio::test]
async fn crash_is_retried_then_gives_up() {
    let dir = tempfile::tempdir().unwrap();
    let count_file = dir.path().join("spawns");
    let bin = write_script(
        dir.path(),
        "worker",
        &format!(
            "[ \"$1\" = gateway ] || exit 0\necho spawned >> {}\nexit 3",
            count_file.display()
        ),
    );
    let port = free_port().await;

    let sup = Supervisor::new(
        settings(bin, dir.path().join("state"), port),
        fast_restarts(),
    );

    let result = sup.ensure_running(Duration::from_secs(2)).await;
    assert!(result.is_err());

    // base 50ms doubling, 3 attempts: everything settles well within this.
    tokio::time::sleep(Duration::from_secs(3)).await;

    let spawns = std::fs::read_to_string(&count_file).unwrap();
    let n = spawns.lines().count();
    assert!(n > 1, "crash must be retried, saw {n} spawn(s)");
    assert!(
        n <= 1 + 3,
        "retries must stop at the attempt budget, saw {n} spawns"
    );

    let status = sup.status().await;
    assert!(!status.ready);
    assert!(status.last_exit.is_some());
}

#[tokio::test]
async fn startup_crash_is_retried_between_probes() {
    let dir = tempfile::tempdir().unwrap();
    let count_file = dir.path().join("spawns");
    // The crash lands while ensure_running is asleep between probes,
    // with the backoff delay far shorter than the probe interval; the
    // retry must come from a fresh attempt, not the doomed one.
    let bin = write_script(
        dir.path(),
        "worker",
        &format!(
            "[ \"$1\" = gateway ] || exit 0\necho spawned >> {}\nsleep 0.2\nexit 3",
            count_file.display()
        ),
    );
    let port = free_port().await;

    let mut cfg = settings(bin, dir.path().join("state"), port);
    cfg.probe_interval = Duration::from_secs(1);
    let sup = Supervisor::new(cfg, fast_restarts());

    let result = sup.ensure_running(Duration::from_secs(2)).await;
    assert!(result.is_err());

    let n = wait_for_spawns(&count_file, 2, Duration::from_secs(8)).await;
    assert!(n > 1, "crash during startup must be retried, saw {n} spawn(s)");
    assert!(n <= 1 + 3, "retries must stop at the attempt budget, saw {n}");
}

#[tokio::test]
async fn stop_is_sticky_until_cleared() {
    let dir = tempfile::tempdir().unwrap();
    let count_file = dir.path().join("spawns");
    let bin = write_script(
        dir.path(),
        "worker",
        &format!(
            "[ \"$1\" = gateway ] || exit 0\necho spawned >> {}\nsleep 30",
            count_file.display()
        ),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let sup = Supervisor::new(
        settings(bin, dir.path().join("state"), port),
        fast_restarts(),
    );
    sup.ensure_running(Duration::from_secs(3)).await.unwrap();
    wait_for_spawns(&count_file, 1, Duration::from_secs(2)).await;
    sup.stop().await.unwrap();

    // A plain ensure_running (the proxy gate's path) must not undo an
    // operator stop.
    assert!(sup.ensure_running(Duration::from_secs(1)).await.is_err());
    assert!(sup.status().await.pid.is_none());
    assert_eq!(spawn_count(&count_file), 1);

    sup.clear_stop().await;
    sup.ensure_running(Duration::from_secs(3)).await.unwrap();
    wait_for_spawns(&count_file, 2, Duration::from_secs(2)).await;
    assert_eq!(spawn_count(&count_file), 2);

    sup.stop().await.unwrap();
    drop(listener);
}

#[tokio::test]
async fn maintenance_window_blocks_concurrent_starts() {
    let dir = tempfile::tempdir().unwrap();
    let count_file = dir.path().join("spawns");
    let bin = write_script(
        dir.path(),
        "worker",
        &format!(
            "[ \"$1\" = gateway ] || exit 0\necho spawned >> {}\nsleep 30",
            count_file.display()
        ),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let sup = Supervisor::new(
        settings(bin, dir.path().join("state"), port),
        fast_restarts(),
    );
    sup.ensure_running(Duration::from_secs(3)).await.unwrap();
    wait_for_spawns(&count_file, 1, Duration::from_secs(2)).await;

    let guard = sup.begin_maintenance().await.unwrap();
    assert_eq!(sup.status().await.state, WorkerState::Stopped);

    // The import window: nothing may bring the worker back while the
    // guard is held.
    let err = sup.ensure_running(Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, clawgate_core::Error::LockConflict(_)));
    assert!(sup.status().await.pid.is_none());
    assert_eq!(spawn_count(&count_file), 1);

    drop(guard);
    sup.clear_stop().await;
    sup.ensure_running(Duration::from_secs(3)).await.unwrap();
    wait_for_spawns(&count_file, 2, Duration::from_secs(2)).await;
    assert_eq!(spawn_count(&count_file), 2);

    sup.stop().await.unwrap();
    drop(listener);
}

#[tokio::test]
async fn stop_terminates_a_term_ignoring_worker() {
    let dir = tempfile::tempdir().unwrap();
    // Trap and ignore SIGTERM so stop has to escalate to SIGKILL.
    let bin = write_script(dir.path(), "worker", "trap '' TERM\nsleep 60");
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut cfg = settings(bin, dir.path().join("state"), port);
    cfg.stop_grace = Duration::from_millis(300);
    let sup = Supervisor::new(cfg, fast_restarts());

    sup.ensure_running(Duration::from_secs(3)).await.unwrap();
    let pid = sup.status().await.pid.unwrap();

    sup.stop().await.unwrap();
    // Give the kernel a beat to reap.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!clawgate_core::lock::pid_alive(pid));
    assert_eq!(sup.status().await.state, WorkerState::Stopped);
    drop(listener);
}

#[tokio::test]
async fn back_to_back_restarts_serialize() {
    let dir = tempfile::tempdir().unwrap();
    let count_file = dir.path().join("spawns");
    let bin = write_script(
        dir.path(),
        "worker",
        &format!(
            "[ \"$1\" = gateway ] || exit 0\necho spawned >> {}\nsleep 30",
            count_file.display()
        ),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let sup = Supervisor::new(
        settings(bin, dir.path().join("state"), port),
        fast_restarts(),
    );
    sup.ensure_running(Duration::from_secs(3)).await.unwrap();

    let a = {
        let sup = Arc::clone(&sup);
        tokio::spawn(async move { sup.restart(Duration::from_secs(3)).await })
    };
    let b = {
        let sup = Arc::clone(&sup);
        tokio::spawn(async move { sup.restart(Duration::from_secs(3)).await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    assert!(sup.is_ready());
    // Initial spawn plus one spawn per restart.
    wait_for_spawns(&count_file, 3, Duration::from_secs(2)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(spawn_count(&count_file), 3);

    sup.stop().await.unwrap();
    drop(listener);
}

#[tokio::test]
async fn probe_reports_closed_port_until_listener_exists() {
    let port = free_port().await;
    let target = ProxyTarget::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
    assert!(!probe_target(target).await);

    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    assert!(probe_target(target).await);
    drop(listener);
}
