//! On-disk worker lock file
//!
//! The supervisor records the worker's PID in a lock file next to the
//! worker state directory. At startup the file is inspected: a dead
//! owner means a stale lock (deleted), a live owner means an orphaned
//! worker from a previous gateway run (killed, then the lock removed).
//! Lock conflicts are resolved automatically, never surfaced as fatal.

use crate::error::{Error, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// PID-recording lock file for the supervised worker.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Create a handle for the lock at `path`. Nothing is written yet.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the recorded owner PID, if the file exists and parses.
    pub fn owner(&self) -> Option<i32> {
        let raw = fs::read_to_string(&self.path).ok()?;
        raw.trim().parse::<i32>().ok()
    }

    /// Record `pid` as the current owner.
    pub fn acquire(&self, pid: u32) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, format!("{pid}\n"))?;
        Ok(())
    }

    /// Remove the lock file. Missing file is not an error.
    pub fn release(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve a stale or conflicting lock before spawning.
    ///
    /// Returns the conflict that was resolved, if any. A live recorded
    /// owner is terminated (SIGTERM, then SIGKILL if it lingers) before
    /// the lock is removed.
    pub async fn resolve_stale(&self) -> Result<Option<Error>> {
        let Some(pid) = self.owner() else {
            if self.path.exists() {
                // Unparseable content; treat as stale.
                warn!(path = %self.path.display(), "removing unreadable worker lock file");
                self.release()?;
            }
            return Ok(None);
        };

        if !pid_alive(pid) {
            info!(pid, "removing stale worker lock (owner no longer alive)");
            self.release()?;
            return Ok(Some(Error::LockConflict(format!(
                "stale lock owner {pid} removed"
            ))));
        }

        warn!(pid, "lock owned by a live orphaned worker; terminating it");
        terminate_pid(pid).await;
        self.release()?;
        Ok(Some(Error::LockConflict(format!(
            "orphaned worker {pid} killed and lock removed"
        ))))
    }
}

/// Whether a PID refers to a live process (signal 0 check).
#[must_use]
pub fn pid_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// SIGTERM the PID, give it a short grace window, SIGKILL if still alive.
pub async fn terminate_pid(pid: i32) {
    let target = Pid::from_raw(pid);
    let _ = kill(target, Signal::SIGTERM);
    for _ in 0..20 {
        if !pid_alive(pid) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    warn!(pid, "process ignored SIGTERM, sending SIGKILL");
    let _ = kill(target, Signal::SIGKILL);
    // Observe the exit rather than assuming the kill landed instantly.
    for _ in 0..20 {
        if !pid_alive(pid) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_lock_is_no_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let lock = LockFile::new(dir.path().join("worker.lock"));
        assert!(lock.resolve_stale().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_owner_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let lock = LockFile::new(dir.path().join("worker.lock"));

        // Spawn and reap a short-lived child so its PID is known-dead.
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap() as i32;
        child.wait().await.unwrap();

        lock.acquire(pid as u32).unwrap();
        let resolved = lock.resolve_stale().await.unwrap();
        assert!(matches!(resolved, Some(Error::LockConflict(_))));
        assert!(!lock.path().exists());
    }

    #[tokio::test]
    async fn test_acquire_release_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let lock = LockFile::new(dir.path().join("nested/worker.lock"));

        lock.acquire(4242).unwrap();
        assert_eq!(lock.owner(), Some(4242));

        lock.release().unwrap();
        assert_eq!(lock.owner(), None);
        // Double release is fine.
        lock.release().unwrap();
    }

    #[tokio::test]
    async fn test_garbage_content_treated_as_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.lock");
        fs::write(&path, "not-a-pid").unwrap();

        let lock = LockFile::new(&path);
        assert!(lock.resolve_stale().await.unwrap().is_none());
        assert!(!path.exists());
    }
}
