//! Error types for clawgate-core
//!
//! The supervisor shares a single in-flight start attempt between any
//! number of concurrent callers, so the error type is `Clone`. Every
//! variant carries owned, cloneable payloads instead of source errors.

use thiserror::Error;

/// Core error type
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The OS failed to create the worker subprocess
    #[error("failed to spawn worker: {0}")]
    SpawnFailure(String),

    /// Worker process is alive but never became reachable within budget
    #[error("worker not reachable within {timeout_secs}s (process still running)")]
    ReadinessTimeout {
        /// Readiness budget that elapsed
        timeout_secs: u64,
    },

    /// Worker died outside an intentional stop
    #[error("worker exited unexpectedly: {0}")]
    UnexpectedExit(String),

    /// Auto-restart attempts exhausted; operator action required
    #[error("worker restart attempts exhausted after {attempts} tries")]
    RestartsExhausted {
        /// Consecutive failed attempts
        attempts: u32,
    },

    /// Stale lock owner detected (resolved automatically, not fatal)
    #[error("lock conflict: {0}")]
    LockConflict(String),

    /// Backend not ready at request time
    #[error("worker backend unreachable: {0}")]
    ProxyUnreachable(String),

    /// Terminal input failed the allowlist or contained unsafe characters
    #[error("command rejected: {0}")]
    CommandRejected(String),

    /// Import entry failed the path-safety check
    #[error("unsafe archive entry: {0}")]
    ArchiveEntryUnsafe(String),

    /// Archive upload exceeds the configured ceiling
    #[error("archive too large: {size} bytes (limit {limit})")]
    PayloadTooLarge {
        /// Observed payload size
        size: u64,
        /// Configured ceiling
        limit: u64,
    },

    /// Filesystem or subprocess I/O failure
    #[error("io error: {0}")]
    Io(String),

    /// Internal error (serialization, channel, etc.)
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the supervisor may retry this failure automatically.
    ///
    /// Security rejections and operator-level conditions are final;
    /// only process-level failures feed the restart policy.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ReadinessTimeout { .. } | Error::UnexpectedExit(_) | Error::SpawnFailure(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::UnexpectedExit("code 1".into()).is_transient());
        assert!(Error::ReadinessTimeout { timeout_secs: 30 }.is_transient());
        assert!(!Error::CommandRejected("contains ';'".into()).is_transient());
        assert!(!Error::ArchiveEntryUnsafe("../../etc/passwd".into()).is_transient());
        assert!(!Error::RestartsExhausted { attempts: 5 }.is_transient());
    }

    #[test]
    fn test_error_is_cloneable_for_shared_start() {
        let e = Error::SpawnFailure("no such file".into());
        let c = e.clone();
        assert_eq!(e.to_string(), c.to_string());
    }

    #[test]
    fn test_payload_too_large_message() {
        let e = Error::PayloadTooLarge {
            size: 300,
            limit: 100,
        };
        let msg = e.to_string();
        assert!(msg.contains("300"));
        assert!(msg.contains("100"));
    }
}
