//! Clawgate Core - Worker Supervision Engine
//!
//! This crate provides the supervision logic for the clawgate edge
//! gateway, including:
//! - Supervisor: worker subprocess lifecycle with readiness gating and
//!   exponential-backoff crash recovery
//! - Probe: bare TCP readiness checks against the worker's listener
//! - Archive: streaming tar.gz export/import of the worker state with
//!   path-safety filtering on restore
//! - Worker: bounded one-shot invocations of the worker's own CLI
//! - Auth: admin token storage with constant-time validation
//! - Redact: secret masking for any worker output surfaced upward

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod archive;
pub mod auth;
pub mod error;
pub mod lock;
pub mod probe;
pub mod redact;
pub mod supervisor;
pub mod worker;

pub use archive::{export_archive, import_archive, ArchiveLayout, ImportReport};
pub use auth::{AuthError, AuthStore};
pub use error::{Error, Result};
pub use lock::LockFile;
pub use probe::{probe_target, ProxyTarget, PROBE_TIMEOUT};
pub use supervisor::{
    ExitInfo, MaintenanceGuard, RestartSettings, Supervisor, SupervisorStatus, WorkerSettings,
    WorkerState,
};
pub use worker::{run_worker_command, CommandOutput};
