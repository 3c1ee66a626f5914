//! Shared application state

use super::config::AppConfig;
use clawgate_core::{ArchiveLayout, ProxyTarget, Supervisor};
use std::sync::Arc;

/// State shared by every handler via an `Extension` layer. The
/// `AuthStore` travels in its own extension, consumed by the auth
/// extractors.
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub layout: ArchiveLayout,
    /// Upstream HTTP client, reused across proxied requests.
    pub http: reqwest::Client,
    /// Serializes backup export/import against each other.
    pub backup_lock: Arc<tokio::sync::Mutex<()>>,
    pub config: AppConfig,
}

impl AppState {
    /// Internal address proxied traffic is forwarded to.
    pub fn target(&self) -> ProxyTarget {
        self.supervisor.settings().target
    }
}
