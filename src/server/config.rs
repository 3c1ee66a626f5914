//! Gateway configuration types

use anyhow::{anyhow, Result};
use clawgate_core::{ProxyTarget, RestartSettings, WorkerSettings};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
}

/// Public listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Admin token for the API, terminal and backup surfaces.
    /// Unset disables authentication (local development only).
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// Supervised worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker binary (name resolved via PATH, or an absolute path)
    #[serde(default = "default_worker_bin")]
    pub bin: String,
    /// Loopback address the worker is told to bind
    #[serde(default = "default_worker_host")]
    pub host: String,
    /// Internal port the worker is told to bind
    #[serde(default = "default_worker_port")]
    pub port: u16,
    /// Worker state directory; defaults to ~/.openclaw
    #[serde(default)]
    pub data_dir: Option<String>,
    /// Token handed to the worker's `--auth token` mode
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
    #[serde(default)]
    pub restart: RestartConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            bin: default_worker_bin(),
            host: default_worker_host(),
            port: default_worker_port(),
            data_dir: None,
            auth_token: None,
            start_timeout_secs: default_start_timeout(),
            probe_interval_ms: default_probe_interval(),
            stop_grace_secs: default_stop_grace(),
            restart: RestartConfig::default(),
        }
    }
}

fn default_worker_bin() -> String {
    "openclaw".to_string()
}
fn default_worker_host() -> String {
    "127.0.0.1".to_string()
}
fn default_worker_port() -> u16 {
    18789
}
fn default_start_timeout() -> u64 {
    30
}
fn default_probe_interval() -> u64 {
    500
}
fn default_stop_grace() -> u64 {
    10
}

/// Exponential-backoff restart configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_base_delay() -> u64 {
    1
}
fn default_max_delay() -> u64 {
    60
}
fn default_max_attempts() -> u32 {
    5
}

/// Terminal channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    /// Allow the unrestricted full-shell mode
    #[serde(default)]
    pub allow_full_access: bool,
    /// Shell used by full-access sessions
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            allow_full_access: false,
            shell: default_shell(),
        }
    }
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

impl WorkerConfig {
    /// Resolved worker state directory.
    pub fn data_path(&self) -> PathBuf {
        self.data_dir
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".openclaw")))
            .unwrap_or_else(|| PathBuf::from(".openclaw"))
    }

    /// Internal (host, port) pair the worker binds.
    pub fn target(&self) -> ProxyTarget {
        let host: IpAddr = self
            .host
            .parse()
            .unwrap_or_else(|_| IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
        ProxyTarget::new(host, self.port)
    }

    /// Build the supervisor's worker settings. The worker token falls
    /// back to the gateway admin token so the proxy can authenticate.
    pub fn supervisor_settings(&self, admin_token: Option<&str>) -> Result<WorkerSettings> {
        let auth_token = self
            .auth_token
            .clone()
            .or_else(|| admin_token.map(str::to_string))
            .ok_or_else(|| {
                anyhow!("no worker auth token configured (worker.auth_token or server.auth_token)")
            })?;
        Ok(WorkerSettings {
            bin: PathBuf::from(&self.bin),
            target: self.target(),
            auth_token,
            data_dir: self.data_path(),
            start_timeout: Duration::from_secs(self.start_timeout_secs),
            probe_interval: Duration::from_millis(self.probe_interval_ms),
            stop_grace: Duration::from_secs(self.stop_grace_secs),
        })
    }

    /// Restart policy from the configured backoff parameters.
    pub fn restart_settings(&self) -> RestartSettings {
        RestartSettings {
            base_delay: Duration::from_secs(self.restart.base_delay_secs),
            max_delay: Duration::from_secs(self.restart.max_delay_secs),
            max_attempts: self.restart.max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_into_usable_settings() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.target().port, 18789);
        assert!(cfg.target().host.is_loopback());

        let settings = cfg.supervisor_settings(Some("admin-token")).unwrap();
        assert_eq!(settings.auth_token, "admin-token");
        assert_eq!(settings.stop_grace, Duration::from_secs(10));
    }

    #[test]
    fn missing_tokens_is_an_error() {
        let cfg = WorkerConfig::default();
        assert!(cfg.supervisor_settings(None).is_err());
    }

    #[test]
    fn worker_token_wins_over_admin_token() {
        let cfg = WorkerConfig {
            auth_token: Some("worker-token".into()),
            ..WorkerConfig::default()
        };
        let settings = cfg.supervisor_settings(Some("admin-token")).unwrap();
        assert_eq!(settings.auth_token, "worker-token");
    }
}
