//! TCP readiness probing
//!
//! A bare connect-and-disconnect against the worker's internal listener.
//! No application-level handshake is attempted: an open listener counts
//! as ready. This can report ready slightly before the application
//! layer is actually serving requests.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::trace;

/// Probe timeout (connect must succeed within this budget)
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(750);

/// The internal (host, port) pair the worker is expected to bind.
///
/// Known at configuration time, never discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyTarget {
    /// Loopback address the worker binds
    pub host: std::net::IpAddr,
    /// Port the worker binds
    pub port: u16,
}

impl ProxyTarget {
    /// Build a target from configured host/port.
    #[must_use]
    pub fn new(host: std::net::IpAddr, port: u16) -> Self {
        Self { host, port }
    }

    /// Socket address form.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl std::fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Probe the target once. True iff a TCP connection was accepted
/// within [`PROBE_TIMEOUT`]; the connection is dropped immediately.
pub async fn probe_target(target: ProxyTarget) -> bool {
    match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(target.addr())).await {
        Ok(Ok(_stream)) => {
            trace!(%target, "readiness probe succeeded");
            true
        }
        Ok(Err(e)) => {
            trace!(%target, error = %e, "readiness probe refused");
            false
        }
        Err(_) => {
            trace!(%target, "readiness probe timed out");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_probe_succeeds_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let target = ProxyTarget::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);

        assert!(probe_target(target).await);
    }

    #[tokio::test]
    async fn test_probe_fails_against_closed_port() {
        // Bind then drop to get a port that is very likely closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = ProxyTarget::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        assert!(!probe_target(target).await);
    }

    #[test]
    fn test_target_display() {
        let target = ProxyTarget::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8442);
        assert_eq!(target.to_string(), "127.0.0.1:8442");
    }
}
