//! Operator terminal over WebSocket
//!
//! One PTY-backed terminal per connection. The default Restricted mode
//! line-edits input in the gateway and only ever spawns allowlisted
//! worker commands; the opt-in FullAccess mode hands the connection to
//! an unrestricted shell. Credentials arrive via the `?token=` query
//! parameter since browsers cannot set custom WebSocket headers.

pub mod command;
pub mod session;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Extension, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use crate::middleware::auth::RequireAuthStrict;
use crate::server::AppState;

/// Terminal session mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalMode {
    /// Allowlisted worker commands plus supervisor pseudo-commands
    Restricted,
    /// Unrestricted shell; separate code path, opt-in via config
    FullAccess,
}

#[derive(Debug, Deserialize)]
pub struct TerminalQuery {
    /// "restricted" (default) or "full"
    #[serde(default)]
    mode: Option<String>,
}

/// WebSocket upgrade handler for the terminal
pub async fn terminal_handler(
    _auth: RequireAuthStrict,
    ws: WebSocketUpgrade,
    Query(query): Query<TerminalQuery>,
    Extension(state): Extension<Arc<AppState>>,
) -> Response {
    let mode = match query.mode.as_deref() {
        Some("full") => {
            if !state.config.terminal.allow_full_access {
                return (
                    StatusCode::FORBIDDEN,
                    "full-access terminal is disabled by configuration",
                )
                    .into_response();
            }
            TerminalMode::FullAccess
        }
        _ => TerminalMode::Restricted,
    };

    info!(?mode, "terminal session requested");
    ws.on_upgrade(move |socket| session::run(socket, state, mode))
}
