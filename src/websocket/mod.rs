//! WebSocket module for Clawgate
//!
//! Provides the operator terminal endpoint:
//! - /ws/terminal - restricted (or opt-in full-access) PTY terminal

pub mod terminal;

pub use terminal::terminal_handler;

use axum::{routing::get, Router};

/// Create the WebSocket router
pub fn websocket_router() -> Router {
    Router::new().route("/ws/terminal", get(terminal_handler))
}
