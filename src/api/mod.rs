//! Web API module for Clawgate
//!
//! Provides the administrative REST endpoints:
//! - Health reporting (gateway liveness + worker reachability)
//! - Worker lifecycle control (start/stop/restart/status)
//! - Backup export/import of the worker state

pub mod backup;
pub mod health;
pub mod worker;

use axum::Router;

pub use backup::backup_routes;
pub use health::health_routes;
pub use worker::worker_routes;

/// Create the API router with all endpoints
pub fn api_router() -> Router {
    Router::new()
        .merge(health_routes())
        .merge(worker_routes())
        .merge(backup_routes())
}
