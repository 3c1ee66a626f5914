//! Health check endpoints.
//!
//! Provides:
//! - `/health` - gateway liveness plus worker reachability (no secrets)
//! - `/health/detailed` - full supervisor snapshot (requires auth)

use axum::extract::Extension;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use clawgate_core::{probe_target, SupervisorStatus, WorkerState};
use serde::Serialize;
use std::sync::Arc;

use crate::middleware::auth::RequireAuthStrict;
use crate::server::AppState;

/// Simple health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub worker: WorkerState,
    pub worker_reachable: bool,
}

/// Detailed health response
#[derive(Debug, Serialize)]
pub struct DetailedHealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub worker: SupervisorStatus,
}

/// Create health check routes
pub fn health_routes() -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/detailed", get(detailed_health_check))
}

/// Liveness check. Reports configured state and backend reachability
/// but never diagnostics or exit details.
async fn health_check(Extension(state): Extension<Arc<AppState>>) -> Json<HealthResponse> {
    let status = state.supervisor.status().await;
    let reachable = probe_target(state.target()).await;
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        worker: status.state,
        worker_reachable: reachable,
    })
}

/// Full supervisor snapshot (requires valid credentials, never bypassed)
async fn detailed_health_check(
    _auth: RequireAuthStrict,
    Extension(state): Extension<Arc<AppState>>,
) -> Json<DetailedHealthResponse> {
    let worker = state.supervisor.status().await;
    let status = match worker.state {
        WorkerState::Ready => "healthy",
        WorkerState::Starting => "starting",
        WorkerState::Stopped => "stopped",
        WorkerState::Crashed => "unhealthy",
    };
    Json(DetailedHealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        worker,
    })
}
