//! Worker lifecycle control endpoints.
//!
//! All routes require authentication; they are thin wrappers over the
//! supervisor's operation set.

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use clawgate_core::SupervisorStatus;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::middleware::auth::RequireAuth;
use crate::server::AppState;

#[derive(Debug, Serialize)]
struct OperationResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn ok() -> Json<OperationResponse> {
    Json(OperationResponse {
        success: true,
        error: None,
    })
}

fn failed(err: impl std::fmt::Display) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(OperationResponse {
            success: false,
            error: Some(err.to_string()),
        }),
    )
        .into_response()
}

/// Create worker control routes
pub fn worker_routes() -> Router {
    Router::new()
        .route("/api/worker/status", get(status))
        .route("/api/worker/start", post(start))
        .route("/api/worker/stop", post(stop))
        .route("/api/worker/restart", post(restart))
}

async fn status(
    _auth: RequireAuth,
    Extension(state): Extension<Arc<AppState>>,
) -> Json<SupervisorStatus> {
    Json(state.supervisor.status().await)
}

async fn start(_auth: RequireAuth, Extension(state): Extension<Arc<AppState>>) -> Response {
    info!("worker start requested via API");
    state.supervisor.clear_stop().await;
    let timeout = state.supervisor.settings().start_timeout;
    match state.supervisor.ensure_running(timeout).await {
        Ok(()) => ok().into_response(),
        Err(e) => failed(e),
    }
}

async fn stop(_auth: RequireAuth, Extension(state): Extension<Arc<AppState>>) -> Response {
    info!("worker stop requested via API");
    match state.supervisor.stop().await {
        Ok(()) => ok().into_response(),
        Err(e) => failed(e),
    }
}

async fn restart(_auth: RequireAuth, Extension(state): Extension<Arc<AppState>>) -> Response {
    info!("worker restart requested via API");
    let timeout = state.supervisor.settings().start_timeout;
    match state.supervisor.restart(timeout).await {
        Ok(()) => ok().into_response(),
        Err(e) => failed(e),
    }
}
