//! Backup endpoints: archive export and import of the worker state.
//!
//! Export streams a gzipped tarball of the worker data directory.
//! Import stops the worker, replaces the data directory from the
//! uploaded archive, and starts the worker again. Both hold the backup
//! lock so they never run concurrently with each other.

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use clawgate_core::archive::IMPORT_SIZE_LIMIT;
use clawgate_core::{export_archive, import_archive, Error, ImportReport};
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::middleware::auth::RequireAuthStrict;
use crate::server::AppState;

#[derive(Debug, Serialize)]
struct BackupError {
    success: bool,
    error: String,
}

fn error_response(status: StatusCode, err: impl std::fmt::Display) -> Response {
    (
        status,
        Json(BackupError {
            success: false,
            error: err.to_string(),
        }),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct ImportResponse {
    success: bool,
    report: ImportReport,
    worker_restarted: bool,
}

/// Create backup routes
pub fn backup_routes() -> Router {
    Router::new()
        .route("/api/backup/export", get(export))
        .route("/api/backup/import", post(import))
        // The core applies its own ceiling as well; this keeps axum from
        // rejecting the upload before it gets there.
        .layer(DefaultBodyLimit::max(IMPORT_SIZE_LIMIT as usize + 1024))
}

/// Stream the worker data directory as a tar.gz download.
async fn export(
    _auth: RequireAuthStrict,
    Extension(state): Extension<Arc<AppState>>,
) -> Response {
    let guard = match Arc::clone(&state.backup_lock).try_lock_owned() {
        Ok(g) => g,
        Err(_) => {
            return error_response(
                StatusCode::CONFLICT,
                "another backup operation is in progress",
            )
        }
    };

    let reader = match export_archive(&state.layout) {
        Ok(r) => r,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    };
    info!("backup export started");

    // The lock guard rides along with the stream so the export stays
    // exclusive until the last chunk is sent.
    let stream = ReaderStream::new(reader).map(move |chunk| {
        let _guard = &guard;
        chunk
    });

    (
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!(
                    "attachment; filename=\"{}\"",
                    state.layout.export_filename()
                ),
            ),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

/// Replace the worker state from an uploaded tar.gz archive.
async fn import(
    _auth: RequireAuthStrict,
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> Response {
    let _guard = match state.backup_lock.try_lock() {
        Ok(g) => g,
        Err(_) => {
            return error_response(
                StatusCode::CONFLICT,
                "another backup operation is in progress",
            )
        }
    };

    info!(size = body.len(), "backup import started, stopping worker");
    // The guard keeps the worker down for the whole stop/extract/swap
    // window; a proxied request or admin start cannot respawn it over
    // a half-replaced data dir.
    let maintenance = match state.supervisor.begin_maintenance().await {
        Ok(g) => g,
        Err(e) => return error_response(StatusCode::BAD_GATEWAY, e),
    };

    let report = match import_archive(&state.layout, body.as_ref()).await {
        Ok(r) => r,
        Err(e @ Error::PayloadTooLarge { .. }) => {
            drop(maintenance);
            restart_after_import(&state).await;
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, e);
        }
        Err(e) => {
            // Restoring the worker still makes sense; the old state is
            // intact because the swap is all-or-nothing.
            warn!(error = %e, "backup import failed");
            drop(maintenance);
            restart_after_import(&state).await;
            return error_response(StatusCode::BAD_REQUEST, e);
        }
    };

    drop(maintenance);
    let worker_restarted = restart_after_import(&state).await;
    Json(ImportResponse {
        success: true,
        report,
        worker_restarted,
    })
    .into_response()
}

async fn restart_after_import(state: &Arc<AppState>) -> bool {
    state.supervisor.clear_stop().await;
    let timeout = state.supervisor.settings().start_timeout;
    match state.supervisor.ensure_running(timeout).await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "worker did not come back after import");
            false
        }
    }
}
