//! Gateway initialization and main run loop

use super::loader::load_config;
use super::state::AppState;
use anyhow::{Context, Result};
use axum::Extension;
use clawgate_core::{ArchiveLayout, AuthStore, Supervisor};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

/// Run the gateway
pub async fn run() -> Result<()> {
    let config = load_config().context("Failed to load configuration")?;
    info!("Configuration loaded");

    let admin_token = config.server.auth_token.as_deref();
    if admin_token.is_none() {
        warn!("authentication is DISABLED (server.auth_token unset); do not expose this listener");
    }
    let auth = Arc::new(AuthStore::new(admin_token));

    let worker_settings = config.worker.supervisor_settings(admin_token)?;
    let layout = ArchiveLayout::new(worker_settings.data_dir.clone());
    info!(
        bin = %worker_settings.bin.display(),
        target = %worker_settings.target,
        data_dir = %worker_settings.data_dir.display(),
        "worker configured"
    );

    let supervisor = Supervisor::new(worker_settings, config.worker.restart_settings());

    // Bring the worker up in the background; the proxy retries on
    // demand if this first attempt fails.
    {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move {
            let timeout = supervisor.settings().start_timeout;
            if let Err(e) = supervisor.ensure_running(timeout).await {
                warn!(error = %e, "initial worker start failed");
            }
        });
    }

    let state = Arc::new(AppState {
        supervisor: Arc::clone(&supervisor),
        layout,
        http: reqwest::Client::new(),
        backup_lock: Arc::new(tokio::sync::Mutex::new(())),
        config: config.clone(),
    });

    let app = axum::Router::new()
        .merge(crate::api::api_router())
        .merge(crate::websocket::websocket_router())
        .fallback(crate::proxy::forward)
        .layer(Extension(state))
        .layer(Extension(auth))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server host/port")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Clawgate listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down, stopping worker");
    supervisor.stop().await?;
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}
