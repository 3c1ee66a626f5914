//! Edge proxy: forwards everything outside the administrative surface
//! to the worker, gated on readiness.
//!
//! HTTP requests and WebSocket upgrades share the same gate: if the
//! worker is not ready, one `ensure_running` attempt is made and the
//! request only proceeds on success. Failures surface as structured
//! 502/503 responses instead of hanging sockets.

use axum::body::Body;
use axum::extract::ws::{Message as ClientMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, Request};
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use clawgate_core::Error;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message as BackendMessage;
use tracing::{debug, warn};

use crate::server::AppState;

/// Prefix under which the worker serves its single-page control app.
/// Asset requests below it are rewritten to the root so the worker's
/// static handler serves them instead of the SPA fallback.
const SPA_PREFIX: &str = "/app";

/// File extensions treated as static assets for the rewrite.
const STATIC_EXTENSIONS: &[&str] = &[
    "js", "mjs", "css", "map", "png", "jpg", "jpeg", "gif", "svg", "ico", "woff", "woff2", "ttf",
    "json", "webmanifest", "wasm", "txt",
];

/// Hop-by-hop headers, stripped in both directions.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
];

#[derive(Debug, Serialize)]
struct ProxyError {
    success: bool,
    error: String,
    hint: String,
}

fn not_ready_response(state: &AppState, err: &Error) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ProxyError {
            success: false,
            error: format!("worker is not ready: {err}"),
            hint: format!(
                "check `clawgate doctor`, the worker logs, and that {} is reachable",
                state.target()
            ),
        }),
    )
        .into_response()
}

fn unreachable_response(err: impl std::fmt::Display) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(ProxyError {
            success: false,
            error: Error::ProxyUnreachable(err.to_string()).to_string(),
            hint: "the worker accepted the readiness probe but dropped this request".into(),
        }),
    )
        .into_response()
}

/// Fallback handler: everything not matched by the admin surface.
pub async fn forward(
    Extension(state): Extension<Arc<AppState>>,
    ws: Option<WebSocketUpgrade>,
    req: Request,
) -> Response {
    // Readiness gate. One start attempt, then a clean failure; a
    // request must never wait on a dead backend.
    if !state.supervisor.is_ready() {
        let timeout = state.supervisor.settings().start_timeout;
        if let Err(e) = state.supervisor.ensure_running(timeout).await {
            return not_ready_response(&state, &e);
        }
    }

    let path_and_query = rewrite_asset_path(
        req.uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/"),
    );

    match ws {
        Some(upgrade) => forward_websocket(state, upgrade, path_and_query),
        None => forward_http(state, req, path_and_query).await,
    }
}

/// Strip the SPA prefix from asset requests so the worker's static
/// handler (not its SPA fallback) serves them.
fn rewrite_asset_path(path_and_query: &str) -> String {
    let (path, query) = match path_and_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_and_query, None),
    };

    let rewritten = match path.strip_prefix(SPA_PREFIX) {
        Some(rest) if rest.starts_with('/') && is_static_asset(rest) => rest,
        _ => path,
    };

    match query {
        Some(q) => format!("{rewritten}?{q}"),
        None => rewritten.to_string(),
    }
}

fn is_static_asset(path: &str) -> bool {
    let last_segment = path.rsplit('/').next().unwrap_or("");
    match last_segment.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            STATIC_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
        }
        _ => false,
    }
}

// ── HTTP forwarding ─────────────────────────────────────────────────

async fn forward_http(state: Arc<AppState>, req: Request, path_and_query: String) -> Response {
    let url = format!("http://{}{path_and_query}", state.target());
    let method = req.method().clone();
    let headers = filter_headers(req.headers());

    let mut upstream = state
        .http
        .request(method, &url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(
            req.into_body().into_data_stream(),
        ));
    // Let the worker know who it is speaking through.
    upstream = upstream.header("x-forwarded-by", "clawgate");

    let resp = match upstream.send().await {
        Ok(r) => r,
        Err(e) => {
            warn!(url, error = %e, "proxied request failed");
            return unreachable_response(e);
        }
    };

    let status = resp.status();
    let mut builder = Response::builder().status(status);
    if let Some(resp_headers) = builder.headers_mut() {
        *resp_headers = filter_headers(resp.headers());
    }
    builder
        .body(Body::from_stream(resp.bytes_stream()))
        .unwrap_or_else(|e| unreachable_response(e))
}

fn filter_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        if let Ok(name) = HeaderName::from_bytes(name.as_str().as_bytes()) {
            out.append(name, value.clone());
        }
    }
    out
}

// ── WebSocket forwarding ────────────────────────────────────────────

fn forward_websocket(state: Arc<AppState>, upgrade: WebSocketUpgrade, path_and_query: String) -> Response {
    let backend_url = format!("ws://{}{path_and_query}", state.target());
    upgrade.on_upgrade(move |client| async move {
        let backend = match tokio_tungstenite::connect_async(&backend_url).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                // Closing promptly beats leaving the client hanging on
                // a socket that will never speak.
                warn!(url = backend_url, error = %e, "backend WebSocket connect failed");
                let _ = close_client(client).await;
                return;
            }
        };
        bridge(client, backend).await;
    })
}

async fn close_client(mut client: WebSocket) -> Result<(), axum::Error> {
    client
        .send(ClientMessage::Close(Some(axum::extract::ws::CloseFrame {
            code: 1011,
            reason: "backend unreachable".into(),
        })))
        .await
}

/// Bidirectional copy between the client socket and the backend socket.
async fn bridge(
    client: WebSocket,
    backend: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut backend_tx, mut backend_rx) = backend.split();

    loop {
        tokio::select! {
            msg = client_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                let Some(msg) = client_to_backend(msg) else { break };
                if backend_tx.send(msg).await.is_err() {
                    break;
                }
            }
            msg = backend_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                let Some(msg) = backend_to_client(msg) else { break };
                if client_tx.send(msg).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("WebSocket bridge closed");
    let _ = backend_tx.close().await;
    let _ = client_tx.close().await;
}

fn client_to_backend(msg: ClientMessage) -> Option<BackendMessage> {
    match msg {
        ClientMessage::Text(t) => Some(BackendMessage::Text(t)),
        ClientMessage::Binary(b) => Some(BackendMessage::Binary(b)),
        ClientMessage::Ping(p) => Some(BackendMessage::Ping(p)),
        ClientMessage::Pong(p) => Some(BackendMessage::Pong(p)),
        ClientMessage::Close(_) => None,
    }
}

fn backend_to_client(msg: BackendMessage) -> Option<ClientMessage> {
    match msg {
        BackendMessage::Text(t) => Some(ClientMessage::Text(t)),
        BackendMessage::Binary(b) => Some(ClientMessage::Binary(b)),
        BackendMessage::Ping(p) => Some(ClientMessage::Ping(p)),
        BackendMessage::Pong(p) => Some(ClientMessage::Pong(p)),
        BackendMessage::Close(_) => None,
        BackendMessage::Frame(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_paths_under_prefix_are_rewritten() {
        assert_eq!(rewrite_asset_path("/app/assets/index.js"), "/assets/index.js");
        assert_eq!(rewrite_asset_path("/app/favicon.ico"), "/favicon.ico");
        assert_eq!(
            rewrite_asset_path("/app/static/chunk.css?v=3"),
            "/static/chunk.css?v=3"
        );
    }

    #[test]
    fn test_non_asset_paths_are_untouched() {
        // SPA routes (no extension) must keep hitting the SPA fallback.
        assert_eq!(rewrite_asset_path("/app/settings"), "/app/settings");
        assert_eq!(rewrite_asset_path("/app"), "/app");
        // Other prefixes are never rewritten.
        assert_eq!(rewrite_asset_path("/api/v1/data.json"), "/api/v1/data.json");
        assert_eq!(rewrite_asset_path("/"), "/");
    }

    #[test]
    fn test_hidden_files_are_not_assets() {
        // ".env" style names have an empty stem; not an asset.
        assert!(!is_static_asset("/.json"));
        assert!(is_static_asset("/manifest.json"));
        assert!(!is_static_asset("/no-extension"));
    }
}
