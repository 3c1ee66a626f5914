//! Authentication middleware for Axum
//!
//! Extracts Bearer tokens or API keys from requests and validates them
//! against the AuthStore. Provides `RequireAuth` extractor for handlers.

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use clawgate_core::auth::{AuthError, AuthStore};
use serde::Serialize;
use std::sync::Arc;

/// JSON error response for auth failures
#[derive(Debug, Serialize)]
struct AuthErrorResponse {
    success: bool,
    error: String,
    code: String,
}

impl AuthErrorResponse {
    fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            code: code.into(),
        }
    }
}

/// Auth rejection type
pub struct AuthRejection {
    status: StatusCode,
    body: AuthErrorResponse,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<AuthError> for AuthRejection {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingCredentials => AuthRejection {
                status: StatusCode::UNAUTHORIZED,
                body: AuthErrorResponse::new(
                    "Authentication required. Provide Authorization: Bearer <token> or X-API-Key header.",
                    "UNAUTHORIZED",
                ),
            },
            AuthError::InvalidCredentials => AuthRejection {
                status: StatusCode::UNAUTHORIZED,
                body: AuthErrorResponse::new("Invalid token or API key", "INVALID_CREDENTIALS"),
            },
            AuthError::Internal(msg) => AuthRejection {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: AuthErrorResponse::new(msg, "INTERNAL_ERROR"),
            },
        }
    }
}

// ============================================================================
// RequireAuth Extractor
// ============================================================================

/// Axum extractor that requires authentication.
///
/// Extracts the token from:
/// 1. `Authorization: Bearer <token>` header
/// 2. `X-API-Key: <key>` header
/// 3. `?token=<token>` query parameter (for WebSocket connections)
pub struct RequireAuth;

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for RequireAuth
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        let auth_store = parts
            .extensions
            .get::<Arc<AuthStore>>()
            .ok_or_else(|| AuthError::Internal("AuthStore not configured".to_string()))?;

        // If auth is disabled, every request passes.
        if !auth_store.is_enabled() {
            return Ok(RequireAuth);
        }

        let token = extract_token(parts)?;
        auth_store.validate_token(&token)?;
        Ok(RequireAuth)
    }
}

/// Extract token from request headers or query params
fn extract_token(parts: &Parts) -> std::result::Result<String, AuthError> {
    // 1. Authorization: Bearer <token>
    if let Some(auth_header) = parts.headers.get("authorization") {
        if let Ok(value) = auth_header.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Ok(token.trim().to_string());
            }
        }
    }

    // 2. X-API-Key header
    if let Some(api_key_header) = parts.headers.get("x-api-key") {
        if let Ok(value) = api_key_header.to_str() {
            return Ok(value.trim().to_string());
        }
    }

    // 3. ?token= query parameter (for WebSocket upgrades)
    if let Some(query) = parts.uri.query() {
        for param in query.split('&') {
            if let Some(token) = param.strip_prefix("token=") {
                return Ok(token.to_string());
            }
        }
    }

    Err(AuthError::MissingCredentials)
}

// ============================================================================
// RequireAuthStrict Extractor
// ============================================================================

/// Axum extractor that **always** requires a valid token, even when
/// global authentication is disabled; with no admin token configured
/// every request is rejected. Used by the terminal WebSocket and the
/// backup endpoints, which hand out shell access and worker state and
/// must never be publicly reachable.
pub struct RequireAuthStrict;

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for RequireAuthStrict
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        let auth_store = parts
            .extensions
            .get::<Arc<AuthStore>>()
            .ok_or_else(|| AuthError::Internal("AuthStore not configured".to_string()))?;

        // Never bypass: without a configured token there is no valid
        // credential, so nothing gets in.
        let token = extract_token(parts)?;
        if !auth_store.is_enabled() {
            return Err(AuthError::InvalidCredentials.into());
        }
        auth_store.validate_token(&token)?;
        Ok(RequireAuthStrict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts_for(uri: &str, headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri(uri);
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_bearer_header_extracted() {
        let parts = parts_for("/api/worker/status", &[("authorization", "Bearer tok-1")]);
        assert_eq!(extract_token(&parts).unwrap(), "tok-1");
    }

    #[test]
    fn test_api_key_header_extracted() {
        let parts = parts_for("/api/worker/status", &[("x-api-key", "key-2")]);
        assert_eq!(extract_token(&parts).unwrap(), "key-2");
    }

    #[test]
    fn test_query_token_extracted() {
        let parts = parts_for("/ws/terminal?mode=restricted&token=tok-3", &[]);
        assert_eq!(extract_token(&parts).unwrap(), "tok-3");
    }

    #[test]
    fn test_missing_credentials() {
        let parts = parts_for("/api/worker/status", &[]);
        assert!(matches!(
            extract_token(&parts),
            Err(AuthError::MissingCredentials)
        ));
    }

    #[tokio::test]
    async fn test_relaxed_passes_when_auth_disabled() {
        let mut parts = parts_for("/api/worker/status", &[]);
        parts.extensions.insert(Arc::new(AuthStore::new(None)));
        assert!(RequireAuth::from_request_parts(&mut parts, &()).await.is_ok());
    }

    #[tokio::test]
    async fn test_strict_rejects_when_auth_disabled() {
        let mut parts = parts_for(
            "/api/backup/export",
            &[("authorization", "Bearer anything")],
        );
        parts.extensions.insert(Arc::new(AuthStore::new(None)));
        assert!(RequireAuthStrict::from_request_parts(&mut parts, &())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_strict_accepts_configured_token() {
        let mut parts = parts_for(
            "/api/backup/export",
            &[("authorization", "Bearer s3cret")],
        );
        parts.extensions.insert(Arc::new(AuthStore::new(Some("s3cret"))));
        assert!(RequireAuthStrict::from_request_parts(&mut parts, &())
            .await
            .is_ok());
    }
}
