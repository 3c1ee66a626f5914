//! Admin credential storage and validation
//!
//! The gateway's own administrative surface (supervisor controls,
//! backup, terminal) is guarded by a single operator token. Tokens are
//! stored as SHA-256 digests and compared in constant time.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::debug;

/// Authentication errors
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No credentials provided
    #[error("authentication required")]
    MissingCredentials,

    /// Invalid token
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Internal error
    #[error("auth internal error: {0}")]
    Internal(String),
}

/// Auth result type
pub type Result<T> = std::result::Result<T, AuthError>;

/// Validates presented admin tokens against a stored digest.
///
/// When constructed without a token (`enabled == false`) every request
/// passes; that is the local-development mode for an unset admin token.
pub struct AuthStore {
    token_digest: Option<[u8; 32]>,
}

impl AuthStore {
    /// Store the digest of `token`; `None` disables authentication.
    #[must_use]
    pub fn new(token: Option<&str>) -> Self {
        let token_digest = token.map(|t| {
            let mut hasher = Sha256::new();
            hasher.update(t.as_bytes());
            hasher.finalize().into()
        });
        if token_digest.is_none() {
            debug!("admin auth disabled (no token configured)");
        }
        Self { token_digest }
    }

    /// Whether a token is required at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.token_digest.is_some()
    }

    /// Validate a presented token.
    pub fn validate_token(&self, presented: &str) -> Result<()> {
        let Some(expected) = &self.token_digest else {
            return Ok(());
        };
        let mut hasher = Sha256::new();
        hasher.update(presented.as_bytes());
        let digest: [u8; 32] = hasher.finalize().into();

        if digest.ct_eq(expected).into() {
            Ok(())
        } else {
            Err(AuthError::InvalidCredentials)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_token_accepted() {
        let store = AuthStore::new(Some("s3cret"));
        assert!(store.is_enabled());
        assert!(store.validate_token("s3cret").is_ok());
    }

    #[test]
    fn test_wrong_token_rejected() {
        let store = AuthStore::new(Some("s3cret"));
        assert!(matches!(
            store.validate_token("guess"),
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            store.validate_token(""),
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[test]
    fn test_disabled_store_accepts_anything() {
        let store = AuthStore::new(None);
        assert!(!store.is_enabled());
        assert!(store.validate_token("anything").is_ok());
    }
}
