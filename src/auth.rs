use crate::error::{AppError, CODE_INVALID_AUTH_KEY, CODE_MISSING_AUTH_HEADER};
use axum::http::HeaderMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing or malformed Authorization header")]
    MissingOrInvalidHeader,
    #[error("invalid api key")]
    InvalidKey,
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingOrInvalidHeader => AppError::unauthorized(
                CODE_MISSING_AUTH_HEADER,
                "Unauthorized: Missing or invalid Authorization header. Use 'Bearer <YOUR_API_KEY>' format.",
            ),
            AuthError::InvalidKey => {
                AppError::unauthorized(CODE_INVALID_AUTH_KEY, "Unauthorized: Invalid API Key provided.")
            }
        }
    }
}

/// Static bearer-secret check for the forwarding endpoints.
#[derive(Clone)]
pub struct AuthState {
    secret: Arc<str>,
}

impl AuthState {
    pub fn new(secret: impl Into<Arc<str>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// The scheme name is matched case-insensitively; the token itself byte-for-byte.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        let auth_header = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(AuthError::MissingOrInvalidHeader)?;
        let token = strip_bearer(auth_header).ok_or(AuthError::MissingOrInvalidHeader)?;
        if token.as_bytes() != self.secret.as_bytes() {
            tracing::debug!("authentication failed: invalid api key");
            return Err(AuthError::InvalidKey);
        }
        Ok(())
    }
}

fn strip_bearer(value: &str) -> Option<&str> {
    let scheme = value.get(..7)?;
    if scheme.eq_ignore_ascii_case("bearer ") {
        value.get(7..)
    } else {
        None
    }
}
