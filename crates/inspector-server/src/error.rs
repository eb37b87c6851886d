//! Error types for the front door.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use inspector_auth::AuthError;
use inspector_proxy::ProxyError;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON in {path}: {message}")]
    InvalidJson { path: String, message: String },

    #[error("Environment variable not found: {name}")]
    EnvVarNotFound { name: String },

    #[error("File reference not found: {path}")]
    FileRefNotFound { path: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors that stop the server from starting.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// A JSON error body with its status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn session_not_found() -> Self {
        Self::not_found("Session not found")
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<ProxyError> for ApiError {
    fn from(error: ProxyError) -> Self {
        match error {
            ProxyError::Capacity { .. } => Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "Server busy: too many active connections",
            ),
            ProxyError::AuthRequired(_) => {
                Self::new(StatusCode::UNAUTHORIZED, "Authentication required")
            }
            ProxyError::SessionNotFound(_) => Self::session_not_found(),
            ProxyError::InvalidDescriptor(message) => Self::bad_request(message),
            ProxyError::Conflict(message) => Self::new(StatusCode::CONFLICT, message),
            ProxyError::Closed => Self::new(StatusCode::GONE, "Session closed"),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(error: AuthError) -> Self {
        match error {
            AuthError::UpstreamStatus { status, message } => Self::new(
                StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
                message,
            ),
            AuthError::InvalidUrl { .. } | AuthError::Validation(_) => {
                Self::bad_request(error.to_string())
            }
            AuthError::InvalidTransition(_) => Self::new(StatusCode::CONFLICT, error.to_string()),
            other => Self::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_error_statuses() {
        let cases = [
            (ProxyError::Capacity { max: 50 }, StatusCode::TOO_MANY_REQUESTS),
            (ProxyError::AuthRequired("401".into()), StatusCode::UNAUTHORIZED),
            (ProxyError::SessionNotFound("x".into()), StatusCode::NOT_FOUND),
            (ProxyError::invalid_descriptor("bad"), StatusCode::BAD_REQUEST),
            (
                ProxyError::setup(ProxyError::transport("refused")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status(), status);
        }
    }

    #[test]
    fn test_capacity_message() {
        let error = ApiError::from(ProxyError::Capacity { max: 1 });
        assert_eq!(error.message(), "Server busy: too many active connections");
    }

    #[test]
    fn test_upstream_status_is_kept() {
        let error = ApiError::from(AuthError::UpstreamStatus {
            status: 403,
            message: "nope".into(),
        });
        assert_eq!(error.status(), StatusCode::FORBIDDEN);
    }
}
