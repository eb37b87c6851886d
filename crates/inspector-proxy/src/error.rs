//! Proxy error types.

use thiserror::Error;

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Errors that can occur while setting up or running proxied sessions.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The concurrent session ceiling has been reached.
    #[error("Maximum connections reached ({max})")]
    Capacity { max: usize },

    /// The protocol server rejected the connection with a 401.
    #[error("Authentication required: {0}")]
    AuthRequired(String),

    /// The outbound leg could not be constructed or did not complete its handshake.
    #[error("Connection setup failed: {message}")]
    SetupFailed {
        message: String,
        #[source]
        source: Option<Box<ProxyError>>,
    },

    /// The server process could not be spawned.
    #[error("Failed to spawn '{command}': {message}")]
    SpawnFailed { command: String, message: String },

    /// The server descriptor is incomplete or malformed.
    #[error("Invalid server descriptor: {0}")]
    InvalidDescriptor(String),

    /// No live session with the given id.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// A transport-level failure on a live session.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The request conflicts with the current state of the leg.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The transport is already closed.
    #[error("Transport closed")]
    Closed,

    /// Handshake or close did not finish in time.
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ProxyError {
    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create an invalid descriptor error.
    pub fn invalid_descriptor(message: impl Into<String>) -> Self {
        Self::InvalidDescriptor(message.into())
    }

    /// Wrap a lower-level failure as a setup failure, keeping the cause.
    ///
    /// Authorization and capacity errors are passed through untouched so the
    /// caller can still tell them apart.
    pub fn setup(cause: ProxyError) -> Self {
        match cause {
            Self::AuthRequired(_) | Self::Capacity { .. } | Self::SetupFailed { .. } => cause,
            other => Self::SetupFailed {
                message: other.to_string(),
                source: Some(Box::new(other)),
            },
        }
    }

    /// Whether the outbound leg asked for authorization.
    pub fn is_auth_required(&self) -> bool {
        matches!(self, Self::AuthRequired(_))
    }

    /// Whether admission was refused because the registry is full.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::Capacity { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            (
                ProxyError::Capacity { max: 50 },
                "Maximum connections reached (50)",
            ),
            (
                ProxyError::AuthRequired("401 Unauthorized".to_string()),
                "Authentication required: 401 Unauthorized",
            ),
            (
                ProxyError::SessionNotFound("abc".to_string()),
                "Session not found: abc",
            ),
            (
                ProxyError::invalid_descriptor("missing url"),
                "Invalid server descriptor: missing url",
            ),
            (ProxyError::Closed, "Transport closed"),
            (
                ProxyError::SpawnFailed {
                    command: "nope".to_string(),
                    message: "not found".to_string(),
                },
                "Failed to spawn 'nope': not found",
            ),
        ];

        for (error, expected) in errors {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn test_setup_keeps_auth_and_capacity() {
        let auth = ProxyError::setup(ProxyError::AuthRequired("x".to_string()));
        assert!(auth.is_auth_required());

        let capacity = ProxyError::setup(ProxyError::Capacity { max: 1 });
        assert!(capacity.is_capacity());
    }

    #[test]
    fn test_setup_wraps_cause() {
        let err = ProxyError::setup(ProxyError::transport("connection refused"));
        match &err {
            ProxyError::SetupFailed { message, source } => {
                assert_eq!(message, "Transport error: connection refused");
                assert!(source.is_some());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.is_auth_required());
        assert!(!err.is_capacity());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: ProxyError = io.into();
        assert!(err.to_string().contains("missing"));
    }
}
