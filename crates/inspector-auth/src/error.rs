//! Error types for the authorization flow.

use thiserror::Error;

/// Errors that can occur while authorizing against a protocol server.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Failed to read or write the credentials file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to serialize or deserialize stored or fetched data.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The HTTP request itself failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A server or endpoint URL could not be parsed.
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Authorization-server metadata could not be discovered.
    #[error("{0}")]
    Metadata(String),

    /// A metadata endpoint answered with a non-success status.
    #[error("{message}")]
    UpstreamStatus { status: u16, message: String },

    /// No registration strategy produced a client.
    #[error("{0}")]
    Registration(String),

    /// The authorization request could not be built.
    #[error("{0}")]
    Authorization(String),

    /// The token endpoint rejected the request.
    #[error("{0}")]
    Token(String),

    /// A step ran before an earlier step produced what it needs.
    #[error("{0} is required")]
    MissingPrerequisite(&'static str),

    /// Operator input was rejected.
    #[error("{0}")]
    Validation(String),

    /// The flow cannot move from its current step.
    #[error("Cannot advance from step {0}")]
    InvalidTransition(String),

    /// Could not determine the data directory.
    #[error("Could not determine data directory")]
    NoDataDir,

    /// Failed to set file permissions.
    #[error("Failed to set file permissions: {0}")]
    Permissions(String),
}

impl AuthError {
    pub(crate) fn invalid_url(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for authorization operations.
pub type AuthResult<T> = Result<T, AuthError>;
