//! Guided OAuth authorization for protocol servers.
//!
//! This crate drives the six-step authorization flow the inspector walks an
//! operator through, one explicit step at a time:
//!
//! 1. **metadata_discovery** - protected-resource and authorization-server metadata
//! 2. **client_registration** - dynamic registration, or a persisted or static client
//! 3. **authorization_redirect** - PKCE pair, state token and authorization URL
//! 4. **authorization_code** - the code the operator pasted back
//! 5. **token_request** - code exchange at the token endpoint
//! 6. **complete**
//!
//! A failing step records an error scoped to that step and leaves the flow
//! where it was, so the operator can retry.
//!
//! # Storage Location
//!
//! Client records, tokens and verifiers are stored per server URL in a
//! platform-specific data directory:
//! - Linux: `~/.local/share/inspector/credentials.json`
//! - macOS: `~/Library/Application Support/inspector/credentials.json`
//! - Windows: `%APPDATA%/inspector/credentials.json`
//!
//! The file is created with restrictive permissions (0600 on Unix).
//!
//! # Example
//!
//! ```no_run
//! use inspector_auth::{AuthFlow, FileCredentialStore, FlowConfig, StepOutcome};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(FileCredentialStore::new()?);
//!     let mut flow = AuthFlow::new("https://example.com/mcp", FlowConfig::default(), store)?;
//!
//!     while let StepOutcome::Advanced(step) = flow.proceed().await {
//!         println!("now at {step}");
//!     }
//!     if let Some(url) = flow.authorization_url() {
//!         println!("open {url}, then paste the code back");
//!     }
//!     Ok(())
//! }
//! ```

mod client;
pub mod discovery;
mod error;
mod flow;
pub mod pkce;
pub mod registration;
mod storage;
mod types;

pub use client::{
    authorization_url, exchange_authorization, refresh_authorization, register_client,
    AuthorizationRequest,
};
pub use error::{AuthError, AuthResult};
pub use flow::{
    transition, AuthFlow, Discovery, FlowConfig, FlowEvent, FlowSnapshot, FlowState, OAuthStep,
    StatusKind, StatusMessage, StepError, StepOutcome,
};
pub use registration::{RegistrationContext, RegistrationOutcome, RegistrationStrategy};
pub use storage::{
    CredentialScope, CredentialStore, FileCredentialStore, MemoryCredentialStore,
    ServerCredentials,
};
pub use types::{
    ClientInformation, ClientMetadata, OAuthMetadata, OAuthTokens, ProtectedResourceMetadata,
};

/// Redirect URI the inspector registers and sends with every authorization.
pub const DEFAULT_REDIRECT_URL: &str = "http://localhost:6274/oauth/callback/debug";

/// Client name sent during registration.
pub const DEFAULT_CLIENT_NAME: &str = "MCP Inspector";

/// Client homepage sent during registration.
pub const DEFAULT_CLIENT_URI: &str = "https://github.com/modelcontextprotocol/inspector";

/// Get the default credentials file path for the current platform.
///
/// Returns `None` if the data directory cannot be determined.
pub fn default_credentials_path() -> Option<std::path::PathBuf> {
    dirs::data_dir().map(|p| p.join("inspector").join("credentials.json"))
}

/// Get the current time in milliseconds since Unix epoch.
pub fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
