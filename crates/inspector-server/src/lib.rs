//! HTTP front door for the inspector.
//!
//! Exposes the session proxy to the browser UI (event-stream and
//! bidirectional HTTP stream legs), the authorization flows, and a few
//! informational endpoints. Configuration is layered from files and the
//! environment; see [`config`].

pub mod config;
pub mod connect;
pub mod error;
pub mod oauth;
pub mod routes;
pub mod sse;
pub mod state;

pub use config::InspectorConfig;
pub use error::{ApiError, ConfigError, ConfigResult, ServerError, ServerResult};
pub use routes::create_router;
pub use state::AppState;
