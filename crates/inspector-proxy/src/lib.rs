//! Session proxy between the inspector UI and protocol servers.
//!
//! A browser cannot spawn processes or talk to arbitrary origins, so the
//! inspector relays its traffic. Each session pairs a browser-facing leg with
//! a server-facing leg and pumps framed messages between them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────┐  inbound leg  ┌──────────────┐  outbound leg  ┌─────────────┐
//! │ Browser │──────────────▶│ ProxyService │───────────────▶│  Protocol   │
//! │   UI    │◀──────────────│  + registry  │◀───────────────│   server    │
//! └─────────┘               └──────────────┘                └─────────────┘
//! ```
//!
//! # Supported Transports
//!
//! - **stdio**: a local server spawned as a subprocess
//! - **sse**: a remote event stream plus a `POST` endpoint
//! - **streamable-http**: a remote bidirectional HTTP stream
//!
//! # Example
//!
//! ```no_run
//! use inspector_proxy::{ProxyConfig, ProxyService, ServerDescriptor};
//! use reqwest::header::HeaderMap;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let service = ProxyService::new(ProxyConfig::default())?;
//!
//! let descriptor = ServerDescriptor::stdio("npx", ["-y", "@modelcontextprotocol/server-everything"]);
//! let session_id = service.create_connection(&descriptor, &HeaderMap::new()).await?;
//!
//! println!("active sessions: {}", service.active_connections());
//! service.close_connection(&session_id).await;
//! # Ok(())
//! # }
//! ```

pub mod descriptor;
mod error;
pub mod factory;
pub mod inbound;
pub mod message;
mod pump;
pub mod registry;
mod service;
pub mod sse;
pub mod transport;

pub use descriptor::{ServerDescriptor, TransportKind};
pub use error::{ProxyError, ProxyResult};
pub use factory::{Connector, TransportConfig, TransportFactory};
pub use inbound::{
    EventStreamServerTransport, InboundTransport, OutgoingStream, PostOutcome,
    StreamableHttpServerTransport,
};
pub use message::Message;
pub use registry::{
    ConnectionStatus, SessionEvent, SessionInfo, SessionRegistry, DEFAULT_MAX_SESSIONS,
};
pub use service::{ProxyConfig, ProxyService};
pub use transport::{Transport, TransportEvent};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
