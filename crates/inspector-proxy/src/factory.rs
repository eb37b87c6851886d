//! Outbound transport construction.
//!
//! The factory turns a [`ServerDescriptor`] plus the browser's passthrough
//! headers into a started transport. It knows nothing about sessions.

use crate::descriptor::{parse_http_url, ServerDescriptor};
use crate::error::{ProxyError, ProxyResult};
use crate::transport::http::build_client;
use crate::transport::{
    merge_environment, SseClientTransport, StdioConfig, StdioTransport,
    StreamableHttpClientTransport, Transport,
};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Client;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Default bound on transport handshakes.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on establishing TCP connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds outbound legs.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Construct and start the transport for a descriptor.
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        headers: &HeaderMap,
    ) -> ProxyResult<Arc<dyn Transport>>;
}

/// Settings shared by every transport the factory builds.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Bound on spawning or the remote handshake.
    pub handshake_timeout: Duration,
    /// Bound on TCP connection establishment.
    pub connect_timeout: Duration,
    /// Environment passed to every subprocess server, below per-call overrides.
    pub default_env: HashMap<String, String>,
    /// Working directory for subprocess servers.
    pub cwd: Option<PathBuf>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            default_env: HashMap::new(),
            cwd: None,
        }
    }
}

/// The production [`Connector`].
#[derive(Debug, Clone)]
pub struct TransportFactory {
    config: TransportConfig,
    client: Client,
}

impl TransportFactory {
    /// Create a factory with its own HTTP client.
    pub fn new(config: TransportConfig) -> ProxyResult<Self> {
        let client = build_client(config.connect_timeout)?;
        Ok(Self { config, client })
    }

    /// Settings in use.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    async fn create(
        &self,
        descriptor: &ServerDescriptor,
        headers: &HeaderMap,
    ) -> ProxyResult<Arc<dyn Transport>> {
        match descriptor {
            ServerDescriptor::Stdio { command, args, env } => {
                let inherited: HashMap<String, String> = std::env::vars().collect();
                let env = merge_environment([&inherited, &self.config.default_env, env]);
                let transport = StdioTransport::spawn(StdioConfig {
                    command: command.clone(),
                    args: args.clone(),
                    env,
                    cwd: self.config.cwd.clone(),
                })?;
                info!(command = %command, pid = ?transport.pid(), "Spawned stdio server");
                Ok(Arc::new(transport))
            }
            ServerDescriptor::Sse { url, .. } => {
                let url = parse_http_url(url)?;
                let headers = descriptor.request_headers(headers)?;
                let transport = SseClientTransport::connect(self.client.clone(), url, headers).await?;
                info!(endpoint = %transport.endpoint(), "Connected event stream server");
                Ok(Arc::new(transport))
            }
            ServerDescriptor::StreamableHttp { url, .. } => {
                let url = parse_http_url(url)?;
                let headers = descriptor.request_headers(headers)?;
                debug!(url = %url, "Prepared streamable HTTP server");
                Ok(Arc::new(StreamableHttpClientTransport::new(
                    self.client.clone(),
                    url,
                    headers,
                )))
            }
        }
    }
}

#[async_trait]
impl Connector for TransportFactory {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        headers: &HeaderMap,
    ) -> ProxyResult<Arc<dyn Transport>> {
        descriptor.validate()?;
        let timeout = self.config.handshake_timeout;
        tokio::time::timeout(timeout, self.create(descriptor, headers))
            .await
            .map_err(|_| ProxyError::Timeout(timeout))?
    }
}
