//! Session proxy service.
//!
//! The front door's single entry point: builds outbound legs, registers
//! sessions, starts their pumps and routes later requests to them.

use crate::descriptor::ServerDescriptor;
use crate::error::{ProxyError, ProxyResult};
use crate::factory::{Connector, TransportConfig, TransportFactory};
use crate::inbound::{
    EventStreamServerTransport, InboundTransport, OutgoingStream, StreamableHttpServerTransport,
};
use crate::message::Message;
use crate::pump;
use crate::registry::{
    SessionEvent, SessionInfo, SessionRegistry, DEFAULT_CLOSE_TIMEOUT, DEFAULT_MAX_SESSIONS,
};
use crate::transport::Transport;
use reqwest::header::HeaderMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

/// Path the browser posts event-stream messages to.
pub const DEFAULT_MESSAGE_PATH: &str = "/message";

/// Proxy settings.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Ceiling on concurrent sessions.
    pub max_sessions: usize,
    /// Bound on closing an outbound leg.
    pub close_timeout: Duration,
    /// Outbound transport settings.
    pub transport: TransportConfig,
    /// Path advertised in the `endpoint` event of browser event streams.
    pub message_path: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            transport: TransportConfig::default(),
            message_path: DEFAULT_MESSAGE_PATH.to_string(),
        }
    }
}

/// Orchestrates session setup, routing and teardown.
pub struct ProxyService {
    registry: Arc<SessionRegistry>,
    connector: Arc<dyn Connector>,
    config: ProxyConfig,
}

impl ProxyService {
    /// Create a service backed by the real transport factory.
    pub fn new(config: ProxyConfig) -> ProxyResult<Self> {
        let factory = TransportFactory::new(config.transport.clone())?;
        Ok(Self::with_connector(config, Arc::new(factory)))
    }

    /// Create a service with a custom connector.
    pub fn with_connector(config: ProxyConfig, connector: Arc<dyn Connector>) -> Self {
        let registry =
            SessionRegistry::new(config.max_sessions).with_close_timeout(config.close_timeout);
        Self {
            registry: Arc::new(registry),
            connector,
            config,
        }
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Open an outbound leg and register a session for it.
    ///
    /// The browser leg is attached later with [`attach_inbound`](Self::attach_inbound);
    /// server traffic is buffered until then.
    pub async fn create_connection(
        &self,
        descriptor: &ServerDescriptor,
        headers: &HeaderMap,
    ) -> ProxyResult<String> {
        let id = Uuid::new_v4().to_string();
        self.open(&id, descriptor, headers, None).await?;
        Ok(id)
    }

    /// Open a session whose browser leg is a bidirectional HTTP stream.
    ///
    /// The pump starts moving traffic once the browser's first `POST` lands.
    pub async fn create_stream_upgrade_connection(
        &self,
        descriptor: &ServerDescriptor,
        headers: &HeaderMap,
    ) -> ProxyResult<(String, Arc<StreamableHttpServerTransport>)> {
        let id = Uuid::new_v4().to_string();
        let inbound = Arc::new(StreamableHttpServerTransport::new(&id));
        self.open(
            &id,
            descriptor,
            headers,
            Some(InboundTransport::StreamableHttp(inbound.clone())),
        )
        .await?;
        Ok((id, inbound))
    }

    /// Open a session whose browser leg is an event stream.
    ///
    /// The returned stream feeds the browser's `GET` response; dropping it
    /// closes the session.
    pub async fn create_event_stream_connection(
        &self,
        descriptor: &ServerDescriptor,
        headers: &HeaderMap,
    ) -> ProxyResult<(String, Arc<EventStreamServerTransport>, OutgoingStream)> {
        let id = Uuid::new_v4().to_string();
        let (inbound, stream) = EventStreamServerTransport::new(&id, &self.config.message_path);
        let inbound = Arc::new(inbound);
        self.open(
            &id,
            descriptor,
            headers,
            Some(InboundTransport::EventStream(inbound.clone())),
        )
        .await?;
        Ok((id, inbound, stream))
    }

    async fn open(
        &self,
        id: &str,
        descriptor: &ServerDescriptor,
        headers: &HeaderMap,
        inbound: Option<InboundTransport>,
    ) -> ProxyResult<()> {
        descriptor.validate()?;
        self.registry.ensure_capacity()?;

        info!(session = %id, transport = %descriptor.kind(), "Creating connection");

        let outbound = match self.connector.connect(descriptor, headers).await {
            Ok(outbound) => outbound,
            Err(e) => {
                let e = ProxyError::setup(e);
                warn!(session = %id, error = %e, "Failed to create connection");
                return Err(e);
            }
        };

        // The ceiling may have been reached while connecting.
        if let Err(e) = self.registry.register(id, inbound, outbound.clone()) {
            if let Err(close_err) = outbound.close().await {
                warn!(session = %id, error = %close_err, "Failed to close rejected connection");
            }
            return Err(e);
        }

        if let Err(e) = pump::spawn(self.registry.clone(), id) {
            self.registry.close(id).await;
            return Err(ProxyError::setup(e));
        }
        Ok(())
    }

    /// Attach a browser leg to a session created by
    /// [`create_connection`](Self::create_connection).
    pub fn attach_inbound(&self, id: &str, inbound: InboundTransport) -> ProxyResult<()> {
        self.registry.attach_inbound(id, inbound)
    }

    /// The server-facing leg of a session.
    pub fn get_transport(&self, id: &str) -> Option<Arc<dyn Transport>> {
        self.registry.outbound(id)
    }

    /// The browser-facing leg of a session.
    pub fn get_web_app_transport(&self, id: &str) -> Option<InboundTransport> {
        self.registry.inbound(id)
    }

    /// Send a message straight to a session's server.
    pub async fn send_message(&self, id: &str, message: Message) -> ProxyResult<()> {
        let outbound = self
            .registry
            .outbound(id)
            .ok_or_else(|| ProxyError::SessionNotFound(id.to_string()))?;
        self.registry.touch(id);
        if let Err(e) = outbound.send(message).await {
            self.registry.record_error(id, e.to_string());
            return Err(e);
        }
        Ok(())
    }

    /// Tear one session down. Returns whether it existed.
    pub async fn close_connection(&self, id: &str) -> bool {
        self.registry.close(id).await
    }

    /// Tear every session down and wait for all of them.
    pub async fn close_all_connections(&self) -> usize {
        self.registry.close_all().await
    }

    pub fn session_info(&self, id: &str) -> Option<SessionInfo> {
        self.registry.session_info(id)
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.registry.list()
    }

    /// Number of live sessions.
    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }

    /// Change the session ceiling for new sessions.
    pub fn set_max_sessions(&self, max: usize) {
        self.registry.set_max_sessions(max);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.registry.subscribe()
    }
}

impl std::fmt::Debug for ProxyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyService")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}
