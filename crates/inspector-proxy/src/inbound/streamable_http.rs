//! Bidirectional HTTP stream leg served to the browser.
//!
//! Each browser `POST` carries one message or a batch. Batches holding
//! requests are answered on an event stream that stays open until every
//! request in the batch has a response. Server-initiated traffic goes to the
//! standalone `GET` stream when one is open.

use super::OutgoingStream;
use crate::error::{ProxyError, ProxyResult};
use crate::lock;
use crate::message::Message;
use crate::transport::{EventReceiver, EventSink, EventSubscription, Transport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// How a browser `POST` is answered.
#[derive(Debug)]
pub enum PostOutcome {
    /// Nothing to wait for; reply `202 Accepted`.
    Accepted,
    /// Stream responses back on the `POST` response.
    Stream(OutgoingStream),
}

#[derive(Debug, Default)]
struct Routes {
    /// Request key to the stream its response belongs on.
    pending: HashMap<String, mpsc::UnboundedSender<Message>>,
    /// Most recent `POST` stream, used while it still awaits responses.
    latest: Option<mpsc::WeakUnboundedSender<Message>>,
    standalone: Option<mpsc::UnboundedSender<Message>>,
}

/// Server side of a bidirectional HTTP stream session.
#[derive(Debug)]
pub struct StreamableHttpServerTransport {
    session_id: String,
    routes: Mutex<Routes>,
    ready: watch::Sender<bool>,
    sink: EventSink,
    events: EventSubscription,
}

impl StreamableHttpServerTransport {
    /// Create the leg for a session.
    pub fn new(session_id: impl Into<String>) -> Self {
        let (sink, events) = EventSink::channel();
        let (ready, _) = watch::channel(false);
        Self {
            session_id: session_id.into(),
            routes: Mutex::new(Routes::default()),
            ready,
            sink,
            events,
        }
    }

    /// Session id advertised in the `mcp-session-id` header.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Accept the messages of one browser `POST`.
    pub fn handle_post(&self, messages: Vec<Message>) -> ProxyResult<PostOutcome> {
        self.sink.ensure_open()?;

        let requests: Vec<String> = messages
            .iter()
            .filter(|m| m.is_request())
            .filter_map(Message::correlation_key)
            .collect();

        // Routes are registered before forwarding so fast responses find them.
        let outcome = if requests.is_empty() {
            PostOutcome::Accepted
        } else {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut routes = lock(&self.routes);
            for key in requests {
                routes.pending.insert(key, tx.clone());
            }
            routes.latest = Some(tx.downgrade());
            PostOutcome::Stream(OutgoingStream::new(rx))
        };

        for message in messages {
            if !self.sink.message(message) {
                return Err(ProxyError::Closed);
            }
        }
        self.ready.send_replace(true);
        Ok(outcome)
    }

    /// Open the standalone stream for server-initiated traffic.
    pub fn open_standalone_stream(&self) -> ProxyResult<OutgoingStream> {
        self.sink.ensure_open()?;

        let mut routes = lock(&self.routes);
        if routes.standalone.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(ProxyError::Conflict(
                "Only one event stream is allowed per session".to_string(),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        routes.standalone = Some(tx);
        Ok(OutgoingStream::new(rx))
    }
}

#[async_trait]
impl Transport for StreamableHttpServerTransport {
    fn name(&self) -> &'static str {
        "streamable-http-server"
    }

    async fn send(&self, message: Message) -> ProxyResult<()> {
        self.sink.ensure_open()?;
        let mut routes = lock(&self.routes);

        if message.is_response() {
            let route = message
                .correlation_key()
                .and_then(|key| routes.pending.remove(&key));
            if let Some(tx) = route {
                return tx.send(message).map_err(|_| {
                    ProxyError::transport("Browser closed the stream awaiting this response")
                });
            }
        }

        let message = match routes.standalone.as_ref() {
            Some(tx) => match tx.send(message) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(message)) => {
                    routes.standalone = None;
                    message
                }
            },
            None => message,
        };

        if let Some(tx) = routes.latest.as_ref().and_then(|weak| weak.upgrade()) {
            if tx.send(message).is_ok() {
                return Ok(());
            }
        }

        debug!(session = %self.session_id, "No open stream for server message, dropping");
        Ok(())
    }

    async fn close(&self) -> ProxyResult<()> {
        {
            let mut routes = lock(&self.routes);
            routes.pending.clear();
            routes.latest = None;
            routes.standalone = None;
        }
        if self.sink.close() {
            debug!(session = %self.session_id, "Closed streamable HTTP leg");
        }
        Ok(())
    }

    fn events(&self) -> Option<EventReceiver> {
        self.events.take()
    }

    async fn ready(&self) {
        let mut ready = self.ready.subscribe();
        let _ = ready.wait_for(|ready| *ready).await;
    }

    fn is_closed(&self) -> bool {
        self.sink.is_closed()
    }
}
