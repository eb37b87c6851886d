//! Legacy event-stream leg served to the browser.
//!
//! The browser holds a `GET` event stream open and posts its messages to a
//! per-session endpoint. Messages from the server are queued onto the open
//! response; posted messages become events on this transport.

use super::OutgoingStream;
use crate::error::{ProxyError, ProxyResult};
use crate::lock;
use crate::message::Message;
use crate::transport::{EventReceiver, EventSink, EventSubscription, Transport};
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Server side of an event-stream session.
#[derive(Debug)]
pub struct EventStreamServerTransport {
    session_id: String,
    endpoint: String,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    sink: EventSink,
    events: EventSubscription,
}

impl EventStreamServerTransport {
    /// Create the leg and the stream that feeds the browser's response.
    ///
    /// `message_path` is the path the browser posts to; the session id is
    /// appended as a query parameter. Dropping the returned stream closes
    /// the leg.
    pub fn new(session_id: impl Into<String>, message_path: &str) -> (Self, OutgoingStream) {
        let session_id = session_id.into();
        let endpoint = format!("{message_path}?sessionId={session_id}");
        let (tx, rx) = mpsc::unbounded_channel();
        let (sink, events) = EventSink::channel();

        let transport = Self {
            session_id,
            endpoint,
            outgoing: Mutex::new(Some(tx)),
            sink: sink.clone(),
            events,
        };
        (transport, OutgoingStream::owning(rx, sink))
    }

    /// Session id this leg belongs to.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Value of the `endpoint` event sent first on the stream.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Accept a message posted by the browser.
    pub fn handle_post_message(&self, message: Message) -> ProxyResult<()> {
        self.sink.ensure_open()?;
        if self.sink.message(message) {
            Ok(())
        } else {
            Err(ProxyError::Closed)
        }
    }
}

#[async_trait]
impl Transport for EventStreamServerTransport {
    fn name(&self) -> &'static str {
        "event-stream-server"
    }

    async fn send(&self, message: Message) -> ProxyResult<()> {
        let outgoing = lock(&self.outgoing);
        let tx = outgoing.as_ref().ok_or(ProxyError::Closed)?;
        tx.send(message).map_err(|_| ProxyError::Closed)
    }

    async fn close(&self) -> ProxyResult<()> {
        // Dropping the sender ends the browser's response.
        lock(&self.outgoing).take();
        if self.sink.close() {
            debug!(session = %self.session_id, "Closed event stream leg");
        }
        Ok(())
    }

    fn events(&self) -> Option<EventReceiver> {
        self.events.take()
    }

    fn is_closed(&self) -> bool {
        self.sink.is_closed()
    }
}
