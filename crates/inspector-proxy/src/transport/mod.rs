//! Transport handles.
//!
//! Every leg of a session, whether it faces the browser or a protocol server,
//! is a [`Transport`]. Incoming traffic and lifecycle changes are delivered
//! through a single event subscription handed out once at creation time.

pub mod http;
mod memory;
mod sse;
mod stdio;
mod streamable_http;

pub use memory::MemoryTransport;
pub use sse::SseClientTransport;
pub use stdio::{merge_environment, resolve_executable, StdioConfig, StdioTransport};
pub use streamable_http::{StreamableHttpClientTransport, STREAMABLE_ACCEPT};

use crate::error::{ProxyError, ProxyResult};
use crate::message::Message;
use crate::lock;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Something that happened on a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A framed message arrived from the remote side.
    Message(Message),
    /// A non-terminal failure (bad frame, failed request).
    Error(String),
    /// The transport is gone. Emitted at most once.
    Closed,
}

/// Receiving end of a transport's event subscription.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Uniform handle over one wire mechanism.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &'static str;

    /// Send a message to the remote side.
    async fn send(&self, message: Message) -> ProxyResult<()>;

    /// Close the transport. Safe to call more than once.
    async fn close(&self) -> ProxyResult<()>;

    /// Take the event subscription. Returns `None` after the first call.
    fn events(&self) -> Option<EventReceiver>;

    /// Resolves once the transport can carry traffic.
    async fn ready(&self) {}

    /// Whether the transport has closed.
    fn is_closed(&self) -> bool;
}

/// Producer side of a transport's event subscription.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
    closed: Arc<AtomicBool>,
}

impl EventSink {
    /// Create a sink and its subscription.
    pub fn channel() -> (Self, EventSubscription) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        };
        (sink, EventSubscription(Mutex::new(Some(rx))))
    }

    /// Deliver a message. Returns `false` once the transport has closed.
    pub fn message(&self, message: Message) -> bool {
        if self.is_closed() {
            return false;
        }
        self.tx.send(TransportEvent::Message(message)).is_ok()
    }

    /// Report a non-terminal error.
    pub fn error(&self, error: impl Into<String>) {
        if !self.is_closed() {
            let _ = self.tx.send(TransportEvent::Error(error.into()));
        }
    }

    /// Report that the transport is gone. Only the first call emits an event.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.tx.send(TransportEvent::Closed);
        true
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fail with [`ProxyError::Closed`] once closed.
    pub fn ensure_open(&self) -> ProxyResult<()> {
        if self.is_closed() {
            Err(ProxyError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Take-once holder for an event receiver.
#[derive(Debug)]
pub struct EventSubscription(Mutex<Option<EventReceiver>>);

impl EventSubscription {
    /// Hand out the receiver to the first caller.
    pub fn take(&self) -> Option<EventReceiver> {
        lock(&self.0).take()
    }
}
