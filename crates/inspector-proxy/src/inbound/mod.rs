//! Browser-facing legs.
//!
//! These transports live on the proxy's own HTTP surface. The front door
//! feeds them request bodies and streams their outgoing messages back to the
//! browser; the pump sees them as ordinary [`Transport`]s.

mod event_stream;
mod streamable_http;

pub use event_stream::EventStreamServerTransport;
pub use streamable_http::{PostOutcome, StreamableHttpServerTransport};

use crate::message::Message;
use crate::transport::{EventSink, Transport};
use futures::Stream;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// The browser-facing leg of a session.
#[derive(Clone)]
pub enum InboundTransport {
    /// Legacy event stream plus `POST /message`.
    EventStream(Arc<EventStreamServerTransport>),
    /// Bidirectional HTTP stream on `/mcp`.
    StreamableHttp(Arc<StreamableHttpServerTransport>),
    /// Any other transport, e.g. an in-process pipe.
    Custom(Arc<dyn Transport>),
}

impl InboundTransport {
    /// The leg as a plain transport handle.
    pub fn transport(&self) -> Arc<dyn Transport> {
        match self {
            Self::EventStream(t) => t.clone(),
            Self::StreamableHttp(t) => t.clone(),
            Self::Custom(t) => t.clone(),
        }
    }
}

impl fmt::Debug for InboundTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::EventStream(_) => "EventStream",
            Self::StreamableHttp(_) => "StreamableHttp",
            Self::Custom(t) => t.name(),
        };
        f.debug_tuple("InboundTransport").field(&kind).finish()
    }
}

/// Messages on their way to the browser over one HTTP response.
///
/// When the stream owns the leg's lifetime (the legacy event stream), dropping
/// it means the browser went away and the leg is closed.
#[derive(Debug)]
pub struct OutgoingStream {
    rx: mpsc::UnboundedReceiver<Message>,
    closes: Option<EventSink>,
}

impl OutgoingStream {
    fn new(rx: mpsc::UnboundedReceiver<Message>) -> Self {
        Self { rx, closes: None }
    }

    fn owning(rx: mpsc::UnboundedReceiver<Message>, sink: EventSink) -> Self {
        Self {
            rx,
            closes: Some(sink),
        }
    }

    /// Wait for the next message.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Stream for OutgoingStream {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for OutgoingStream {
    fn drop(&mut self) {
        if let Some(sink) = self.closes.take() {
            sink.close();
        }
    }
}
