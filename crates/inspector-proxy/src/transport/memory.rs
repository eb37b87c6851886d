//! In-process transport pair.

use super::{EventReceiver, EventSink, EventSubscription, Transport};
use crate::error::{ProxyError, ProxyResult};
use crate::message::Message;
use async_trait::async_trait;

/// One end of an in-process pipe.
///
/// Messages sent on one end arrive as events on the other. Closing either
/// end closes both.
#[derive(Debug)]
pub struct MemoryTransport {
    sink: EventSink,
    peer: EventSink,
    events: EventSubscription,
}

impl MemoryTransport {
    /// Create two connected ends.
    pub fn pair() -> (Self, Self) {
        let (left_sink, left_events) = EventSink::channel();
        let (right_sink, right_events) = EventSink::channel();

        let left = Self {
            sink: left_sink.clone(),
            peer: right_sink.clone(),
            events: left_events,
        };
        let right = Self {
            sink: right_sink,
            peer: left_sink,
            events: right_events,
        };
        (left, right)
    }

    /// Raise a non-terminal error on this end, as if the wire had failed.
    pub fn fail(&self, error: impl Into<String>) {
        self.sink.error(error);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn send(&self, message: Message) -> ProxyResult<()> {
        self.sink.ensure_open()?;
        if self.peer.message(message) {
            Ok(())
        } else {
            Err(ProxyError::Closed)
        }
    }

    async fn close(&self) -> ProxyResult<()> {
        self.sink.close();
        self.peer.close();
        Ok(())
    }

    fn events(&self) -> Option<EventReceiver> {
        self.events.take()
    }

    fn is_closed(&self) -> bool {
        self.sink.is_closed()
    }
}
