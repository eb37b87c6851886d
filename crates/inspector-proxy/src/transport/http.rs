//! Shared plumbing for the HTTP client transports.

use super::EventSink;
use crate::error::{ProxyError, ProxyResult};
use crate::message::Message;
use crate::sse::{SseEvent, SseParser};
use futures::{Stream, StreamExt};
use reqwest::{Client, Response, StatusCode};
use std::collections::VecDeque;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Header carrying the server-assigned session id.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Build the HTTP client used for outbound legs.
///
/// Only the connect phase is bounded: event streams stay open for the whole
/// session, so a total request timeout would cut them off.
pub fn build_client(connect_timeout: Duration) -> ProxyResult<Client> {
    Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|e| ProxyError::transport(format!("Failed to create HTTP client: {e}")))
}

/// Map a request failure to a proxy error.
pub fn request_error(e: reqwest::Error) -> ProxyError {
    if e.is_connect() {
        ProxyError::transport(format!("Connection failed: {e}"))
    } else {
        ProxyError::Http(e)
    }
}

/// Reject 401s as [`ProxyError::AuthRequired`] and other failures with the body text.
pub async fn ensure_success(response: Response, context: &str) -> ProxyResult<Response> {
    let status = response.status();

    if status == StatusCode::UNAUTHORIZED {
        return Err(ProxyError::AuthRequired(format!("{context} returned {status}")));
    }

    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(ProxyError::transport(format!(
            "{context} returned {status}: {text}"
        )));
    }

    Ok(response)
}

/// Whether a response declares the given media type.
pub fn has_content_type(response: &Response, media_type: &str) -> bool {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains(media_type))
        .unwrap_or(false)
}

/// Deliver a `message` event to the sink. Other event types are ignored.
pub fn dispatch_event(event: &SseEvent, sink: &EventSink) {
    if event.event_type() != "message" {
        debug!(event = %event.event_type(), "Ignoring event");
        return;
    }

    match Message::parse(&event.data) {
        Ok(message) => {
            sink.message(message);
        }
        Err(e) => sink.error(format!("Invalid JSON in event stream: {e}")),
    }
}

/// Read an event stream body until it ends, fails or is cancelled.
///
/// `backlog` holds events already parsed during a handshake; they are
/// delivered first. Returns `true` when the stream ended on its own.
pub async fn read_event_stream<S, B>(
    mut body: S,
    mut parser: SseParser,
    backlog: VecDeque<SseEvent>,
    sink: EventSink,
    cancel: CancellationToken,
) -> bool
where
    S: Stream<Item = Result<B, reqwest::Error>> + Unpin,
    B: AsRef<[u8]>,
{
    for event in &backlog {
        dispatch_event(event, &sink);
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            chunk = body.next() => match chunk {
                Some(Ok(bytes)) => {
                    for event in parser.feed(bytes.as_ref()) {
                        dispatch_event(&event, &sink);
                    }
                }
                Some(Err(e)) => {
                    sink.error(format!("Event stream error: {e}"));
                    return true;
                }
                None => return true,
            }
        }
    }
}
