//! Server-Sent Events support.

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use inspector_proxy::OutgoingStream;
use std::convert::Infallible;
use std::time::Duration;

/// Stream a session's outgoing messages to the browser.
///
/// When `endpoint` is given it is sent first as an `endpoint` event, telling
/// the browser where to post its messages. The stream ends when the session's
/// leg closes; dropping it (browser gone) closes legs that own their stream.
pub fn outgoing_stream(
    endpoint: Option<String>,
    mut outgoing: OutgoingStream,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        if let Some(endpoint) = endpoint {
            yield Ok(Event::default().event("endpoint").data(endpoint));
        }

        while let Some(message) = outgoing.recv().await {
            yield Ok(Event::default().event("message").data(message.to_json()));
        }
        tracing::debug!("Outgoing stream ended");
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
