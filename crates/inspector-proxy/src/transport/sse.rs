//! Event-stream client transport.
//!
//! Opens a long-lived `GET` event stream to the server. The first `endpoint`
//! event names the URL that client messages are `POST`ed to; every later
//! `message` event carries a server frame.

use super::http::{ensure_success, read_event_stream, request_error};
use super::{EventReceiver, EventSink, EventSubscription, Transport};
use crate::error::{ProxyError, ProxyResult};
use crate::message::Message;
use crate::sse::SseParser;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// Transport to a server exposing an event-stream endpoint.
pub struct SseClientTransport {
    client: Client,
    endpoint: Url,
    headers: HeaderMap,
    sink: EventSink,
    events: EventSubscription,
    cancel: CancellationToken,
}

impl SseClientTransport {
    /// Open the event stream and wait for the `endpoint` event.
    pub async fn connect(client: Client, url: Url, headers: HeaderMap) -> ProxyResult<Self> {
        debug!(url = %url, "Opening event stream");

        let response = client
            .get(url.clone())
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(request_error)?;
        let response = ensure_success(response, "Event stream").await?;

        let mut body = response.bytes_stream().boxed();
        let mut parser = SseParser::new();
        let mut backlog = VecDeque::new();

        let endpoint = loop {
            let chunk = match body.next().await {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return Err(ProxyError::transport(format!("Event stream error: {e}"))),
                None => {
                    return Err(ProxyError::transport(
                        "Event stream closed before the endpoint event",
                    ))
                }
            };

            let mut endpoint = None;
            for event in parser.feed(&chunk) {
                if endpoint.is_none() && event.event_type() == "endpoint" {
                    endpoint = Some(resolve_endpoint(&url, event.data.trim())?);
                } else {
                    backlog.push_back(event);
                }
            }
            if let Some(endpoint) = endpoint {
                break endpoint;
            }
        };

        debug!(endpoint = %endpoint, "Event stream ready");

        let (sink, events) = EventSink::channel();
        let cancel = CancellationToken::new();

        let reader_sink = sink.clone();
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            if read_event_stream(body, parser, backlog, reader_sink.clone(), reader_cancel).await {
                debug!("Event stream ended");
                reader_sink.close();
            }
        });

        Ok(Self {
            client,
            endpoint,
            headers,
            sink,
            events,
            cancel,
        })
    }

    /// URL client messages are posted to.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

/// Resolve the announced endpoint against the stream URL.
///
/// The endpoint must stay on the same origin as the stream.
fn resolve_endpoint(base: &Url, announced: &str) -> ProxyResult<Url> {
    let endpoint = base
        .join(announced)
        .map_err(|e| ProxyError::transport(format!("Invalid endpoint '{announced}': {e}")))?;
    if endpoint.origin() != base.origin() {
        return Err(ProxyError::transport(format!(
            "Endpoint origin does not match connection origin: {}",
            endpoint.origin().ascii_serialization()
        )));
    }
    Ok(endpoint)
}

#[async_trait]
impl Transport for SseClientTransport {
    fn name(&self) -> &'static str {
        "sse"
    }

    async fn send(&self, message: Message) -> ProxyResult<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(message.to_json())
            .send()
            .await
            .map_err(request_error)?;
        ensure_success(response, "POST to endpoint").await?;
        Ok(())
    }

    async fn close(&self) -> ProxyResult<()> {
        self.cancel.cancel();
        if self.sink.close() {
            debug!(endpoint = %self.endpoint, "Closed event stream");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::http::build_client;
    use crate::transport::TransportEvent;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> Client {
        build_client(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_resolve_endpoint() {
        let base = Url::parse("https://example.com/sse").unwrap();
        assert_eq!(
            resolve_endpoint(&base, "/message?sessionId=1").unwrap().as_str(),
            "https://example.com/message?sessionId=1"
        );
        assert!(resolve_endpoint(&base, "https://evil.example/message").is_err());
    }

    #[tokio::test]
    async fn test_connect_reads_endpoint_and_messages() {
        let server = MockServer::start().await;
        let body = "event: endpoint\ndata: /message?sessionId=abc\n\n\
                    event: message\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"hello\"}\n\n";
        Mock::given(method("GET"))
            .and(path("/sse"))
            .and(header("accept", "text/event-stream"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/message"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/sse", server.uri())).unwrap();
        let transport = SseClientTransport::connect(client(), url, HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(transport.endpoint().path(), "/message");

        let mut events = transport.events().unwrap();
        match events.recv().await {
            Some(TransportEvent::Message(m)) => assert_eq!(m.method(), Some("hello")),
            other => panic!("unexpected event: {other:?}"),
        }

        transport
            .send(Message::new(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})))
            .await
            .unwrap();
        transport.close().await.unwrap();
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_connect_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/sse", server.uri())).unwrap();
        let err = SseClientTransport::connect(client(), url, HeaderMap::new())
            .await
            .err()
            .unwrap();
        assert!(err.is_auth_required());
    }

    #[tokio::test]
    async fn test_connect_without_endpoint_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("data: {}\n\n", "text/event-stream"),
            )
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/sse", server.uri())).unwrap();
        let err = SseClientTransport::connect(client(), url, HeaderMap::new())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("endpoint"));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let url = Url::parse("http://127.0.0.1:1/sse").unwrap();
        let result = SseClientTransport::connect(client(), url, HeaderMap::new()).await;
        assert!(result.is_err());
    }
}
