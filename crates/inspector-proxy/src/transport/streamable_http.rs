//! Bidirectional HTTP stream client transport.
//!
//! Each outgoing message is a `POST`. The server answers with `202 Accepted`,
//! a JSON body (one message or a batch) or an event stream that carries the
//! responses. Once the session is initialized a standalone `GET` event stream
//! is opened for server-initiated traffic.

use super::http::{
    ensure_success, has_content_type, read_event_stream, request_error, SESSION_ID_HEADER,
};
use super::{EventReceiver, EventSink, EventSubscription, Transport};
use crate::error::{ProxyError, ProxyResult};
use crate::message::Message;
use crate::sse::SseParser;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use std::collections::VecDeque;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

/// `Accept` header for requests that may be answered either way.
pub const STREAMABLE_ACCEPT: &str = "application/json, text/event-stream";

/// Transport to a server exposing a bidirectional HTTP stream endpoint.
pub struct StreamableHttpClientTransport {
    client: Client,
    url: Url,
    headers: HeaderMap,
    session_id: RwLock<Option<String>>,
    sink: EventSink,
    events: EventSubscription,
    cancel: CancellationToken,
}

impl StreamableHttpClientTransport {
    /// Prepare the transport. No request is made until the first send.
    pub fn new(client: Client, url: Url, headers: HeaderMap) -> Self {
        let (sink, events) = EventSink::channel();
        Self {
            client,
            url,
            headers,
            session_id: RwLock::new(None),
            sink,
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Session id assigned by the server, once known.
    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    async fn request_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        if let Some(id) = self.session_id.read().await.as_deref() {
            if let Ok(value) = HeaderValue::from_str(id) {
                headers.insert(SESSION_ID_HEADER, value);
            }
        }
        headers
    }

    /// Open the standalone event stream in the background.
    ///
    /// Servers that do not offer one answer 405, which is not an error.
    async fn open_standalone_stream(&self) {
        let request = self
            .client
            .get(self.url.clone())
            .headers(self.request_headers().await)
            .header(ACCEPT, "text/event-stream");
        let sink = self.sink.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    sink.error(format!("Failed to open event stream: {e}"));
                    return;
                }
            };

            if response.status() == StatusCode::METHOD_NOT_ALLOWED {
                debug!("Server does not offer a standalone event stream");
                return;
            }

            match ensure_success(response, "Standalone event stream").await {
                Ok(response) => {
                    let body = Box::pin(response.bytes_stream());
                    read_event_stream(body, SseParser::new(), VecDeque::new(), sink, cancel).await;
                }
                Err(e) => sink.error(e.to_string()),
            }
        });
    }

    /// Ask the server to end its session. Failures are only logged.
    async fn terminate_session(&self) {
        let Some(id) = self.session_id().await else {
            return;
        };
        let result = self
            .client
            .delete(self.url.clone())
            .headers(self.headers.clone())
            .header(SESSION_ID_HEADER, id.as_str())
            .send()
            .await;
        match result {
            Ok(response)
                if response.status().is_success()
                    || response.status() == StatusCode::METHOD_NOT_ALLOWED => {}
            Ok(response) => {
                warn!(session = %id, status = %response.status(), "Server rejected session termination")
            }
            Err(e) => warn!(session = %id, error = %e, "Failed to terminate server session"),
        }
    }
}

#[async_trait]
impl Transport for StreamableHttpClientTransport {
    fn name(&self) -> &'static str {
        "streamable-http"
    }

    async fn send(&self, message: Message) -> ProxyResult<()> {
        self.sink.ensure_open()?;

        let is_initialized = message.method() == Some("notifications/initialized");

        let response = self
            .client
            .post(self.url.clone())
            .headers(self.request_headers().await)
            .header(ACCEPT, STREAMABLE_ACCEPT)
            .header(CONTENT_TYPE, "application/json")
            .body(message.to_json())
            .send()
            .await
            .map_err(request_error)?;

        if let Some(id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.write().await = Some(id.to_string());
        }

        let response = ensure_success(response, "POST").await?;

        if response.status() == StatusCode::ACCEPTED {
            if is_initialized {
                self.open_standalone_stream().await;
            }
            return Ok(());
        }

        if has_content_type(&response, "text/event-stream") {
            let body = Box::pin(response.bytes_stream());
            let sink = self.sink.clone();
            let cancel = self.cancel.clone();
            // Responses may trail behind later sends; reading inline would stall the pump.
            tokio::spawn(async move {
                read_event_stream(body, SseParser::new(), VecDeque::new(), sink, cancel).await;
            });
            return Ok(());
        }

        if has_content_type(&response, "application/json") {
            let text = response.text().await.map_err(request_error)?;
            for message in Message::parse_batch(&text)? {
                self.sink.message(message);
            }
            return Ok(());
        }

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if text.trim().is_empty() {
            return Ok(());
        }
        Err(ProxyError::transport(format!(
            "Unexpected content type in response ({status})"
        )))
    }

    async fn close(&self) -> ProxyResult<()> {
        if self.sink.is_closed() {
            return Ok(());
        }
        self.cancel.cancel();
        self.terminate_session().await;
        self.sink.close();
        debug!(url = %self.url, "Closed streamable HTTP transport");
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
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn transport(server: &MockServer) -> StreamableHttpClientTransport {
        let url = Url::parse(&format!("{}/mcp", server.uri())).unwrap();
        StreamableHttpClientTransport::new(
            build_client(Duration::from_secs(5)).unwrap(),
            url,
            HeaderMap::new(),
        )
    }

    fn initialize() -> Message {
        Message::new(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}))
    }

    #[tokio::test]
    async fn test_json_response_and_session_capture() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(header("accept", STREAMABLE_ACCEPT))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("mcp-session-id", "server-session")
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {}})),
            )
            .mount(&server)
            .await;

        let transport = transport(&server).await;
        let mut events = transport.events().unwrap();
        transport.send(initialize()).await.unwrap();

        assert_eq!(transport.session_id().await.as_deref(), Some("server-session"));
        match events.recv().await {
            Some(TransportEvent::Message(m)) => assert!(m.is_response()),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_event_stream_response() {
        let server = MockServer::start().await;
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n\
                    data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n\n";
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let transport = transport(&server).await;
        let mut events = transport.events().unwrap();
        transport.send(initialize()).await.unwrap();

        match events.recv().await {
            Some(TransportEvent::Message(m)) => assert!(m.is_notification()),
            other => panic!("unexpected event: {other:?}"),
        }
        match events.recv().await {
            Some(TransportEvent::Message(m)) => assert!(m.is_response()),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_session_id_is_echoed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header_exists("mcp-session-id"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("mcp-session-id", "s-1")
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {}})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;

        let transport = transport(&server).await;
        transport.send(initialize()).await.unwrap();
        transport
            .send(Message::new(
                json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unauthorized_send() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let transport = transport(&server).await;
        let err = transport.send(initialize()).await.unwrap_err();
        assert!(err.is_auth_required());
    }

    #[tokio::test]
    async fn test_close_terminates_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("mcp-session-id", "s-2")
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {}})),
            )
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(header("mcp-session-id", "s-2"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let transport = transport(&server).await;
        let mut events = transport.events().unwrap();
        transport.send(initialize()).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        assert!(transport.is_closed());
        assert!(matches!(transport.send(initialize()).await, Err(ProxyError::Closed)));

        let mut saw_closed = 0;
        while let Ok(event) = events.try_recv() {
            if event == TransportEvent::Closed {
                saw_closed += 1;
            }
        }
        assert_eq!(saw_closed, 1);
    }
}
