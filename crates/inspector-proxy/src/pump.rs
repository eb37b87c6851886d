//! Message pump.
//!
//! Each session runs two tasks, one per direction. Messages are forwarded
//! unmodified and in order. Runtime errors are recorded on the session; a
//! close on either leg tears the whole session down through the registry.

use crate::error::{ProxyError, ProxyResult};
use crate::inbound::InboundTransport;
use crate::message::{Message, PROXY_ERROR_CODE};
use crate::registry::{ConnectionStatus, SessionRegistry};
use crate::transport::{EventReceiver, Transport, TransportEvent};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct Session {
    registry: Arc<SessionRegistry>,
    id: String,
    cancel: CancellationToken,
}

/// What a pump loop should do after an event.
enum Flow {
    Continue,
    Stop,
}

impl Session {
    async fn close(&self, leg: &str) {
        info!(session = %self.id, leg, "Leg closed, tearing down session");
        self.registry.close(&self.id).await;
    }

    fn error(&self, leg: &str, error: String) {
        debug!(session = %self.id, leg, error = %error, "Leg reported an error");
        self.registry.record_error(&self.id, error);
    }
}

/// Start pumping a registered session.
///
/// Server traffic is buffered until a browser leg is attached and ready.
pub(crate) fn spawn(registry: Arc<SessionRegistry>, id: &str) -> ProxyResult<()> {
    let handles = registry
        .pump_handles(id)
        .ok_or_else(|| ProxyError::SessionNotFound(id.to_string()))?;
    let events = handles
        .outbound
        .events()
        .ok_or_else(|| ProxyError::transport("Server events already taken"))?;

    let session = Session {
        registry,
        id: id.to_string(),
        cancel: handles.cancel,
    };
    tokio::spawn(server_to_browser(session, handles.outbound, events, handles.inbound));
    Ok(())
}

async fn server_to_browser(
    session: Session,
    outbound: Arc<dyn Transport>,
    mut events: EventReceiver,
    inbound: watch::Receiver<Option<InboundTransport>>,
) {
    let mut backlog = VecDeque::new();

    let Some(inbound) = wait_for_browser(&session, &mut events, inbound, &mut backlog).await else {
        return;
    };
    let browser = inbound.transport();

    let Some(browser_events) = browser.events() else {
        session.error("browser", "Browser events already taken".to_string());
        session.close("browser").await;
        return;
    };

    session
        .registry
        .update_status(&session.id, ConnectionStatus::Connected);
    info!(session = %session.id, buffered = backlog.len(), "Session connected");

    tokio::spawn(browser_to_server(
        Session {
            registry: session.registry.clone(),
            id: session.id.clone(),
            cancel: session.cancel.clone(),
        },
        browser.clone(),
        outbound,
        browser_events,
    ));

    for message in backlog {
        deliver_to_browser(&session, browser.as_ref(), message).await;
    }

    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => return,
            event = events.recv() => {
                let flow = match event {
                    Some(TransportEvent::Message(message)) => {
                        deliver_to_browser(&session, browser.as_ref(), message).await;
                        Flow::Continue
                    }
                    Some(TransportEvent::Error(error)) => {
                        session.error("server", error);
                        Flow::Continue
                    }
                    Some(TransportEvent::Closed) | None => Flow::Stop,
                };
                if let Flow::Stop = flow {
                    session.close("server").await;
                    return;
                }
            }
        }
    }
}

/// Buffer server traffic until the browser leg is attached and ready.
async fn wait_for_browser(
    session: &Session,
    events: &mut EventReceiver,
    mut inbound: watch::Receiver<Option<InboundTransport>>,
    backlog: &mut VecDeque<Message>,
) -> Option<InboundTransport> {
    let attached = loop {
        if let Some(attached) = inbound.borrow_and_update().clone() {
            break attached;
        }
        tokio::select! {
            _ = session.cancel.cancelled() => return None,
            changed = inbound.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
            event = events.recv() => {
                if let Flow::Stop = buffer(session, event, backlog) {
                    session.close("server").await;
                    return None;
                }
            }
        }
    };

    let browser = attached.transport();
    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => return None,
            _ = browser.ready() => return Some(attached),
            event = events.recv() => {
                if let Flow::Stop = buffer(session, event, backlog) {
                    session.close("server").await;
                    return None;
                }
            }
        }
    }
}

fn buffer(session: &Session, event: Option<TransportEvent>, backlog: &mut VecDeque<Message>) -> Flow {
    match event {
        Some(TransportEvent::Message(message)) => {
            backlog.push_back(message);
            Flow::Continue
        }
        Some(TransportEvent::Error(error)) => {
            session.error("server", error);
            Flow::Continue
        }
        Some(TransportEvent::Closed) | None => Flow::Stop,
    }
}

async fn deliver_to_browser(session: &Session, browser: &dyn Transport, message: Message) {
    session.registry.touch(&session.id);
    if let Err(e) = browser.send(message).await {
        session.error("browser", format!("Failed to deliver to browser: {e}"));
    }
}

async fn browser_to_server(
    session: Session,
    browser: Arc<dyn Transport>,
    outbound: Arc<dyn Transport>,
    mut events: EventReceiver,
) {
    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => return,
            event = events.recv() => match event {
                Some(TransportEvent::Message(message)) => {
                    session.registry.touch(&session.id);
                    let request_id = message.is_request().then(|| message.id().cloned()).flatten();
                    if let Err(e) = outbound.send(message).await {
                        let cause = e.to_string();
                        session.error("server", cause.clone());
                        if let Some(id) = request_id {
                            let reply = Message::error_response(id, PROXY_ERROR_CODE, cause);
                            if let Err(e) = browser.send(reply).await {
                                debug!(session = %session.id, error = %e, "Failed to report delivery failure");
                            }
                        }
                    }
                }
                Some(TransportEvent::Error(error)) => session.error("browser", error),
                Some(TransportEvent::Closed) | None => {
                    session.close("browser").await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionEvent;
    use crate::transport::MemoryTransport;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        registry: Arc<SessionRegistry>,
        /// The protocol server's end of the outbound pipe.
        server: MemoryTransport,
        server_events: EventReceiver,
    }

    fn start() -> Harness {
        let registry = Arc::new(SessionRegistry::default());
        let (outbound, server) = MemoryTransport::pair();
        let server_events = server.events().unwrap();
        registry.register("s", None, Arc::new(outbound)).unwrap();
        spawn(registry.clone(), "s").unwrap();
        Harness {
            registry,
            server,
            server_events,
        }
    }

    fn attach(harness: &Harness) -> (MemoryTransport, EventReceiver) {
        let (inbound, browser) = MemoryTransport::pair();
        let browser_events = browser.events().unwrap();
        harness
            .registry
            .attach_inbound("s", InboundTransport::Custom(Arc::new(inbound)))
            .unwrap();
        (browser, browser_events)
    }

    async fn next_message(events: &mut EventReceiver) -> Message {
        match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Some(TransportEvent::Message(m))) => m,
            other => panic!("unexpected event: {other:?}"),
        }
    }

    fn note(n: i64) -> Message {
        Message::new(json!({"jsonrpc": "2.0", "method": "n", "params": {"n": n}}))
    }

    #[tokio::test]
    async fn test_server_traffic_is_buffered_until_attach() {
        let harness = start();
        harness.server.send(note(1)).await.unwrap();
        harness.server.send(note(2)).await.unwrap();
        tokio::task::yield_now().await;

        let (_browser, mut browser_events) = attach(&harness);
        assert_eq!(next_message(&mut browser_events).await, note(1));
        assert_eq!(next_message(&mut browser_events).await, note(2));

        harness.server.send(note(3)).await.unwrap();
        assert_eq!(next_message(&mut browser_events).await, note(3));
        assert_eq!(
            harness.registry.session_info("s").unwrap().status,
            ConnectionStatus::Connected
        );
    }

    #[tokio::test]
    async fn test_browser_traffic_reaches_server() {
        let mut harness = start();
        let (browser, _browser_events) = attach(&harness);

        browser.send(note(1)).await.unwrap();
        browser.send(note(2)).await.unwrap();
        assert_eq!(next_message(&mut harness.server_events).await, note(1));
        assert_eq!(next_message(&mut harness.server_events).await, note(2));
    }

    #[tokio::test]
    async fn test_server_error_is_recorded_without_teardown() {
        let registry = Arc::new(SessionRegistry::default());
        let (outbound, _server) = MemoryTransport::pair();
        let outbound = Arc::new(outbound);
        registry.register("s", None, outbound.clone()).unwrap();
        spawn(registry.clone(), "s").unwrap();
        let mut events = registry.subscribe();

        outbound.fail("bad frame");
        loop {
            let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let SessionEvent::Error { message, error_count, .. } = event {
                assert_eq!(message, "bad frame");
                assert_eq!(error_count, 1);
                break;
            }
        }

        let info = registry.session_info("s").unwrap();
        assert_eq!(info.status, ConnectionStatus::Error);
        assert!(registry.contains("s"));
    }

    #[tokio::test]
    async fn test_browser_close_tears_down_session() {
        let harness = start();
        let (browser, _browser_events) = attach(&harness);
        let mut events = harness.registry.subscribe();

        browser.close().await.unwrap();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(event, SessionEvent::Disconnected { .. }) {
                break;
            }
        }
        assert!(!harness.registry.contains("s"));
        assert!(harness.server.is_closed());
    }

    #[tokio::test]
    async fn test_server_close_tears_down_session() {
        let harness = start();
        let (browser, _browser_events) = attach(&harness);

        harness.server.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while harness.registry.contains("s") {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(browser.is_closed());
    }

    #[tokio::test]
    async fn test_undeliverable_request_is_answered_with_error() {
        let harness = start();
        let (browser, mut browser_events) = attach(&harness);
        let Harness {
            registry,
            server,
            server_events,
        } = harness;

        // With the server's end gone, sends on the outbound leg fail.
        drop(server_events);
        drop(server);

        let request = Message::new(json!({"jsonrpc": "2.0", "id": 9, "method": "tools/list"}));
        browser.send(request).await.unwrap();

        let reply = next_message(&mut browser_events).await;
        assert!(reply.is_response());
        assert_eq!(reply.id(), Some(&json!(9)));
        assert_eq!(reply.as_value()["error"]["code"], json!(PROXY_ERROR_CODE));
        assert!(registry.session_info("s").unwrap().error_count >= 1);
    }
}
