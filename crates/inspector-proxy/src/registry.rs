//! Session registry.
//!
//! The registry is the only shared mutable state in the proxy. It owns every
//! live session's legs and bookkeeping, enforces the session ceiling, and
//! guarantees each session is torn down exactly once however many triggers
//! race to close it.

use crate::error::{ProxyError, ProxyResult};
use crate::inbound::InboundTransport;
use crate::lock;
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default ceiling on concurrent sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 50;

/// Default bound on closing an outbound leg.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

const EVENT_CAPACITY: usize = 256;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionStatus {
    /// Whether a session may move from `self` to `next`.
    ///
    /// Statuses only move forward. Re-asserting the current status is allowed
    /// and only refreshes the activity timestamp.
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        self == next
            || matches!(
                (self, next),
                (Connecting, Connected | Error | Disconnected)
                    | (Connected, Disconnected | Error)
                    | (Error, Disconnected)
            )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub status: ConnectionStatus,
    pub error_count: u64,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Transport label of the server-facing leg.
    pub transport: String,
    pub has_inbound: bool,
}

/// Something that happened to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    Registered {
        id: String,
    },
    StatusChanged {
        id: String,
        status: ConnectionStatus,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        id: String,
        message: String,
        error_count: u64,
    },
    Disconnected {
        id: String,
    },
}

struct SessionEntry {
    inbound: watch::Sender<Option<InboundTransport>>,
    outbound: Arc<dyn Transport>,
    status: ConnectionStatus,
    error_count: u64,
    last_activity: DateTime<Utc>,
    created_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl SessionEntry {
    fn info(&self, id: &str) -> SessionInfo {
        SessionInfo {
            id: id.to_string(),
            status: self.status,
            error_count: self.error_count,
            last_activity: self.last_activity,
            created_at: self.created_at,
            transport: self.outbound.name().to_string(),
            has_inbound: self.inbound.borrow().is_some(),
        }
    }
}

pub(crate) struct PumpHandles {
    pub outbound: Arc<dyn Transport>,
    pub inbound: watch::Receiver<Option<InboundTransport>>,
    pub cancel: CancellationToken,
}

/// Registry of live sessions.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    /// Ids with a teardown in flight, each flipping to `true` when done.
    closing: Mutex<HashMap<String, watch::Receiver<bool>>>,
    max_sessions: AtomicUsize,
    close_timeout: Duration,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionRegistry {
    /// Create a registry admitting at most `max_sessions` sessions.
    pub fn new(max_sessions: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sessions: Mutex::new(HashMap::new()),
            closing: Mutex::new(HashMap::new()),
            max_sessions: AtomicUsize::new(max_sessions),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            events,
        }
    }

    /// Bound how long an outbound close may take.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Current session ceiling.
    pub fn max_sessions(&self) -> usize {
        self.max_sessions.load(Ordering::SeqCst)
    }

    /// Change the session ceiling.
    ///
    /// Only admission is affected. Sessions already registered stay up even
    /// when they exceed the new ceiling.
    pub fn set_max_sessions(&self, max: usize) {
        let previous = self.max_sessions.swap(max, Ordering::SeqCst);
        if previous != max {
            info!(previous, max, "Session ceiling changed");
        }
    }

    /// Fail with [`ProxyError::Capacity`] when no new session may be admitted.
    pub fn ensure_capacity(&self) -> ProxyResult<()> {
        let max = self.max_sessions();
        if lock(&self.sessions).len() >= max {
            return Err(ProxyError::Capacity { max });
        }
        Ok(())
    }

    /// Store a new session with status `connecting`.
    ///
    /// Returns the token cancelled when the session is torn down.
    pub fn register(
        &self,
        id: impl Into<String>,
        inbound: Option<InboundTransport>,
        outbound: Arc<dyn Transport>,
    ) -> ProxyResult<CancellationToken> {
        let id = id.into();
        let max = self.max_sessions();
        let cancel = CancellationToken::new();

        {
            let mut sessions = lock(&self.sessions);
            if sessions.len() >= max {
                return Err(ProxyError::Capacity { max });
            }
            if sessions.contains_key(&id) || lock(&self.closing).contains_key(&id) {
                return Err(ProxyError::Conflict(format!("Session {id} already exists")));
            }
            let now = Utc::now();
            sessions.insert(
                id.clone(),
                SessionEntry {
                    inbound: watch::channel(inbound).0,
                    outbound,
                    status: ConnectionStatus::Connecting,
                    error_count: 0,
                    last_activity: now,
                    created_at: now,
                    cancel: cancel.clone(),
                },
            );
        }

        info!(session = %id, "Session registered");
        self.emit(SessionEvent::Registered { id });
        Ok(cancel)
    }

    /// Attach the browser-facing leg to a session registered without one.
    pub fn attach_inbound(&self, id: &str, inbound: InboundTransport) -> ProxyResult<()> {
        let mut sessions = lock(&self.sessions);
        let entry = sessions
            .get_mut(id)
            .ok_or_else(|| ProxyError::SessionNotFound(id.to_string()))?;
        if entry.inbound.borrow().is_some() {
            return Err(ProxyError::Conflict(format!(
                "Session {id} already has a browser connection"
            )));
        }
        entry.inbound.send_replace(Some(inbound));
        entry.last_activity = Utc::now();
        Ok(())
    }

    /// Everything the pump needs to drive a session.
    pub(crate) fn pump_handles(&self, id: &str) -> Option<PumpHandles> {
        lock(&self.sessions).get(id).map(|e| PumpHandles {
            outbound: e.outbound.clone(),
            inbound: e.inbound.subscribe(),
            cancel: e.cancel.clone(),
        })
    }

    /// The server-facing leg of a session.
    pub fn outbound(&self, id: &str) -> Option<Arc<dyn Transport>> {
        lock(&self.sessions).get(id).map(|e| e.outbound.clone())
    }

    /// The browser-facing leg of a session.
    pub fn inbound(&self, id: &str) -> Option<InboundTransport> {
        lock(&self.sessions)
            .get(id)
            .and_then(|e| e.inbound.borrow().clone())
    }

    /// Move a session to a new status. Returns whether the status was applied.
    ///
    /// Unknown sessions and backward moves are ignored.
    pub fn update_status(&self, id: &str, status: ConnectionStatus) -> bool {
        let changed = {
            let mut sessions = lock(&self.sessions);
            let Some(entry) = sessions.get_mut(id) else {
                return false;
            };
            if !entry.status.can_transition_to(status) {
                debug!(session = %id, from = %entry.status, to = %status, "Ignoring status change");
                return false;
            }
            entry.last_activity = Utc::now();
            let changed = entry.status != status;
            entry.status = status;
            changed
        };

        if changed {
            debug!(session = %id, status = %status, "Session status changed");
            self.emit(SessionEvent::StatusChanged {
                id: id.to_string(),
                status,
            });
        }
        true
    }

    /// Bump a session's error count. Returns the new count.
    pub fn increment_error_count(&self, id: &str) -> Option<u64> {
        let mut sessions = lock(&self.sessions);
        let entry = sessions.get_mut(id)?;
        entry.error_count += 1;
        Some(entry.error_count)
    }

    /// Record a runtime error: count it, mark the session `error` and notify
    /// observers. The session stays registered.
    pub fn record_error(&self, id: &str, message: impl Into<String>) {
        let message = message.into();
        let Some(error_count) = self.increment_error_count(id) else {
            return;
        };
        warn!(session = %id, error = %message, error_count, "Session error");
        self.update_status(id, ConnectionStatus::Error);
        self.emit(SessionEvent::Error {
            id: id.to_string(),
            message,
            error_count,
        });
    }

    /// Refresh a session's activity timestamp.
    pub fn touch(&self, id: &str) {
        if let Some(entry) = lock(&self.sessions).get_mut(id) {
            entry.last_activity = Utc::now();
        }
    }

    /// Snapshot of one session.
    pub fn session_info(&self, id: &str) -> Option<SessionInfo> {
        lock(&self.sessions).get(id).map(|e| e.info(id))
    }

    /// Snapshots of all sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = lock(&self.sessions)
            .iter()
            .map(|(id, e)| e.info(id))
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        infos
    }

    /// Ids of all sessions.
    pub fn ids(&self) -> Vec<String> {
        lock(&self.sessions).keys().cloned().collect()
    }

    /// Whether a session is registered.
    pub fn contains(&self, id: &str) -> bool {
        lock(&self.sessions).contains_key(id)
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Tear a session down.
    ///
    /// Concurrent calls for the same id collapse into one teardown, and every
    /// caller resolves only once it has finished. The outbound leg is closed
    /// first (bounded, failures logged), then the inbound leg, then the entry
    /// is removed and `Disconnected` is emitted.
    /// Returns `true` for the call that removed the session.
    pub async fn close(&self, id: &str) -> bool {
        let guard = {
            let mut closing = lock(&self.closing);
            match closing.get(id) {
                Some(done) => Err(done.clone()),
                None => {
                    let (done, finished) = watch::channel(false);
                    closing.insert(id.to_string(), finished);
                    Ok(ClosingGuard {
                        closing: &self.closing,
                        id,
                        done,
                    })
                }
            }
        };
        let guard = match guard {
            Ok(guard) => guard,
            Err(mut finished) => {
                debug!(session = %id, "Close already in progress, waiting for it");
                // A dropped sender means the other teardown was abandoned.
                let _ = finished.wait_for(|done| *done).await;
                return false;
            }
        };

        let legs = lock(&self.sessions).get(id).map(|entry| {
            entry.cancel.cancel();
            (entry.outbound.clone(), entry.inbound.borrow().clone())
        });

        let removed = match legs {
            Some((outbound, inbound)) => {
                self.close_legs(id, outbound, inbound).await;
                lock(&self.sessions).remove(id).is_some()
            }
            None => false,
        };

        drop(guard);

        if removed {
            info!(session = %id, "Session closed");
            self.emit(SessionEvent::Disconnected { id: id.to_string() });
        }
        removed
    }

    async fn close_legs(
        &self,
        id: &str,
        outbound: Arc<dyn Transport>,
        inbound: Option<InboundTransport>,
    ) {
        match tokio::time::timeout(self.close_timeout, outbound.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session = %id, error = %e, "Failed to close server connection"),
            Err(_) => warn!(
                session = %id,
                timeout = ?self.close_timeout,
                "Timed out closing server connection"
            ),
        }

        if let Some(inbound) = inbound {
            if let Err(e) = inbound.transport().close().await {
                debug!(session = %id, error = %e, "Failed to close browser connection");
            }
        }
    }

    /// Close every session and wait for all teardowns to finish.
    pub async fn close_all(&self) -> usize {
        let ids = self.ids();
        let closed = join_all(ids.iter().map(|id| self.close(id)))
            .await
            .into_iter()
            .filter(|removed| *removed)
            .count();
        info!(closed, "All sessions closed");
        closed
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

/// Clears the in-flight marker and wakes waiting closers, even when the
/// teardown future is dropped part way.
struct ClosingGuard<'a> {
    closing: &'a Mutex<HashMap<String, watch::Receiver<bool>>>,
    id: &'a str,
    done: watch::Sender<bool>,
}

impl Drop for ClosingGuard<'_> {
    fn drop(&mut self) {
        lock(self.closing).remove(self.id);
        let _ = self.done.send(true);
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SESSIONS)
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .field("max_sessions", &self.max_sessions())
            .field("close_timeout", &self.close_timeout)
            .finish()
    }
}
