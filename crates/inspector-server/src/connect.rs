//! Session routes.
//!
//! Browsers open sessions either as a legacy event stream (`GET /sse` or
//! `GET /stdio`, then `POST /message`) or as a bidirectional HTTP stream on
//! `/mcp`, identified by the `mcp-session-id` header.

use crate::config::InspectorConfig;
use crate::error::ApiError;
use crate::sse::outgoing_stream;
use crate::state::AppState;
use axum::{
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use inspector_proxy::{
    InboundTransport, Message, PostOutcome, ServerDescriptor, StreamableHttpServerTransport,
    TransportKind,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Header carrying the bidirectional stream session id.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Query parameters describing the server to connect to.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectQuery {
    pub transport_type: Option<String>,
    pub command: Option<String>,
    /// Shell-style argument string.
    pub args: Option<String>,
    /// JSON object of environment variables.
    pub env: Option<String>,
    pub url: Option<String>,
}

impl ConnectQuery {
    /// Build the server descriptor, falling back to the configured default server.
    pub fn descriptor(&self, config: &InspectorConfig) -> Result<ServerDescriptor, ApiError> {
        let transport = self
            .transport_type
            .as_deref()
            .or(config.default_transport())
            .ok_or_else(|| ApiError::bad_request("Missing transportType parameter"))?;
        let kind: TransportKind = transport.parse()?;

        match kind {
            TransportKind::Stdio => {
                let command = self
                    .command
                    .as_deref()
                    .or(config.default_command())
                    .ok_or_else(|| ApiError::bad_request("Missing command parameter"))?;
                let args = match (&self.args, &self.command) {
                    (Some(raw), _) => shell_words::split(raw)
                        .map_err(|e| ApiError::bad_request(format!("Invalid args: {e}")))?,
                    (None, None) => config.default_args().to_vec(),
                    (None, Some(_)) => Vec::new(),
                };

                let mut descriptor = ServerDescriptor::stdio(command, args);
                if let Some(raw) = &self.env {
                    let env: HashMap<String, String> = serde_json::from_str(raw)
                        .map_err(|e| ApiError::bad_request(format!("Invalid env: {e}")))?;
                    for (key, value) in env {
                        descriptor = descriptor.with_env(key, value);
                    }
                }
                Ok(descriptor)
            }
            TransportKind::Sse | TransportKind::StreamableHttp => {
                let url = self
                    .url
                    .as_deref()
                    .or(config.default_server_url())
                    .ok_or_else(|| ApiError::bad_request("Missing url parameter"))?;
                Ok(match kind {
                    TransportKind::Sse => ServerDescriptor::sse(url),
                    _ => ServerDescriptor::streamable_http(url),
                })
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageQuery {
    pub session_id: String,
}

/// GET /sse and GET /stdio - open a session with an event-stream browser leg.
pub async fn open_event_stream(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let descriptor = query.descriptor(&state.config)?;
    let (id, inbound, outgoing) = state
        .proxy
        .create_event_stream_connection(&descriptor, &headers)
        .await?;
    info!(session = %id, transport = %descriptor.kind(), "Event stream session opened");

    Ok(outgoing_stream(Some(inbound.endpoint().to_string()), outgoing).into_response())
}

/// POST /message - a browser message for an event-stream session.
pub async fn post_message(
    State(state): State<AppState>,
    Query(query): Query<MessageQuery>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let Some(InboundTransport::EventStream(inbound)) =
        state.proxy.get_web_app_transport(&query.session_id)
    else {
        return Err(ApiError::session_not_found());
    };

    for message in Message::split_batch(body) {
        inbound.handle_post_message(message)?;
    }
    debug!(session = %query.session_id, "Accepted browser message");
    Ok((StatusCode::ACCEPTED, "Accepted").into_response())
}

/// POST /mcp - create a bidirectional session or post to an existing one.
pub async fn post_stream(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let (id, inbound) = match session_id(&headers) {
        Some(id) => {
            let inbound = stream_transport(&state, &id)?;
            (id, inbound)
        }
        None => {
            let descriptor = query.descriptor(&state.config)?;
            let (id, inbound) = state
                .proxy
                .create_stream_upgrade_connection(&descriptor, &headers)
                .await?;
            info!(session = %id, transport = %descriptor.kind(), "Stream session opened");
            (id, inbound)
        }
    };

    let mut response = match inbound.handle_post(Message::split_batch(body))? {
        PostOutcome::Accepted => StatusCode::ACCEPTED.into_response(),
        PostOutcome::Stream(outgoing) => outgoing_stream(None, outgoing).into_response(),
    };
    with_session_header(&mut response, &id)?;
    Ok(response)
}

/// GET /mcp - the standalone stream for server-initiated messages.
pub async fn get_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let id = session_id(&headers).ok_or_else(ApiError::session_not_found)?;
    let outgoing = stream_transport(&state, &id)?.open_standalone_stream()?;

    let mut response = outgoing_stream(None, outgoing).into_response();
    with_session_header(&mut response, &id)?;
    Ok(response)
}

/// DELETE /mcp - end a bidirectional session.
pub async fn delete_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let id = session_id(&headers).ok_or_else(ApiError::session_not_found)?;
    if !state.proxy.close_connection(&id).await {
        return Err(ApiError::session_not_found());
    }
    info!(session = %id, "Stream session closed by browser");
    Ok(StatusCode::OK.into_response())
}

fn session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn stream_transport(
    state: &AppState,
    id: &str,
) -> Result<Arc<StreamableHttpServerTransport>, ApiError> {
    match state.proxy.get_web_app_transport(id) {
        Some(InboundTransport::StreamableHttp(inbound)) => Ok(inbound),
        _ => Err(ApiError::session_not_found()),
    }
}

fn with_session_header(response: &mut Response, id: &str) -> Result<(), ApiError> {
    let value = HeaderValue::from_str(id)
        .map_err(|e| ApiError::internal(format!("Invalid session id: {e}")))?;
    response.headers_mut().insert(SESSION_ID_HEADER, value);
    Ok(())
}
