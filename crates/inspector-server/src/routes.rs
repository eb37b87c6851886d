//! HTTP routes.

use crate::connect;
use crate::error::ApiError;
use crate::oauth;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::HeaderName,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use inspector_proxy::SessionInfo;
use serde::Serialize;
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, Span};

/// Create the front door router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(connect::SESSION_ID_HEADER)]);

    Router::new()
        // Server info
        .route("/health", get(health))
        .route("/config", get(get_config))
        .route("/port", get(get_port))
        // Sessions
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", delete(close_session))
        .route("/sse", get(connect::open_event_stream))
        .route("/stdio", get(connect::open_event_stream))
        .route("/message", post(connect::post_message))
        .route(
            "/mcp",
            post(connect::post_stream)
                .get(connect::get_stream)
                .delete(connect::delete_stream),
        )
        // Authorization
        .route("/oauth/metadata", get(oauth::fetch_metadata))
        .route(
            "/oauth/flows",
            post(oauth::start_flow)
                .get(oauth::get_flow)
                .delete(oauth::delete_flow),
        )
        .route("/oauth/flows/next", post(oauth::next_step))
        .route("/oauth/flows/code", post(oauth::submit_code))
        .route("/oauth/flows/refresh", post(oauth::refresh_tokens))
        .layer(cors)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        uri = %request.uri(),
                    )
                })
                .on_request(|request: &axum::http::Request<_>, _span: &Span| {
                    info!(
                        method = %request.method(),
                        path = %request.uri().path(),
                        "request"
                    );
                })
                .on_response(
                    |response: &axum::http::Response<_>, latency: Duration, _span: &Span| {
                        info!(
                            status = %response.status(),
                            latency = ?latency,
                            "response"
                        );
                    },
                ),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    active_sessions: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_sessions: state.proxy.active_connections(),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigResponse {
    default_environment: std::collections::HashMap<String, String>,
    default_command: String,
    /// Shell-quoted, as the UI shows it in a single text field.
    default_args: String,
    default_transport: String,
    default_server_url: String,
}

async fn get_config(State(state): State<AppState>) -> Json<ConfigResponse> {
    let config = &state.config;
    Json(ConfigResponse {
        default_environment: config.default_env(),
        default_command: config.default_command().unwrap_or_default().to_string(),
        default_args: shell_words::join(config.default_args()),
        default_transport: config.default_transport().unwrap_or_default().to_string(),
        default_server_url: config.default_server_url().unwrap_or_default().to_string(),
    })
}

#[derive(Debug, Serialize)]
struct PortResponse {
    port: u16,
}

async fn get_port(State(state): State<AppState>) -> Json<PortResponse> {
    Json(PortResponse { port: state.port() })
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.proxy.list_sessions())
}

#[derive(Debug, Serialize)]
struct SuccessResponse {
    success: bool,
}

async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, ApiError> {
    if !state.proxy.close_connection(&id).await {
        return Err(ApiError::session_not_found());
    }
    info!(session = %id, "Session closed on request");
    Ok(Json(SuccessResponse { success: true }))
}
