//! Authorization routes.
//!
//! One [`AuthFlow`] is kept per protocol server URL. The UI drives it one
//! step at a time and renders the returned snapshot.

use crate::error::ApiError;
use crate::state::AppState;
use axum::{
    extract::{Query, State},
    response::Json,
};
use inspector_auth::{discovery, AuthFlow, FlowSnapshot, OAuthTokens, StepError, StepOutcome};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use url::Url;

#[derive(Debug, Deserialize)]
pub struct MetadataQuery {
    pub url: Option<String>,
}

/// GET /oauth/metadata - fetch authorization metadata on the browser's behalf.
pub async fn fetch_metadata(
    State(state): State<AppState>,
    Query(query): Query<MetadataQuery>,
) -> Result<Json<Value>, ApiError> {
    let raw = query
        .url
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ApiError::bad_request("Missing url parameter"))?;
    let url = Url::parse(&raw).map_err(|_| ApiError::bad_request("Invalid URL format"))?;
    if url.scheme() != "https" {
        return Err(ApiError::bad_request("Only HTTPS URLs are allowed"));
    }

    let metadata = discovery::fetch_metadata(&state.http, &url).await?;
    Ok(Json(metadata))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowQuery {
    pub server_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeRequest {
    pub server_url: String,
    pub code: String,
}

/// Result of running one step.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResponse {
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub flow: FlowSnapshot,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub success: bool,
}

/// POST /oauth/flows - start a flow, or restart an existing one.
pub async fn start_flow(
    State(state): State<AppState>,
    Json(request): Json<FlowQuery>,
) -> Result<Json<FlowSnapshot>, ApiError> {
    let key = flow_key(&request.server_url)?;

    let existing = {
        let mut flows = state.flows.write().await;
        match flows.get(&key) {
            Some(flow) => flow.clone(),
            None => {
                let flow =
                    AuthFlow::new(&key, state.config.flow_config(), state.credentials.clone())?;
                let snapshot = flow.snapshot();
                flows.insert(key.clone(), Arc::new(Mutex::new(flow)));
                info!(server = %key, "Authorization flow started");
                return Ok(Json(snapshot));
            }
        }
    };

    let mut flow = existing.lock().await;
    flow.reset().await?;
    info!(server = %key, "Authorization flow restarted");
    Ok(Json(flow.snapshot()))
}

/// GET /oauth/flows - the current view of a flow.
pub async fn get_flow(
    State(state): State<AppState>,
    Query(query): Query<FlowQuery>,
) -> Result<Json<FlowSnapshot>, ApiError> {
    let flow = require_flow(&state, &query.server_url).await?;
    let snapshot = flow.lock().await.snapshot();
    Ok(Json(snapshot))
}

/// POST /oauth/flows/next - run the current step.
pub async fn next_step(
    State(state): State<AppState>,
    Json(request): Json<FlowQuery>,
) -> Result<Json<StepResponse>, ApiError> {
    let flow = require_flow(&state, &request.server_url).await?;
    let mut flow = flow.lock().await;

    let (outcome, error) = match flow.proceed().await {
        StepOutcome::Advanced(_) => ("advanced", None),
        StepOutcome::Failed(error) => ("failed", Some(error)),
        StepOutcome::Blocked => ("blocked", None),
    };
    Ok(Json(StepResponse {
        outcome,
        error,
        flow: flow.snapshot(),
    }))
}

/// POST /oauth/flows/code - record the code pasted by the user.
pub async fn submit_code(
    State(state): State<AppState>,
    Json(request): Json<CodeRequest>,
) -> Result<Json<FlowSnapshot>, ApiError> {
    let flow = require_flow(&state, &request.server_url).await?;
    let mut flow = flow.lock().await;
    flow.set_authorization_code(request.code);
    Ok(Json(flow.snapshot()))
}

/// POST /oauth/flows/refresh - refresh the tokens of a completed flow.
pub async fn refresh_tokens(
    State(state): State<AppState>,
    Json(request): Json<FlowQuery>,
) -> Result<Json<OAuthTokens>, ApiError> {
    let flow = require_flow(&state, &request.server_url).await?;
    let tokens = flow.lock().await.refresh().await?;
    Ok(Json(tokens))
}

/// DELETE /oauth/flows - discard a flow. Persisted credentials are kept.
pub async fn delete_flow(
    State(state): State<AppState>,
    Query(query): Query<FlowQuery>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let key = flow_key(&query.server_url)?;
    if state.flows.write().await.remove(&key).is_none() {
        return Err(ApiError::not_found("Flow not found"));
    }
    info!(server = %key, "Authorization flow discarded");
    Ok(Json(DeleteResponse { success: true }))
}

fn flow_key(server_url: &str) -> Result<String, ApiError> {
    Url::parse(server_url)
        .map(String::from)
        .map_err(|_| ApiError::bad_request("Invalid URL format"))
}

async fn find_flow(state: &AppState, key: &str) -> Option<Arc<Mutex<AuthFlow>>> {
    state.flows.read().await.get(key).cloned()
}

async fn require_flow(state: &AppState, server_url: &str) -> Result<Arc<Mutex<AuthFlow>>, ApiError> {
    let key = flow_key(server_url)?;
    find_flow(state, &key)
        .await
        .ok_or_else(|| ApiError::not_found("Flow not found"))
}
