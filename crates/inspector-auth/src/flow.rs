//! The guided authorization flow.
//!
//! [`FlowState`] holds one variant per step, each carrying the artifacts
//! earlier steps produced. [`transition`] is the pure step function;
//! [`AuthFlow`] performs the I/O for each step and feeds the result through it.

use crate::client::{authorization_url, exchange_authorization, refresh_authorization};
use crate::discovery::{
    authorization_server_url, discover_authorization_server_metadata,
    discover_protected_resource_metadata, select_resource_url,
};
use crate::error::{AuthError, AuthResult};
use crate::pkce::generate_state;
use crate::registration::{default_strategies, register_with, RegistrationContext, RegistrationStrategy};
use crate::storage::{CredentialScope, CredentialStore, ServerCredentials};
use crate::types::{
    ClientInformation, ClientMetadata, OAuthMetadata, OAuthTokens, ProtectedResourceMetadata,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

/// Steps in forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthStep {
    MetadataDiscovery,
    ClientRegistration,
    AuthorizationRedirect,
    AuthorizationCode,
    TokenRequest,
    Complete,
}

impl OAuthStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MetadataDiscovery => "metadata_discovery",
            Self::ClientRegistration => "client_registration",
            Self::AuthorizationRedirect => "authorization_redirect",
            Self::AuthorizationCode => "authorization_code",
            Self::TokenRequest => "token_request",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for OAuthStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What metadata discovery found.
#[derive(Debug, Clone, PartialEq)]
pub struct Discovery {
    pub auth_server_url: Url,
    pub metadata: OAuthMetadata,
    pub resource_metadata: Option<ProtectedResourceMetadata>,
    /// Why protected-resource metadata is missing, when it failed rather than was absent.
    pub resource_metadata_error: Option<String>,
    pub resource: Option<Url>,
}

impl Discovery {
    /// Scopes to request: the resource's, else the authorization server's.
    pub fn scope(&self) -> Option<String> {
        let scopes = self
            .resource_metadata
            .as_ref()
            .and_then(|m| m.scopes_supported.as_ref())
            .or(self.metadata.scopes_supported.as_ref())?;
        (!scopes.is_empty()).then(|| scopes.join(" "))
    }
}

/// Flow progress with the artifacts of each completed step.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowState {
    MetadataDiscovery,
    ClientRegistration {
        discovery: Arc<Discovery>,
    },
    AuthorizationRedirect {
        discovery: Arc<Discovery>,
        client: Arc<ClientInformation>,
    },
    AuthorizationCode {
        discovery: Arc<Discovery>,
        client: Arc<ClientInformation>,
        authorization_url: Url,
    },
    TokenRequest {
        discovery: Arc<Discovery>,
        client: Arc<ClientInformation>,
        authorization_url: Url,
        code: String,
    },
    Complete {
        discovery: Arc<Discovery>,
        client: Arc<ClientInformation>,
        tokens: Arc<OAuthTokens>,
    },
}

impl FlowState {
    pub fn step(&self) -> OAuthStep {
        match self {
            Self::MetadataDiscovery => OAuthStep::MetadataDiscovery,
            Self::ClientRegistration { .. } => OAuthStep::ClientRegistration,
            Self::AuthorizationRedirect { .. } => OAuthStep::AuthorizationRedirect,
            Self::AuthorizationCode { .. } => OAuthStep::AuthorizationCode,
            Self::TokenRequest { .. } => OAuthStep::TokenRequest,
            Self::Complete { .. } => OAuthStep::Complete,
        }
    }

    pub fn discovery(&self) -> Option<&Discovery> {
        match self {
            Self::MetadataDiscovery => None,
            Self::ClientRegistration { discovery }
            | Self::AuthorizationRedirect { discovery, .. }
            | Self::AuthorizationCode { discovery, .. }
            | Self::TokenRequest { discovery, .. }
            | Self::Complete { discovery, .. } => Some(discovery),
        }
    }

    pub fn client(&self) -> Option<&ClientInformation> {
        match self {
            Self::AuthorizationRedirect { client, .. }
            | Self::AuthorizationCode { client, .. }
            | Self::TokenRequest { client, .. }
            | Self::Complete { client, .. } => Some(client),
            _ => None,
        }
    }

    pub fn authorization_url(&self) -> Option<&Url> {
        match self {
            Self::AuthorizationCode { authorization_url, .. }
            | Self::TokenRequest { authorization_url, .. } => Some(authorization_url),
            _ => None,
        }
    }

    pub fn tokens(&self) -> Option<&OAuthTokens> {
        match self {
            Self::Complete { tokens, .. } => Some(tokens),
            _ => None,
        }
    }
}

/// The result of executing a step.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    Discovered(Arc<Discovery>),
    Registered(ClientInformation),
    AuthorizationPrepared { authorization_url: Url },
    CodeSubmitted(String),
    TokensIssued(OAuthTokens),
}

/// Apply `event` to `state`.
///
/// Events only move the flow one step forward; anything else is rejected.
pub fn transition(state: &FlowState, event: FlowEvent) -> AuthResult<FlowState> {
    let next = match (state, event) {
        (FlowState::MetadataDiscovery, FlowEvent::Discovered(discovery)) => {
            FlowState::ClientRegistration { discovery }
        }
        (FlowState::ClientRegistration { discovery }, FlowEvent::Registered(client)) => {
            FlowState::AuthorizationRedirect {
                discovery: discovery.clone(),
                client: Arc::new(client),
            }
        }
        (
            FlowState::AuthorizationRedirect { discovery, client },
            FlowEvent::AuthorizationPrepared { authorization_url },
        ) => FlowState::AuthorizationCode {
            discovery: discovery.clone(),
            client: client.clone(),
            authorization_url,
        },
        (
            FlowState::AuthorizationCode {
                discovery,
                client,
                authorization_url,
            },
            FlowEvent::CodeSubmitted(code),
        ) => {
            let code = code.trim();
            if code.is_empty() {
                return Err(AuthError::Validation(AUTHORIZATION_CODE_REQUIRED.to_string()));
            }
            FlowState::TokenRequest {
                discovery: discovery.clone(),
                client: client.clone(),
                authorization_url: authorization_url.clone(),
                code: code.to_string(),
            }
        }
        (FlowState::TokenRequest { discovery, client, .. }, FlowEvent::TokensIssued(tokens)) => {
            FlowState::Complete {
                discovery: discovery.clone(),
                client: client.clone(),
                tokens: Arc::new(tokens),
            }
        }
        (state, _) => return Err(AuthError::InvalidTransition(state.step().to_string())),
    };
    Ok(next)
}

const AUTHORIZATION_CODE_REQUIRED: &str = "Authorization code is required";

/// An error scoped to the step that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepError {
    pub step: OAuthStep,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Success,
    Error,
    Info,
}

/// A line of feedback for the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    #[serde(rename = "type")]
    pub kind: StatusKind,
    pub message: String,
}

impl StatusMessage {
    fn new(kind: StatusKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// What a call to [`AuthFlow::proceed`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Moved to the given step.
    Advanced(OAuthStep),
    /// The step failed and the flow stayed put.
    Failed(StepError),
    /// The step is not eligible to run.
    Blocked,
}

/// Settings for a flow.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    pub redirect_url: String,
    pub client_name: String,
    pub client_uri: String,
    /// Bound on each request to the authorization server.
    pub request_timeout: Duration,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            redirect_url: crate::DEFAULT_REDIRECT_URL.to_string(),
            client_name: crate::DEFAULT_CLIENT_NAME.to_string(),
            client_uri: crate::DEFAULT_CLIENT_URI.to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Serialisable view of a flow for the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSnapshot {
    pub server_url: String,
    pub oauth_step: OAuthStep,
    pub can_transition: bool,
    pub auth_server_url: Option<String>,
    pub oauth_metadata: Option<OAuthMetadata>,
    pub resource_metadata: Option<ProtectedResourceMetadata>,
    pub resource_metadata_error: Option<String>,
    pub resource: Option<String>,
    pub oauth_client_info: Option<ClientInformation>,
    pub authorization_url: Option<String>,
    pub authorization_code: String,
    pub oauth_tokens: Option<OAuthTokens>,
    pub latest_error: Option<StepError>,
    pub validation_error: Option<String>,
    pub status_message: Option<StatusMessage>,
}

/// One authorization flow against one protocol server.
pub struct AuthFlow {
    server_url: Url,
    config: FlowConfig,
    http: Client,
    credentials: ServerCredentials,
    strategies: Vec<Box<dyn RegistrationStrategy>>,
    state: FlowState,
    authorization_code: String,
    latest_error: Option<StepError>,
    validation_error: Option<String>,
    status_message: Option<StatusMessage>,
}

impl AuthFlow {
    /// Start a flow at metadata discovery.
    pub fn new(
        server_url: &str,
        config: FlowConfig,
        store: Arc<dyn CredentialStore>,
    ) -> AuthResult<Self> {
        let server_url = Url::parse(server_url).map_err(|e| AuthError::invalid_url(server_url, e))?;
        if !matches!(server_url.scheme(), "http" | "https") {
            return Err(AuthError::invalid_url(server_url.as_str(), "expected http or https"));
        }
        let http = Client::builder().timeout(config.request_timeout).build()?;
        let credentials = ServerCredentials::new(store, server_url.as_str());
        Ok(Self {
            server_url,
            config,
            http,
            credentials,
            strategies: default_strategies(),
            state: FlowState::MetadataDiscovery,
            authorization_code: String::new(),
            latest_error: None,
            validation_error: None,
            status_message: None,
        })
    }

    /// Replace the registration strategies.
    pub fn with_strategies(mut self, strategies: Vec<Box<dyn RegistrationStrategy>>) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn server_url(&self) -> &Url {
        &self.server_url
    }

    pub fn state(&self) -> &FlowState {
        &self.state
    }

    pub fn step(&self) -> OAuthStep {
        self.state.step()
    }

    pub fn credentials(&self) -> &ServerCredentials {
        &self.credentials
    }

    pub fn authorization_url(&self) -> Option<&Url> {
        self.state.authorization_url()
    }

    pub fn tokens(&self) -> Option<&OAuthTokens> {
        self.state.tokens()
    }

    pub fn latest_error(&self) -> Option<&StepError> {
        self.latest_error.as_ref()
    }

    pub fn validation_error(&self) -> Option<&str> {
        self.validation_error.as_deref()
    }

    pub fn status_message(&self) -> Option<&StatusMessage> {
        self.status_message.as_ref()
    }

    /// Whether the current step may run now.
    pub fn can_transition(&self) -> bool {
        match &self.state {
            FlowState::AuthorizationCode { .. } => !self.authorization_code.trim().is_empty(),
            FlowState::TokenRequest { code, .. } => !code.is_empty(),
            FlowState::Complete { .. } => false,
            _ => true,
        }
    }

    /// Record the code the operator pasted back.
    ///
    /// At the token request this replaces the code the next exchange sends,
    /// so a mistyped code can be corrected and retried.
    pub fn set_authorization_code(&mut self, code: impl Into<String>) {
        self.authorization_code = code.into();
        self.validation_error = None;
        if let FlowState::TokenRequest { code, .. } = &mut self.state {
            *code = self.authorization_code.trim().to_string();
        }
    }

    /// Run the current step and advance on success.
    pub async fn proceed(&mut self) -> StepOutcome {
        let step = self.step();
        if step == OAuthStep::Complete {
            return StepOutcome::Blocked;
        }
        self.latest_error = None;
        self.status_message = None;

        let result = match self.execute().await {
            Ok(event) => transition(&self.state, event),
            Err(e) => Err(e),
        };
        match result {
            Ok(next) => {
                self.state = next;
                self.status_message = Some(success_message(step));
                info!(server = %self.server_url, from = %step, to = %self.step(), "Authorization step advanced");
                StepOutcome::Advanced(self.step())
            }
            Err(e) => self.fail(step, e),
        }
    }

    /// Trade the refresh token of a completed flow for fresh tokens.
    pub async fn refresh(&mut self) -> AuthResult<OAuthTokens> {
        let FlowState::Complete {
            discovery,
            client,
            tokens,
        } = &self.state
        else {
            return Err(AuthError::InvalidTransition(self.step().to_string()));
        };
        let refresh_token = tokens
            .refresh_token
            .clone()
            .ok_or(AuthError::MissingPrerequisite("Refresh token"))?;
        let (discovery, client) = (discovery.clone(), client.clone());

        let refreshed = refresh_authorization(
            &self.http,
            &discovery.metadata,
            &client,
            &refresh_token,
            discovery.resource.as_ref(),
        )
        .await?;
        self.credentials.save_tokens(&refreshed).await?;
        self.state = FlowState::Complete {
            discovery,
            client,
            tokens: Arc::new(refreshed.clone()),
        };
        info!(server = %self.server_url, "Refreshed tokens");
        Ok(refreshed)
    }

    /// Start over: clear every per-attempt artifact and the persisted verifier.
    pub async fn reset(&mut self) -> AuthResult<()> {
        self.state = FlowState::MetadataDiscovery;
        self.authorization_code.clear();
        self.latest_error = None;
        self.validation_error = None;
        self.status_message = None;
        self.credentials.invalidate(CredentialScope::Verifier).await
    }

    pub fn snapshot(&self) -> FlowSnapshot {
        let discovery = self.state.discovery();
        FlowSnapshot {
            server_url: self.server_url.to_string(),
            oauth_step: self.step(),
            can_transition: self.can_transition(),
            auth_server_url: discovery.map(|d| d.auth_server_url.to_string()),
            oauth_metadata: discovery.map(|d| d.metadata.clone()),
            resource_metadata: discovery.and_then(|d| d.resource_metadata.clone()),
            resource_metadata_error: discovery.and_then(|d| d.resource_metadata_error.clone()),
            resource: discovery.and_then(|d| d.resource.as_ref().map(Url::to_string)),
            oauth_client_info: self.state.client().cloned(),
            authorization_url: self.authorization_url().map(Url::to_string),
            authorization_code: self.authorization_code.clone(),
            oauth_tokens: self.tokens().cloned(),
            latest_error: self.latest_error.clone(),
            validation_error: self.validation_error.clone(),
            status_message: self.status_message.clone(),
        }
    }

    fn fail(&mut self, step: OAuthStep, error: AuthError) -> StepOutcome {
        warn!(server = %self.server_url, step = %step, error = %error, "Authorization step failed");
        if let AuthError::Validation(message) = &error {
            self.validation_error = Some(message.clone());
        }
        let failure = StepError {
            step,
            message: error.to_string(),
        };
        self.status_message = Some(StatusMessage::new(
            StatusKind::Error,
            failure_message(step, &error),
        ));
        self.latest_error = Some(failure.clone());
        StepOutcome::Failed(failure)
    }

    async fn execute(&self) -> AuthResult<FlowEvent> {
        match &self.state {
            FlowState::MetadataDiscovery => self.discover().await,
            FlowState::ClientRegistration { discovery } => self.register(discovery).await,
            FlowState::AuthorizationRedirect { discovery, client } => {
                self.prepare_authorization(discovery, client).await
            }
            FlowState::AuthorizationCode { .. } => {
                Ok(FlowEvent::CodeSubmitted(self.authorization_code.clone()))
            }
            FlowState::TokenRequest {
                discovery,
                client,
                code,
                ..
            } => {
                if code.is_empty() {
                    return Err(AuthError::Validation(AUTHORIZATION_CODE_REQUIRED.to_string()));
                }
                self.request_tokens(discovery, client, code).await
            }
            FlowState::Complete { .. } => Err(AuthError::InvalidTransition(self.step().to_string())),
        }
    }

    async fn discover(&self) -> AuthResult<FlowEvent> {
        self.credentials.save_server_url().await?;

        let (resource_metadata, resource_metadata_error) =
            match discover_protected_resource_metadata(&self.http, &self.server_url).await {
                Ok(metadata) => (metadata, None),
                Err(e) => {
                    warn!(server = %self.server_url, error = %e, "Protected resource metadata unavailable");
                    (None, Some(e.to_string()))
                }
            };

        let auth_server_url = authorization_server_url(&self.server_url, resource_metadata.as_ref())?;
        let metadata = discover_authorization_server_metadata(&self.http, &auth_server_url).await?;

        let resource = match select_resource_url(&self.server_url, resource_metadata.as_ref()) {
            Ok(resource) => resource,
            Err(e) => {
                warn!(server = %self.server_url, error = %e, "Ignoring protected resource hint");
                None
            }
        };

        self.credentials.save_server_metadata(&metadata).await?;
        Ok(FlowEvent::Discovered(Arc::new(Discovery {
            auth_server_url,
            metadata,
            resource_metadata,
            resource_metadata_error,
            resource,
        })))
    }

    async fn register(&self, discovery: &Discovery) -> AuthResult<FlowEvent> {
        let mut client_metadata = ClientMetadata::public_client(
            self.config.redirect_url.as_str(),
            self.config.client_name.as_str(),
            self.config.client_uri.as_str(),
        );
        client_metadata.scope = discovery.scope();

        let ctx = RegistrationContext {
            http: &self.http,
            metadata: &discovery.metadata,
            client_metadata: &client_metadata,
            credentials: &self.credentials,
        };
        let (client, _) = register_with(&self.strategies, &ctx).await?;
        self.credentials.save_client_information(&client).await?;
        Ok(FlowEvent::Registered(client))
    }

    async fn prepare_authorization(
        &self,
        discovery: &Discovery,
        client: &ClientInformation,
    ) -> AuthResult<FlowEvent> {
        let scope = discovery.scope();
        let request = authorization_url(
            &discovery.metadata,
            client,
            &self.config.redirect_url,
            scope.as_deref(),
            &generate_state(),
            discovery.resource.as_ref(),
        )?;
        self.credentials.save_code_verifier(&request.code_verifier).await?;
        Ok(FlowEvent::AuthorizationPrepared {
            authorization_url: request.url,
        })
    }

    async fn request_tokens(
        &self,
        discovery: &Discovery,
        client: &ClientInformation,
        code: &str,
    ) -> AuthResult<FlowEvent> {
        let verifier = self
            .credentials
            .code_verifier()
            .await?
            .ok_or(AuthError::MissingPrerequisite("PKCE code verifier"))?;
        let tokens = exchange_authorization(
            &self.http,
            &discovery.metadata,
            client,
            code,
            &verifier,
            &self.config.redirect_url,
            discovery.resource.as_ref(),
        )
        .await?;
        self.credentials.save_tokens(&tokens).await?;
        Ok(FlowEvent::TokensIssued(tokens))
    }
}

impl fmt::Debug for AuthFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthFlow")
            .field("server_url", &self.server_url.as_str())
            .field("step", &self.step())
            .finish()
    }
}

fn success_message(step: OAuthStep) -> StatusMessage {
    match step {
        OAuthStep::MetadataDiscovery => {
            StatusMessage::new(StatusKind::Success, "Metadata discovery completed successfully.")
        }
        OAuthStep::ClientRegistration => {
            StatusMessage::new(StatusKind::Success, "Client registration completed successfully.")
        }
        OAuthStep::AuthorizationRedirect => StatusMessage::new(
            StatusKind::Info,
            "Authorization URL generated. Please complete authorization in your browser.",
        ),
        OAuthStep::AuthorizationCode => {
            StatusMessage::new(StatusKind::Success, "Authorization code accepted.")
        }
        OAuthStep::TokenRequest | OAuthStep::Complete => {
            StatusMessage::new(StatusKind::Success, "OAuth authentication completed successfully!")
        }
    }
}

fn failure_message(step: OAuthStep, error: &AuthError) -> String {
    match step {
        OAuthStep::MetadataDiscovery => format!("Metadata discovery failed: {error}"),
        OAuthStep::ClientRegistration => format!("Client registration failed: {error}"),
        OAuthStep::AuthorizationRedirect => format!("Failed to prepare authorization: {error}"),
        OAuthStep::AuthorizationCode => error.to_string(),
        OAuthStep::TokenRequest => format!("Token exchange failed: {error}"),
        OAuthStep::Complete => error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryCredentialStore;
    use serde_json::json;

    fn discovery() -> Arc<Discovery> {
        Arc::new(Discovery {
            auth_server_url: Url::parse("https://auth.example.com/").unwrap(),
            metadata: serde_json::from_value(json!({
                "issuer": "https://auth.example.com",
                "authorization_endpoint": "https://auth.example.com/authorize",
                "token_endpoint": "https://auth.example.com/token",
                "response_types_supported": ["code"],
                "scopes_supported": ["a", "b"]
            }))
            .unwrap(),
            resource_metadata: None,
            resource_metadata_error: None,
            resource: None,
        })
    }

    fn tokens() -> OAuthTokens {
        serde_json::from_value(json!({"access_token": "at"})).unwrap()
    }

    fn authorization_url() -> Url {
        Url::parse("https://auth.example.com/authorize?x=1").unwrap()
    }

    #[test]
    fn test_transitions_walk_forward() {
        let state = FlowState::MetadataDiscovery;
        let state = transition(&state, FlowEvent::Discovered(discovery())).unwrap();
        assert_eq!(state.step(), OAuthStep::ClientRegistration);

        let state = transition(&state, FlowEvent::Registered(ClientInformation::public("c"))).unwrap();
        assert_eq!(state.client().unwrap().client_id, "c");

        let state = transition(
            &state,
            FlowEvent::AuthorizationPrepared {
                authorization_url: authorization_url(),
            },
        )
        .unwrap();
        assert_eq!(state.authorization_url(), Some(&authorization_url()));

        let state = transition(&state, FlowEvent::CodeSubmitted("  abc \n".into())).unwrap();
        match &state {
            FlowState::TokenRequest { code, .. } => assert_eq!(code, "abc"),
            other => panic!("unexpected state: {other:?}"),
        }

        let state = transition(&state, FlowEvent::TokensIssued(tokens())).unwrap();
        assert_eq!(state.step(), OAuthStep::Complete);
        assert_eq!(state.tokens().unwrap().access_token, "at");
        assert!(state.discovery().is_some());
    }

    #[test]
    fn test_out_of_order_events_are_rejected() {
        let err = transition(&FlowState::MetadataDiscovery, FlowEvent::TokensIssued(tokens()))
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidTransition(step) if step == "metadata_discovery"));

        let complete = FlowState::Complete {
            discovery: discovery(),
            client: Arc::new(ClientInformation::public("c")),
            tokens: Arc::new(tokens()),
        };
        assert!(transition(&complete, FlowEvent::Discovered(discovery())).is_err());
    }

    #[test]
    fn test_blank_code_is_a_validation_error() {
        let state = FlowState::AuthorizationCode {
            discovery: discovery(),
            client: Arc::new(ClientInformation::public("c")),
            authorization_url: authorization_url(),
        };
        let err = transition(&state, FlowEvent::CodeSubmitted("   ".into())).unwrap_err();
        assert_eq!(err.to_string(), "Authorization code is required");
    }

    #[test]
    fn test_scope_prefers_resource_scopes() {
        let mut with_resource = (*discovery()).clone();
        assert_eq!(with_resource.scope().as_deref(), Some("a b"));

        with_resource.resource_metadata = Some(
            serde_json::from_value(json!({
                "resource": "https://example.com",
                "scopes_supported": ["mcp:read"]
            }))
            .unwrap(),
        );
        assert_eq!(with_resource.scope().as_deref(), Some("mcp:read"));

        with_resource.metadata.scopes_supported = None;
        with_resource.resource_metadata = None;
        assert_eq!(with_resource.scope(), None);
    }

    #[test]
    fn test_new_rejects_bad_urls() {
        let store: Arc<dyn CredentialStore> = Arc::new(MemoryCredentialStore::new());
        assert!(AuthFlow::new("not a url", FlowConfig::default(), store.clone()).is_err());
        assert!(AuthFlow::new("ftp://example.com", FlowConfig::default(), store.clone()).is_err());

        let flow = AuthFlow::new("https://example.com/mcp", FlowConfig::default(), store).unwrap();
        assert_eq!(flow.step(), OAuthStep::MetadataDiscovery);
        assert!(flow.can_transition());
    }

    #[tokio::test]
    async fn test_complete_flow_is_blocked() {
        let store: Arc<dyn CredentialStore> = Arc::new(MemoryCredentialStore::new());
        let mut flow = AuthFlow::new("https://example.com/mcp", FlowConfig::default(), store).unwrap();
        flow.state = FlowState::Complete {
            discovery: discovery(),
            client: Arc::new(ClientInformation::public("c")),
            tokens: Arc::new(tokens()),
        };
        assert!(!flow.can_transition());
        assert_eq!(flow.proceed().await, StepOutcome::Blocked);
    }

    #[tokio::test]
    async fn test_blank_code_is_reported_in_place() {
        let store: Arc<dyn CredentialStore> = Arc::new(MemoryCredentialStore::new());
        let mut flow = AuthFlow::new("https://example.com/mcp", FlowConfig::default(), store).unwrap();
        flow.state = FlowState::AuthorizationCode {
            discovery: discovery(),
            client: Arc::new(ClientInformation::public("c")),
            authorization_url: authorization_url(),
        };

        assert!(!flow.can_transition());
        match flow.proceed().await {
            StepOutcome::Failed(error) => assert_eq!(error.step, OAuthStep::AuthorizationCode),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(flow.step(), OAuthStep::AuthorizationCode);
        assert_eq!(flow.validation_error(), Some("Authorization code is required"));

        flow.set_authorization_code("code-123");
        assert!(flow.validation_error().is_none());
        assert_eq!(flow.proceed().await, StepOutcome::Advanced(OAuthStep::TokenRequest));
    }

    #[tokio::test]
    async fn test_snapshot_serialises_for_the_ui() {
        let store: Arc<dyn CredentialStore> = Arc::new(MemoryCredentialStore::new());
        let flow = AuthFlow::new("https://example.com/mcp", FlowConfig::default(), store).unwrap();

        let value = serde_json::to_value(flow.snapshot()).unwrap();
        assert_eq!(value["oauthStep"], json!("metadata_discovery"));
        assert_eq!(value["serverUrl"], json!("https://example.com/mcp"));
        assert_eq!(value["authorizationCode"], json!(""));
        assert_eq!(value["latestError"], json!(null));
    }
}
