//! Authorization flow tests against a mock authorization server.

use inspector_auth::{
    AuthFlow, CredentialStore, FlowConfig, MemoryCredentialStore, OAuthStep, ServerCredentials,
    StatusKind, StepOutcome,
};
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Fixture {
    server: MockServer,
    store: Arc<dyn CredentialStore>,
}

impl Fixture {
    async fn start() -> Self {
        Self {
            server: MockServer::start().await,
            store: Arc::new(MemoryCredentialStore::new()),
        }
    }

    fn server_url(&self) -> String {
        format!("{}/mcp", self.server.uri())
    }

    fn flow(&self) -> AuthFlow {
        AuthFlow::new(&self.server_url(), FlowConfig::default(), self.store.clone()).unwrap()
    }

    fn credentials(&self) -> ServerCredentials {
        ServerCredentials::new(self.store.clone(), self.server_url())
    }

    async fn mount_resource_metadata(&self) {
        let uri = self.server.uri();
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-protected-resource/mcp"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "resource": format!("{uri}/mcp"),
                "authorization_servers": [uri],
                "scopes_supported": ["mcp:tools"]
            })))
            .mount(&self.server)
            .await;
    }

    async fn mount_server_metadata(&self) {
        let uri = self.server.uri();
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issuer": uri,
                "authorization_endpoint": format!("{uri}/authorize"),
                "token_endpoint": format!("{uri}/token"),
                "registration_endpoint": format!("{uri}/register"),
                "response_types_supported": ["code"],
                "code_challenge_methods_supported": ["S256"]
            })))
            .mount(&self.server)
            .await;
    }

    async fn mount_registration(&self, status: u16) {
        let body = if status < 300 {
            json!({"client_id": "registered-client"})
        } else {
            json!({"error": "invalid_client_metadata"})
        };
        Mock::given(method("POST"))
            .and(path("/register"))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(&self.server)
            .await;
    }
}

fn query(flow: &AuthFlow, key: &str) -> Option<String> {
    flow.authorization_url()?
        .query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

async fn advance(flow: &mut AuthFlow, expected: OAuthStep) {
    match flow.proceed().await {
        StepOutcome::Advanced(step) => assert_eq!(step, expected),
        other => panic!("expected to reach {expected}, got {other:?}"),
    }
}

/// Every step succeeds and the flow ends with persisted tokens.
#[tokio::test]
async fn test_full_flow_reaches_complete() {
    let fixture = Fixture::start().await;
    fixture.mount_resource_metadata().await;
    fixture.mount_server_metadata().await;
    fixture.mount_registration(201).await;

    let mut flow = fixture.flow();
    advance(&mut flow, OAuthStep::ClientRegistration).await;
    advance(&mut flow, OAuthStep::AuthorizationRedirect).await;
    assert_eq!(
        flow.status_message().unwrap().message,
        "Client registration completed successfully."
    );
    advance(&mut flow, OAuthStep::AuthorizationCode).await;

    assert_eq!(query(&flow, "client_id").as_deref(), Some("registered-client"));
    assert_eq!(query(&flow, "scope").as_deref(), Some("mcp:tools"));
    assert_eq!(query(&flow, "resource"), Some(fixture.server_url()));
    assert_eq!(
        query(&flow, "redirect_uri").as_deref(),
        Some("http://localhost:6274/oauth/callback/debug")
    );
    assert_eq!(query(&flow, "state").map(|s| s.len()), Some(64));
    assert_eq!(flow.status_message().unwrap().kind, StatusKind::Info);

    let verifier = fixture.credentials().code_verifier().await.unwrap().unwrap();
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("code=the-code"))
        .and(body_string_contains(format!("code_verifier={verifier}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "access-1",
            "token_type": "Bearer",
            "refresh_token": "refresh-1"
        })))
        .expect(1)
        .mount(&fixture.server)
        .await;

    flow.set_authorization_code("the-code");
    advance(&mut flow, OAuthStep::TokenRequest).await;
    advance(&mut flow, OAuthStep::Complete).await;

    assert_eq!(flow.tokens().unwrap().access_token, "access-1");
    assert_eq!(
        flow.status_message().unwrap().message,
        "OAuth authentication completed successfully!"
    );
    let stored = fixture.credentials().tokens().await.unwrap().unwrap();
    assert_eq!(stored.access_token, "access-1");
    let client = fixture.credentials().client_information().await.unwrap().unwrap();
    assert_eq!(client.client_id, "registered-client");

    assert_eq!(flow.proceed().await, StepOutcome::Blocked);
}

/// A rejected dynamic registration falls back to a static client.
#[tokio::test]
async fn test_registration_failure_falls_back_to_static_client() {
    let fixture = Fixture::start().await;
    fixture.mount_server_metadata().await;
    fixture.mount_registration(400).await;

    let mut flow = fixture.flow();
    advance(&mut flow, OAuthStep::ClientRegistration).await;
    advance(&mut flow, OAuthStep::AuthorizationRedirect).await;

    let client = flow.state().client().unwrap();
    assert!(client.client_id.starts_with("static_client_"));
    let persisted = fixture.credentials().client_information().await.unwrap().unwrap();
    assert_eq!(persisted.client_id, client.client_id);

    // No protected-resource metadata was published, so no resource hint.
    advance(&mut flow, OAuthStep::AuthorizationCode).await;
    assert!(query(&flow, "resource").is_none());
}

/// Missing server metadata fails the first step in place; a retry works.
#[tokio::test]
async fn test_discovery_failure_is_scoped_and_retryable() {
    let fixture = Fixture::start().await;

    let mut flow = fixture.flow();
    match flow.proceed().await {
        StepOutcome::Failed(error) => assert_eq!(error.step, OAuthStep::MetadataDiscovery),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(flow.step(), OAuthStep::MetadataDiscovery);
    assert_eq!(flow.latest_error().unwrap().step, OAuthStep::MetadataDiscovery);
    let status = flow.status_message().unwrap();
    assert_eq!(status.kind, StatusKind::Error);
    assert!(status.message.starts_with("Metadata discovery failed: "));

    fixture.mount_server_metadata().await;
    advance(&mut flow, OAuthStep::ClientRegistration).await;
    assert!(flow.latest_error().is_none());
}

/// A rejected code leaves the flow at the token request for another try.
#[tokio::test]
async fn test_token_failure_can_be_retried() {
    let fixture = Fixture::start().await;
    fixture.mount_server_metadata().await;
    fixture.mount_registration(201).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})))
        .up_to_n_times(1)
        .mount(&fixture.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "ok"})))
        .mount(&fixture.server)
        .await;

    let mut flow = fixture.flow();
    advance(&mut flow, OAuthStep::ClientRegistration).await;
    advance(&mut flow, OAuthStep::AuthorizationRedirect).await;
    advance(&mut flow, OAuthStep::AuthorizationCode).await;
    flow.set_authorization_code("code");
    advance(&mut flow, OAuthStep::TokenRequest).await;

    match flow.proceed().await {
        StepOutcome::Failed(error) => {
            assert_eq!(error.step, OAuthStep::TokenRequest);
            assert!(error.message.contains("invalid_grant"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(flow
        .status_message()
        .unwrap()
        .message
        .starts_with("Token exchange failed: "));

    advance(&mut flow, OAuthStep::Complete).await;
    assert_eq!(flow.tokens().unwrap().access_token, "ok");
}

/// A corrected code replaces the rejected one on the next exchange.
#[tokio::test]
async fn test_corrected_code_is_sent_on_retry() {
    let fixture = Fixture::start().await;
    fixture.mount_server_metadata().await;
    fixture.mount_registration(201).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("code=bad"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})))
        .expect(1)
        .mount(&fixture.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("code=good"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "fixed"})))
        .expect(1)
        .mount(&fixture.server)
        .await;

    let mut flow = fixture.flow();
    advance(&mut flow, OAuthStep::ClientRegistration).await;
    advance(&mut flow, OAuthStep::AuthorizationRedirect).await;
    advance(&mut flow, OAuthStep::AuthorizationCode).await;
    flow.set_authorization_code("bad");
    advance(&mut flow, OAuthStep::TokenRequest).await;
    assert!(matches!(flow.proceed().await, StepOutcome::Failed(_)));

    flow.set_authorization_code("  ");
    assert!(!flow.can_transition());
    match flow.proceed().await {
        StepOutcome::Failed(error) => assert_eq!(error.step, OAuthStep::TokenRequest),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(flow.validation_error(), Some("Authorization code is required"));

    flow.set_authorization_code("good");
    assert_eq!(flow.snapshot().authorization_code, "good");
    advance(&mut flow, OAuthStep::Complete).await;
    assert_eq!(flow.tokens().unwrap().access_token, "fixed");
}

/// Starting over clears the attempt and the persisted verifier.
#[tokio::test]
async fn test_reset_invalidates_verifier() {
    let fixture = Fixture::start().await;
    fixture.mount_server_metadata().await;
    fixture.mount_registration(201).await;

    let mut flow = fixture.flow();
    advance(&mut flow, OAuthStep::ClientRegistration).await;
    advance(&mut flow, OAuthStep::AuthorizationRedirect).await;
    advance(&mut flow, OAuthStep::AuthorizationCode).await;
    flow.set_authorization_code("typed");
    assert!(fixture.credentials().code_verifier().await.unwrap().is_some());

    flow.reset().await.unwrap();
    assert_eq!(flow.step(), OAuthStep::MetadataDiscovery);
    assert!(flow.authorization_url().is_none());
    assert_eq!(flow.snapshot().authorization_code, "");
    assert!(fixture.credentials().code_verifier().await.unwrap().is_none());
    // The registered client survives a restart.
    assert!(fixture
        .credentials()
        .client_information()
        .await
        .unwrap()
        .is_some());
}

/// A completed flow can trade its refresh token for new tokens.
#[tokio::test]
async fn test_refresh_after_complete() {
    let fixture = Fixture::start().await;
    fixture.mount_server_metadata().await;
    fixture.mount_registration(201).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "first",
            "refresh_token": "r1"
        })))
        .mount(&fixture.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=r1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "second"})))
        .mount(&fixture.server)
        .await;

    let mut flow = fixture.flow();
    assert!(flow.refresh().await.is_err());
    advance(&mut flow, OAuthStep::ClientRegistration).await;
    advance(&mut flow, OAuthStep::AuthorizationRedirect).await;
    advance(&mut flow, OAuthStep::AuthorizationCode).await;
    flow.set_authorization_code("code");
    advance(&mut flow, OAuthStep::TokenRequest).await;
    advance(&mut flow, OAuthStep::Complete).await;

    let refreshed = flow.refresh().await.unwrap();
    assert_eq!(refreshed.access_token, "second");
    assert_eq!(refreshed.refresh_token.as_deref(), Some("r1"));
    assert_eq!(
        fixture.credentials().tokens().await.unwrap().unwrap().access_token,
        "second"
    );
}
