//! Requests against the authorization server.

use crate::error::{AuthError, AuthResult};
use crate::pkce::{PkceChallenge, CHALLENGE_METHOD};
use crate::types::{ClientInformation, ClientMetadata, OAuthMetadata, OAuthTokens};
use reqwest::Client;
use tracing::{debug, info};
use url::Url;

/// A prepared authorization request.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    /// Where the operator should be sent.
    pub url: Url,
    /// Verifier matching the challenge in `url`.
    pub code_verifier: String,
}

/// Register a client dynamically.
pub async fn register_client(
    http: &Client,
    metadata: &OAuthMetadata,
    client_metadata: &ClientMetadata,
) -> AuthResult<ClientInformation> {
    let endpoint = metadata.registration_endpoint.as_deref().ok_or_else(|| {
        AuthError::Registration(
            "Incompatible auth server: does not support dynamic client registration".to_string(),
        )
    })?;

    let response = http.post(endpoint).json(client_metadata).send().await?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(AuthError::Registration(format!(
            "Dynamic client registration failed: HTTP {} {text}",
            status.as_u16()
        )));
    }

    let client: ClientInformation = response
        .json()
        .await
        .map_err(|e| AuthError::Registration(format!("Invalid registration response: {e}")))?;
    info!(endpoint = %endpoint, client_id = %client.client_id, "Registered client");
    Ok(client)
}

/// Build an authorization URL with a fresh PKCE pair.
pub fn authorization_url(
    metadata: &OAuthMetadata,
    client: &ClientInformation,
    redirect_url: &str,
    scope: Option<&str>,
    state: &str,
    resource: Option<&Url>,
) -> AuthResult<AuthorizationRequest> {
    if !metadata.response_types_supported.iter().any(|t| t == "code") {
        return Err(AuthError::Authorization(
            "Incompatible auth server: does not support response type code".to_string(),
        ));
    }
    if let Some(methods) = &metadata.code_challenge_methods_supported {
        if !methods.iter().any(|m| m == CHALLENGE_METHOD) {
            return Err(AuthError::Authorization(format!(
                "Incompatible auth server: does not support code challenge method {CHALLENGE_METHOD}"
            )));
        }
    }

    let pkce = PkceChallenge::generate();
    let endpoint = &metadata.authorization_endpoint;
    let separator = if endpoint.contains('?') { '&' } else { '?' };
    let mut url = format!(
        "{}{}response_type=code&client_id={}&code_challenge={}&code_challenge_method={}&redirect_uri={}&state={}",
        endpoint,
        separator,
        urlencoding::encode(&client.client_id),
        urlencoding::encode(&pkce.challenge),
        CHALLENGE_METHOD,
        urlencoding::encode(redirect_url),
        urlencoding::encode(state),
    );
    if let Some(scope) = scope {
        url.push_str(&format!("&scope={}", urlencoding::encode(scope)));
    }
    if let Some(resource) = resource {
        url.push_str(&format!("&resource={}", urlencoding::encode(resource.as_str())));
    }

    let url = Url::parse(&url).map_err(|e| AuthError::invalid_url(endpoint.as_str(), e))?;
    Ok(AuthorizationRequest {
        url,
        code_verifier: pkce.verifier,
    })
}

/// Exchange an authorization code for tokens.
pub async fn exchange_authorization(
    http: &Client,
    metadata: &OAuthMetadata,
    client: &ClientInformation,
    code: &str,
    code_verifier: &str,
    redirect_url: &str,
    resource: Option<&Url>,
) -> AuthResult<OAuthTokens> {
    let grant = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("code_verifier", code_verifier),
        ("redirect_uri", redirect_url),
    ];
    token_request(http, metadata, client, &grant, resource).await
}

/// Trade a refresh token for new tokens.
pub async fn refresh_authorization(
    http: &Client,
    metadata: &OAuthMetadata,
    client: &ClientInformation,
    refresh_token: &str,
    resource: Option<&Url>,
) -> AuthResult<OAuthTokens> {
    let grant = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
    ];
    let mut tokens = token_request(http, metadata, client, &grant, resource).await?;
    // Servers may omit the refresh token when it is not rotated.
    if tokens.refresh_token.is_none() {
        tokens.refresh_token = Some(refresh_token.to_string());
    }
    Ok(tokens)
}

async fn token_request(
    http: &Client,
    metadata: &OAuthMetadata,
    client: &ClientInformation,
    grant: &[(&str, &str)],
    resource: Option<&Url>,
) -> AuthResult<OAuthTokens> {
    let mut params: Vec<(&str, &str)> = grant.to_vec();
    params.push(("client_id", client.client_id.as_str()));
    if let Some(secret) = &client.client_secret {
        params.push(("client_secret", secret.as_str()));
    }
    if let Some(resource) = resource {
        params.push(("resource", resource.as_str()));
    }

    debug!(endpoint = %metadata.token_endpoint, "Requesting tokens");
    let response = http
        .post(&metadata.token_endpoint)
        .form(&params)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(AuthError::Token(format!("HTTP {}: {text}", status.as_u16())));
    }

    response
        .json()
        .await
        .map_err(|e| AuthError::Token(format!("Invalid token response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn metadata(base: &str) -> OAuthMetadata {
        serde_json::from_value(json!({
            "issuer": base,
            "authorization_endpoint": format!("{base}/authorize"),
            "token_endpoint": format!("{base}/token"),
            "registration_endpoint": format!("{base}/register"),
            "response_types_supported": ["code"],
            "code_challenge_methods_supported": ["S256"]
        }))
        .unwrap()
    }

    fn query(url: &Url, key: &str) -> Option<String> {
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    #[test]
    fn test_authorization_url_parameters() {
        let metadata = metadata("https://auth.example.com");
        let client = ClientInformation::public("client 1");
        let resource = Url::parse("https://example.com/mcp").unwrap();
        let request = authorization_url(
            &metadata,
            &client,
            "http://localhost:6274/oauth/callback/debug",
            Some("read write"),
            "abc",
            Some(&resource),
        )
        .unwrap();

        let url = &request.url;
        assert_eq!(url.path(), "/authorize");
        assert_eq!(query(url, "response_type").as_deref(), Some("code"));
        assert_eq!(query(url, "client_id").as_deref(), Some("client 1"));
        assert_eq!(query(url, "code_challenge_method").as_deref(), Some("S256"));
        assert_eq!(
            query(url, "code_challenge"),
            Some(crate::pkce::code_challenge(&request.code_verifier))
        );
        assert_eq!(
            query(url, "redirect_uri").as_deref(),
            Some("http://localhost:6274/oauth/callback/debug")
        );
        assert_eq!(query(url, "state").as_deref(), Some("abc"));
        assert_eq!(query(url, "scope").as_deref(), Some("read write"));
        assert_eq!(query(url, "resource").as_deref(), Some("https://example.com/mcp"));
    }

    #[test]
    fn test_authorization_url_without_scope() {
        let request = authorization_url(
            &metadata("https://auth.example.com"),
            &ClientInformation::public("c"),
            "http://localhost/cb",
            None,
            "s",
            None,
        )
        .unwrap();
        assert!(query(&request.url, "scope").is_none());
        assert!(query(&request.url, "resource").is_none());
    }

    #[test]
    fn test_incompatible_servers() {
        let mut no_code = metadata("https://auth.example.com");
        no_code.response_types_supported = vec!["token".into()];
        let err = authorization_url(&no_code, &ClientInformation::public("c"), "x", None, "s", None)
            .unwrap_err();
        assert!(err.to_string().contains("response type code"));

        let mut plain_only = metadata("https://auth.example.com");
        plain_only.code_challenge_methods_supported = Some(vec!["plain".into()]);
        let err = authorization_url(&plain_only, &ClientInformation::public("c"), "x", None, "s", None)
            .unwrap_err();
        assert!(err.to_string().contains("S256"));
    }

    #[tokio::test]
    async fn test_register_client() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/register"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "client_id": "dyn-1",
                "client_secret": "shh",
                "redirect_uris": ["http://localhost/cb"]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client_metadata = ClientMetadata::public_client("http://localhost/cb", "Inspector", "https://x");
        let client = register_client(&Client::new(), &metadata(&server.uri()), &client_metadata)
            .await
            .unwrap();
        assert_eq!(client.client_id, "dyn-1");
        assert_eq!(client.client_secret.as_deref(), Some("shh"));
        assert_eq!(client.extra["redirect_uris"], json!(["http://localhost/cb"]));
    }

    #[tokio::test]
    async fn test_register_without_endpoint() {
        let mut metadata = metadata("https://auth.example.com");
        metadata.registration_endpoint = None;
        let client_metadata = ClientMetadata::public_client("cb", "Inspector", "https://x");
        let err = register_client(&Client::new(), &metadata, &client_metadata)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Registration(_)));
    }

    #[tokio::test]
    async fn test_exchange_sends_verifier_and_secret() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code_verifier=the-verifier"))
            .and(body_string_contains("client_secret=shh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "at",
                "token_type": "Bearer",
                "refresh_token": "rt",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut client = ClientInformation::public("c");
        client.client_secret = Some("shh".into());
        let tokens = exchange_authorization(
            &Client::new(),
            &metadata(&server.uri()),
            &client,
            "the-code",
            "the-verifier",
            "http://localhost/cb",
            None,
        )
        .await
        .unwrap();
        assert_eq!(tokens.access_token, "at");
        assert_eq!(tokens.expires_in, Some(3600));
    }

    #[tokio::test]
    async fn test_token_error_carries_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})))
            .mount(&server)
            .await;

        let err = exchange_authorization(
            &Client::new(),
            &metadata(&server.uri()),
            &ClientInformation::public("c"),
            "bad",
            "v",
            "cb",
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AuthError::Token(_)));
        assert!(err.to_string().contains("invalid_grant"));
    }

    #[tokio::test]
    async fn test_refresh_keeps_unrotated_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "new"})))
            .mount(&server)
            .await;

        let tokens = refresh_authorization(
            &Client::new(),
            &metadata(&server.uri()),
            &ClientInformation::public("c"),
            "rt",
            None,
        )
        .await
        .unwrap();
        assert_eq!(tokens.access_token, "new");
        assert_eq!(tokens.refresh_token.as_deref(), Some("rt"));
    }
}
