//! OAuth metadata discovery.
//!
//! Well-known documents are tried path-aware first, then at the origin root.
//! A 404 moves on to the next candidate; any other failure stops the search.

use crate::error::{AuthError, AuthResult};
use crate::types::{OAuthMetadata, ProtectedResourceMetadata};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

const PROTECTED_RESOURCE: &str = "oauth-protected-resource";
const AUTHORIZATION_SERVER: &str = "oauth-authorization-server";
const OPENID_CONFIGURATION: &str = "openid-configuration";

/// Build `/.well-known/<name>`, with the base path appended when `path_aware`.
pub fn well_known_url(base: &Url, name: &str, path_aware: bool) -> AuthResult<Url> {
    let path = base.path().trim_end_matches('/');
    let target = if path_aware && !path.is_empty() {
        format!("/.well-known/{name}{path}")
    } else {
        format!("/.well-known/{name}")
    };
    base.join(&target)
        .map_err(|e| AuthError::invalid_url(base.as_str(), e))
}

fn candidates(base: &Url, names: &[&str]) -> AuthResult<Vec<Url>> {
    let mut urls = Vec::new();
    for name in names {
        for path_aware in [true, false] {
            let url = well_known_url(base, name, path_aware)?;
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
    }
    Ok(urls)
}

/// Fetch the first candidate that exists. `Ok(None)` when all are 404.
async fn first_found<T: DeserializeOwned>(
    http: &Client,
    urls: &[Url],
    what: &str,
) -> AuthResult<Option<T>> {
    for url in urls {
        let response = http
            .get(url.clone())
            .header("Accept", "application/json")
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(url = %url, "No {what} here");
            continue;
        }
        if !status.is_success() {
            return Err(AuthError::Metadata(format!(
                "HTTP {} trying to load {what} from {url}",
                status.as_u16()
            )));
        }
        let document = response.json::<T>().await.map_err(|e| {
            AuthError::Metadata(format!("Invalid {what} from {url}: {e}"))
        })?;
        debug!(url = %url, "Loaded {what}");
        return Ok(Some(document));
    }
    Ok(None)
}

/// Protected-resource metadata for a protocol server, if it publishes any.
pub async fn discover_protected_resource_metadata(
    http: &Client,
    server_url: &Url,
) -> AuthResult<Option<ProtectedResourceMetadata>> {
    let urls = candidates(server_url, &[PROTECTED_RESOURCE])?;
    first_found(http, &urls, "protected resource metadata").await
}

/// Authorization-server metadata. Missing metadata is an error.
pub async fn discover_authorization_server_metadata(
    http: &Client,
    auth_server_url: &Url,
) -> AuthResult<OAuthMetadata> {
    let urls = candidates(auth_server_url, &[AUTHORIZATION_SERVER, OPENID_CONFIGURATION])?;
    first_found(http, &urls, "authorization server metadata")
        .await?
        .ok_or_else(|| {
            AuthError::Metadata(format!(
                "No authorization server metadata found for {auth_server_url}"
            ))
        })
}

/// Where to find the authorization server: the first one the resource
/// declares, otherwise the protocol server's own origin.
pub fn authorization_server_url(
    server_url: &Url,
    resource_metadata: Option<&ProtectedResourceMetadata>,
) -> AuthResult<Url> {
    let declared = resource_metadata
        .and_then(|m| m.authorization_servers.as_ref())
        .and_then(|servers| servers.first());
    if let Some(declared) = declared {
        match Url::parse(declared) {
            Ok(url) => return Ok(url),
            Err(e) => warn!(
                declared = %declared,
                error = %e,
                "Ignoring unparseable authorization server, using the server origin"
            ),
        }
    }
    server_url
        .join("/")
        .map_err(|e| AuthError::invalid_url(server_url.as_str(), e))
}

/// The resource indicator to send, if the resource metadata names one.
///
/// The declared resource must share the server's origin and be the server
/// URL itself or one of its path prefixes.
pub fn select_resource_url(
    server_url: &Url,
    resource_metadata: Option<&ProtectedResourceMetadata>,
) -> AuthResult<Option<Url>> {
    let Some(metadata) = resource_metadata else {
        return Ok(None);
    };
    let declared = Url::parse(&metadata.resource)
        .map_err(|e| AuthError::invalid_url(metadata.resource.as_str(), e))?;

    let mut requested = server_url.clone();
    requested.set_fragment(None);

    if declared.origin() != requested.origin() || !is_path_prefix(declared.path(), requested.path()) {
        return Err(AuthError::Metadata(format!(
            "Protected resource {} does not match expected {requested} (or origin)",
            metadata.resource
        )));
    }
    Ok(Some(declared))
}

fn is_path_prefix(prefix: &str, path: &str) -> bool {
    let with_slash = |p: &str| {
        if p.ends_with('/') {
            p.to_string()
        } else {
            format!("{p}/")
        }
    };
    with_slash(path).starts_with(&with_slash(prefix))
}

/// Fetch an arbitrary metadata document on behalf of the browser.
///
/// Non-success statuses are reported with the upstream status code.
pub async fn fetch_metadata(http: &Client, url: &Url) -> AuthResult<Value> {
    let response = http
        .get(url.clone())
        .header("Accept", "application/json")
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        return Err(AuthError::UpstreamStatus {
            status: status.as_u16(),
            message: format!(
                "Failed to fetch OAuth metadata: {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or_default()
            ),
        });
    }
    Ok(response.json().await?)
}
