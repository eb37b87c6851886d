//! Server descriptors and header passthrough rules.

use crate::error::{ProxyError, ProxyResult};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Inbound headers forwarded to event-stream servers.
pub const SSE_HEADERS_PASSTHROUGH: &[&str] = &["authorization"];

/// Inbound headers forwarded to bidirectional HTTP stream servers.
pub const STREAMABLE_HTTP_HEADERS_PASSTHROUGH: &[&str] =
    &["authorization", "mcp-session-id", "last-event-id"];

/// Wire mechanism used to reach a protocol server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Subprocess speaking newline-delimited JSON over stdin/stdout.
    Stdio,
    /// Server-initiated event stream plus POSTed client messages.
    Sse,
    /// Single HTTP exchange per message, answered as JSON or an event stream.
    StreamableHttp,
}

impl TransportKind {
    /// The canonical query-string/config name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::StreamableHttp => "streamable-http",
        }
    }

    /// Inbound headers that may be forwarded for this kind.
    pub fn passthrough_allow_list(&self) -> &'static [&'static str] {
        match self {
            Self::Stdio => &[],
            Self::Sse => SSE_HEADERS_PASSTHROUGH,
            Self::StreamableHttp => STREAMABLE_HTTP_HEADERS_PASSTHROUGH,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdio" => Ok(Self::Stdio),
            "sse" | "event-stream" => Ok(Self::Sse),
            "streamable-http" | "streamable_http" | "bidi-stream" => Ok(Self::StreamableHttp),
            other => Err(ProxyError::invalid_descriptor(format!(
                "Invalid transport type specified: {other}"
            ))),
        }
    }
}

/// Identifies a protocol server and how to reach it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerDescriptor {
    /// A local subprocess.
    Stdio {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
    },
    /// A remote event-stream endpoint.
    Sse {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
    /// A remote bidirectional HTTP stream endpoint.
    StreamableHttp {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
}

impl ServerDescriptor {
    /// Describe a subprocess server.
    pub fn stdio<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Stdio {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: HashMap::new(),
        }
    }

    /// Describe an event-stream server.
    pub fn sse(url: impl Into<String>) -> Self {
        Self::Sse {
            url: url.into(),
            headers: HashMap::new(),
        }
    }

    /// Describe a bidirectional HTTP stream server.
    pub fn streamable_http(url: impl Into<String>) -> Self {
        Self::StreamableHttp {
            url: url.into(),
            headers: HashMap::new(),
        }
    }

    /// Add an environment variable (subprocess servers only).
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let Self::Stdio { env, .. } = &mut self {
            env.insert(key.into(), value.into());
        }
        self
    }

    /// Add a static request header (HTTP servers only).
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        match &mut self {
            Self::Sse { headers, .. } | Self::StreamableHttp { headers, .. } => {
                headers.insert(key.into(), value.into());
            }
            Self::Stdio { .. } => {}
        }
        self
    }

    /// Fold an access token into the request headers.
    pub fn with_bearer_token(self, access_token: &str) -> Self {
        self.with_header("Authorization", format!("Bearer {access_token}"))
    }

    /// The transport kind this descriptor selects.
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Stdio { .. } => TransportKind::Stdio,
            Self::Sse { .. } => TransportKind::Sse,
            Self::StreamableHttp { .. } => TransportKind::StreamableHttp,
        }
    }

    /// The endpoint URL for HTTP servers.
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Sse { url, .. } | Self::StreamableHttp { url, .. } => Some(url),
            Self::Stdio { .. } => None,
        }
    }

    /// Check that the descriptor can be used to open a connection.
    pub fn validate(&self) -> ProxyResult<()> {
        match self {
            Self::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(ProxyError::invalid_descriptor("command is required"));
                }
            }
            Self::Sse { url, headers } | Self::StreamableHttp { url, headers } => {
                parse_http_url(url)?;
                static_headers(headers)?;
            }
        }
        Ok(())
    }

    /// Headers for an outbound HTTP request.
    ///
    /// Static descriptor headers come first; allow-listed inbound headers
    /// override them.
    pub fn request_headers(&self, passthrough: &HeaderMap) -> ProxyResult<HeaderMap> {
        let mut headers = match self {
            Self::Sse { headers, .. } | Self::StreamableHttp { headers, .. } => {
                static_headers(headers)?
            }
            Self::Stdio { .. } => HeaderMap::new(),
        };
        for (name, value) in passthrough_headers(self.kind(), passthrough) {
            if let Some(name) = name {
                headers.insert(name, value);
            }
        }
        Ok(headers)
    }
}

/// Parse and check an http(s) endpoint URL.
pub fn parse_http_url(url: &str) -> ProxyResult<Url> {
    let parsed = Url::parse(url)
        .map_err(|e| ProxyError::invalid_descriptor(format!("invalid URL '{url}': {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(ProxyError::invalid_descriptor(format!(
            "unsupported URL scheme '{scheme}'"
        ))),
    }
}

/// Select the inbound headers that may reach a server of the given kind.
pub fn passthrough_headers(kind: TransportKind, incoming: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for name in kind.passthrough_allow_list() {
        if let Some(value) = incoming.get(*name) {
            headers.insert(HeaderName::from_static(*name), value.clone());
        }
    }
    headers
}

/// Whether the headers already carry credentials.
pub fn has_authorization(headers: &HeaderMap) -> bool {
    headers.contains_key(AUTHORIZATION)
}

fn static_headers(headers: &HashMap<String, String>) -> ProxyResult<HeaderMap> {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| ProxyError::invalid_descriptor(format!("header '{key}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ProxyError::invalid_descriptor(format!("header '{key}': {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incoming() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc"));
        headers.insert("mcp-session-id", HeaderValue::from_static("s-1"));
        headers.insert("last-event-id", HeaderValue::from_static("42"));
        headers.insert("cookie", HeaderValue::from_static("secret=1"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        headers
    }

    #[test]
    fn test_sse_passthrough_only_authorization() {
        let headers = passthrough_headers(TransportKind::Sse, &incoming());
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("authorization").unwrap(), "Bearer abc");
    }

    #[test]
    fn test_streamable_passthrough_allow_list() {
        let headers = passthrough_headers(TransportKind::StreamableHttp, &incoming());
        assert_eq!(headers.len(), 3);
        assert!(headers.contains_key("mcp-session-id"));
        assert!(headers.contains_key("last-event-id"));
        assert!(!headers.contains_key("cookie"));
    }

    #[test]
    fn test_stdio_passthrough_is_empty() {
        assert!(passthrough_headers(TransportKind::Stdio, &incoming()).is_empty());
    }

    #[test]
    fn test_request_headers_passthrough_overrides_static() {
        let descriptor = ServerDescriptor::sse("https://example.com/sse")
            .with_header("Authorization", "Bearer static")
            .with_header("X-Api-Version", "2");
        let headers = descriptor.request_headers(&incoming()).unwrap();
        assert_eq!(headers.get("authorization").unwrap(), "Bearer abc");
        assert_eq!(headers.get("x-api-version").unwrap(), "2");
        assert!(!headers.contains_key("cookie"));
    }

    #[test]
    fn test_with_bearer_token() {
        let descriptor =
            ServerDescriptor::streamable_http("https://example.com/mcp").with_bearer_token("tok");
        let headers = descriptor.request_headers(&HeaderMap::new()).unwrap();
        assert_eq!(headers.get("authorization").unwrap(), "Bearer tok");
        assert!(has_authorization(&headers));
    }

    #[test]
    fn test_validate() {
        assert!(ServerDescriptor::stdio("echo", ["hello"]).validate().is_ok());
        assert!(ServerDescriptor::stdio("  ", Vec::<String>::new())
            .validate()
            .is_err());
        assert!(ServerDescriptor::sse("https://example.com/sse").validate().is_ok());
        assert!(ServerDescriptor::sse("not a url").validate().is_err());
        assert!(ServerDescriptor::streamable_http("ftp://example.com")
            .validate()
            .is_err());
        assert!(ServerDescriptor::sse("https://example.com")
            .with_header("bad header", "x")
            .validate()
            .is_err());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("stdio".parse::<TransportKind>().unwrap(), TransportKind::Stdio);
        assert_eq!("sse".parse::<TransportKind>().unwrap(), TransportKind::Sse);
        assert_eq!(
            "streamable-http".parse::<TransportKind>().unwrap(),
            TransportKind::StreamableHttp
        );
        assert!("websocket".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_descriptor_serde() {
        let json = r#"{"type":"stdio","command":"npx","args":["-y","server"],"env":{"A":"1"}}"#;
        let descriptor: ServerDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(descriptor.kind(), TransportKind::Stdio);
        assert!(descriptor.url().is_none());

        let json = r#"{"type":"streamable-http","url":"https://example.com/mcp"}"#;
        let descriptor: ServerDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(descriptor.kind(), TransportKind::StreamableHttp);
        assert_eq!(descriptor.url(), Some("https://example.com/mcp"));
    }
}
