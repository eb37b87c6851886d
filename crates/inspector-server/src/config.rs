//! Inspector configuration.
//!
//! Configuration is layered. Loading order (later sources override earlier):
//! 1. Global config from `~/.config/inspector/config.json`
//! 2. `INSPECTOR_CONFIG_CONTENT` environment variable
//! 3. Project config (`inspector.jsonc` or `inspector.json`) in the working directory
//! 4. An explicit `--config` file
//! 5. Environment overrides (`PORT`, `SERVER_PORT`, `HOST`, `INSPECTOR_MAX_SESSIONS`,
//!    `MCP_ENV_VARS`)
//!
//! CLI flags are applied on top by the binary.

use crate::error::{ConfigError, ConfigResult};
use inspector_auth::FlowConfig;
use inspector_proxy::{ProxyConfig, TransportConfig, TransportKind, DEFAULT_MAX_SESSIONS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 6277;
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 5_000;

const CONFIG_CONTENT_VAR: &str = "INSPECTOR_CONFIG_CONTENT";
const PROJECT_FILES: [&str; 2] = ["inspector.jsonc", "inspector.json"];

static VAR_REGEX: OnceLock<regex::Regex> = OnceLock::new();

fn var_regex() -> &'static regex::Regex {
    VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\{(env|file):([^}]+)\}")
            .expect("Invalid regex pattern - this is a compile-time constant")
    })
}

/// Main configuration structure.
///
/// Every field is optional so layers can be merged; the accessors apply
/// the defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InspectorConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Ceiling on concurrent proxy sessions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_sessions: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub handshake_timeout_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_timeout_ms: Option<u64>,

    /// Environment passed to every stdio server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,

    /// Server the UI connects to when the request names none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_server: Option<DefaultServerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthConfig>,

    /// Where per-server credentials are stored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials_path: Option<PathBuf>,
}

/// Default server settings offered to the UI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DefaultServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl DefaultServerConfig {
    fn merge(self, other: Self) -> Self {
        Self {
            transport: merge_option(self.transport, other.transport),
            command: merge_option(self.command, other.command),
            args: merge_option(self.args, other.args),
            url: merge_option(self.url, other.url),
        }
    }
}

/// Client identity used by authorization flows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OAuthConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_uri: Option<String>,
}

impl OAuthConfig {
    fn merge(self, other: Self) -> Self {
        Self {
            redirect_url: merge_option(self.redirect_url, other.redirect_url),
            client_name: merge_option(self.client_name, other.client_name),
            client_uri: merge_option(self.client_uri, other.client_uri),
        }
    }
}

impl InspectorConfig {
    /// Load configuration from all sources.
    pub async fn load(
        project_dir: Option<&Path>,
        explicit: Option<&Path>,
    ) -> ConfigResult<(Self, Vec<PathBuf>)> {
        Self::load_from(
            Self::global_config_dir().as_deref(),
            project_dir,
            explicit,
            &|name| std::env::var(name).ok(),
        )
        .await
    }

    async fn load_from(
        global_dir: Option<&Path>,
        project_dir: Option<&Path>,
        explicit: Option<&Path>,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> ConfigResult<(Self, Vec<PathBuf>)> {
        let mut config = InspectorConfig::default();
        let mut sources = Vec::new();

        if let Some(dir) = global_dir {
            let path = dir.join("config.json");
            if path.exists() {
                config = config.merge(Self::load_file_with(&path, env).await?);
                sources.push(path);
            }
        }

        if let Some(content) = env(CONFIG_CONTENT_VAR) {
            config = config.merge(Self::parse_jsonc(&content, "<env>")?);
        }

        if let Some(dir) = project_dir {
            for name in PROJECT_FILES {
                let path = dir.join(name);
                if path.exists() {
                    config = config.merge(Self::load_file_with(&path, env).await?);
                    sources.push(path);
                    break;
                }
            }
        }

        if let Some(path) = explicit {
            config = config.merge(Self::load_file_with(path, env).await?);
            sources.push(path.to_path_buf());
        }

        config.apply_env(env)?;
        Ok((config, sources))
    }

    /// Get the global config directory.
    ///
    /// On Unix systems, prefers `~/.config/inspector` over the platform
    /// directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            if let Some(home) = dirs::home_dir() {
                let xdg_config = home.join(".config").join("inspector");
                if xdg_config.exists() {
                    return Some(xdg_config);
                }
            }
        }

        dirs::config_dir().map(|d| d.join("inspector"))
    }

    /// Load configuration from a file.
    pub async fn load_file(path: &Path) -> ConfigResult<Self> {
        Self::load_file_with(path, &|name| std::env::var(name).ok()).await
    }

    async fn load_file_with(
        path: &Path,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> ConfigResult<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let content = substitute_variables(&content, path, env)?;
        Self::parse_jsonc(&content, &path.display().to_string())
    }

    fn parse_jsonc(content: &str, source: &str) -> ConfigResult<Self> {
        let stripped = strip_comments(content);
        serde_json::from_str(&stripped).map_err(|e| ConfigError::InvalidJson {
            path: source.to_string(),
            message: e.to_string(),
        })
    }

    /// Apply environment overrides.
    ///
    /// `SERVER_PORT` wins over `PORT`. `MCP_ENV_VARS` is a JSON object merged
    /// into the stdio environment.
    pub fn apply_env(&mut self, env: &dyn Fn(&str) -> Option<String>) -> ConfigResult<()> {
        for key in ["PORT", "SERVER_PORT"] {
            if let Some(value) = env(key) {
                self.port = Some(parse_value(key, &value)?);
            }
        }
        if let Some(host) = env("HOST").filter(|h| !h.trim().is_empty()) {
            self.host = Some(host);
        }
        if let Some(value) = env("INSPECTOR_MAX_SESSIONS") {
            self.max_sessions = Some(parse_value("INSPECTOR_MAX_SESSIONS", &value)?);
        }
        if let Some(value) = env("MCP_ENV_VARS") {
            let vars: HashMap<String, String> =
                serde_json::from_str(&value).map_err(|e| ConfigError::InvalidValue {
                    key: "MCP_ENV_VARS".to_string(),
                    message: e.to_string(),
                })?;
            self.env = merge_hashmap(self.env.take(), Some(vars));
        }
        Ok(())
    }

    /// Merge another config into this one (other takes precedence).
    pub fn merge(self, other: Self) -> Self {
        Self {
            host: merge_option(self.host, other.host),
            port: merge_option(self.port, other.port),
            max_sessions: merge_option(self.max_sessions, other.max_sessions),
            handshake_timeout_ms: merge_option(self.handshake_timeout_ms, other.handshake_timeout_ms),
            close_timeout_ms: merge_option(self.close_timeout_ms, other.close_timeout_ms),
            env: merge_hashmap(self.env, other.env),
            default_server: match (self.default_server, other.default_server) {
                (Some(b), Some(o)) => Some(b.merge(o)),
                (b, o) => o.or(b),
            },
            oauth: match (self.oauth, other.oauth) {
                (Some(b), Some(o)) => Some(b.merge(o)),
                (b, o) => o.or(b),
            },
            credentials_path: merge_option(self.credentials_path, other.credentials_path),
        }
    }

    /// Reject values the proxy cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_sessions == Some(0) {
            return Err(invalid("maxSessions", "must be greater than zero"));
        }
        if self.handshake_timeout_ms == Some(0) {
            return Err(invalid("handshakeTimeoutMs", "must be greater than zero"));
        }
        if self.close_timeout_ms == Some(0) {
            return Err(invalid("closeTimeoutMs", "must be greater than zero"));
        }
        if let Some(transport) = self.default_transport() {
            transport
                .parse::<TransportKind>()
                .map_err(|e| invalid("defaultServer.transport", e))?;
        }
        Ok(())
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_HOST)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions.unwrap_or(DEFAULT_MAX_SESSIONS)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(
            self.handshake_timeout_ms
                .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_MS),
        )
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms.unwrap_or(DEFAULT_CLOSE_TIMEOUT_MS))
    }

    pub fn default_env(&self) -> HashMap<String, String> {
        self.env.clone().unwrap_or_default()
    }

    pub fn default_transport(&self) -> Option<&str> {
        self.default_server.as_ref()?.transport.as_deref()
    }

    pub fn default_command(&self) -> Option<&str> {
        self.default_server.as_ref()?.command.as_deref()
    }

    pub fn default_args(&self) -> &[String] {
        self.default_server
            .as_ref()
            .and_then(|s| s.args.as_deref())
            .unwrap_or_default()
    }

    pub fn default_server_url(&self) -> Option<&str> {
        self.default_server.as_ref()?.url.as_deref()
    }

    /// Settings for the session proxy.
    pub fn to_proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            max_sessions: self.max_sessions(),
            close_timeout: self.close_timeout(),
            transport: TransportConfig {
                handshake_timeout: self.handshake_timeout(),
                default_env: self.default_env(),
                ..TransportConfig::default()
            },
            ..ProxyConfig::default()
        }
    }

    /// Settings for authorization flows.
    pub fn flow_config(&self) -> FlowConfig {
        let defaults = FlowConfig::default();
        let oauth = self.oauth.clone().unwrap_or_default();
        FlowConfig {
            redirect_url: oauth.redirect_url.unwrap_or(defaults.redirect_url),
            client_name: oauth.client_name.unwrap_or(defaults.client_name),
            client_uri: oauth.client_uri.unwrap_or(defaults.client_uri),
            request_timeout: defaults.request_timeout,
        }
    }
}

fn invalid(key: &str, message: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn parse_value<T>(key: &str, value: &str) -> ConfigResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| invalid(key, e))
}

/// Strip `//` and `/* */` comments outside of strings.
fn strip_comments(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escape_next = false;

    while let Some(c) = chars.next() {
        if escape_next {
            result.push(c);
            escape_next = false;
            continue;
        }
        if in_string {
            match c {
                '\\' => escape_next = true,
                '"' => in_string = false,
                _ => {}
            }
            result.push(c);
            continue;
        }

        match (c, chars.peek()) {
            ('"', _) => {
                in_string = true;
                result.push(c);
            }
            ('/', Some('/')) => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        result.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = ' ';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    // Keep line numbers stable for parse errors.
                    if c == '\n' {
                        result.push('\n');
                    }
                    prev = c;
                }
            }
            _ => result.push(c),
        }
    }

    result
}

/// Substitute `{env:VAR}` and `{file:path}` placeholders.
///
/// File references are resolved relative to the config file.
fn substitute_variables(
    content: &str,
    config_path: &Path,
    env: &dyn Fn(&str) -> Option<String>,
) -> ConfigResult<String> {
    let config_dir = config_path.parent().unwrap_or(Path::new("."));
    let mut result = content.to_string();

    for cap in var_regex().captures_iter(content) {
        let (Some(full), Some(kind), Some(value)) = (cap.get(0), cap.get(1), cap.get(2)) else {
            continue;
        };
        let value = value.as_str();

        let replacement = match kind.as_str() {
            "env" => env(value).ok_or_else(|| ConfigError::EnvVarNotFound {
                name: value.to_string(),
            })?,
            "file" => {
                let file_path = config_dir.join(value);
                std::fs::read_to_string(&file_path)
                    .map(|v| v.trim().to_string())
                    .map_err(|_| ConfigError::FileRefNotFound {
                        path: file_path.display().to_string(),
                    })?
            }
            _ => continue,
        };

        result = result.replace(full.as_str(), &replacement);
    }

    Ok(result)
}

fn merge_option<T>(base: Option<T>, other: Option<T>) -> Option<T> {
    match (base, other) {
        (_, Some(o)) => Some(o),
        (b, None) => b,
    }
}

fn merge_hashmap<K: std::hash::Hash + Eq, V>(
    base: Option<HashMap<K, V>>,
    other: Option<HashMap<K, V>>,
) -> Option<HashMap<K, V>> {
    match (base, other) {
        (Some(mut b), Some(o)) => {
            b.extend(o);
            Some(b)
        }
        (b, None) => b,
        (None, o) => o,
    }
}
