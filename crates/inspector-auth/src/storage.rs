//! Credential storage.
//!
//! A [`CredentialStore`] is a flat key/value map of JSON values.
//! [`ServerCredentials`] layers typed, per-server records on top of it.

use crate::error::{AuthError, AuthResult};
use crate::types::{ClientInformation, OAuthMetadata, OAuthTokens};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Key/value persistence for authorization artifacts.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Read a value.
    async fn get(&self, key: &str) -> AuthResult<Option<Value>>;

    /// Write a value, replacing any previous one.
    async fn set(&self, key: &str, value: Value) -> AuthResult<()>;

    /// Remove a value. Returns `true` if it existed.
    async fn remove(&self, key: &str) -> AuthResult<bool>;
}

/// Credentials kept in a JSON file.
///
/// The file is created on first write with restrictive permissions on Unix.
/// Reads are served from an in-memory cache that every write refreshes.
/// Writes are serialized so concurrent flows never drop each other's keys.
pub struct FileCredentialStore {
    /// Path to the credentials file.
    path: PathBuf,
    /// In-memory cache of the file contents.
    cache: RwLock<Option<HashMap<String, Value>>>,
    /// Serializes read-modify-write cycles on the file.
    write_lock: Mutex<()>,
}

impl FileCredentialStore {
    /// Create a store at the default path.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be determined.
    pub fn new() -> AuthResult<Self> {
        let path = crate::default_credentials_path().ok_or(AuthError::NoDataDir)?;
        Ok(Self::with_path(path))
    }

    /// Create a store at a custom path.
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            cache: RwLock::new(None),
            write_lock: Mutex::new(()),
        }
    }

    /// Get the path to the credentials file.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// All stored keys.
    pub async fn keys(&self) -> AuthResult<Vec<String>> {
        let mut keys: Vec<String> = self.all().await?.into_keys().collect();
        keys.sort();
        Ok(keys)
    }

    async fn all(&self) -> AuthResult<HashMap<String, Value>> {
        {
            let cache = self.cache.read().await;
            if let Some(data) = &*cache {
                return Ok(data.clone());
            }
        }

        let data = self.read_all().await?;
        *self.cache.write().await = Some(data.clone());
        Ok(data)
    }

    async fn read_all(&self) -> AuthResult<HashMap<String, Value>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let content = tokio::fs::read_to_string(&self.path).await?;
        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }

        let raw: Value = serde_json::from_str(&content)?;
        match raw {
            Value::Object(entries) => Ok(entries.into_iter().collect()),
            _ => {
                warn!(path = ?self.path, "Credentials file is not an object, ignoring it");
                Ok(HashMap::new())
            }
        }
    }

    async fn write_all(&self, data: &HashMap<String, Value>) -> AuthResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(data)?;
        tokio::fs::write(&self.path, &content).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&self.path, perms)
                .await
                .map_err(|e| {
                    AuthError::Permissions(format!(
                        "Failed to set permissions on {:?}: {}",
                        self.path, e
                    ))
                })?;
        }

        debug!(path = ?self.path, "Wrote credentials file");
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get(&self, key: &str) -> AuthResult<Option<Value>> {
        Ok(self.all().await?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> AuthResult<()> {
        let _write = self.write_lock.lock().await;
        let mut all = self.all().await?;
        all.insert(key.to_string(), value);
        self.write_all(&all).await?;
        *self.cache.write().await = Some(all);
        Ok(())
    }

    async fn remove(&self, key: &str) -> AuthResult<bool> {
        let _write = self.write_lock.lock().await;
        let mut all = self.all().await?;
        let existed = all.remove(key).is_some();
        if existed {
            self.write_all(&all).await?;
            *self.cache.write().await = Some(all);
        }
        Ok(existed)
    }
}

impl std::fmt::Debug for FileCredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCredentialStore")
            .field("path", &self.path)
            .finish()
    }
}

/// Credentials held in memory only.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, key: &str) -> AuthResult<Option<Value>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> AuthResult<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> AuthResult<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }
}

/// Which per-server records to discard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialScope {
    All,
    Client,
    Tokens,
    Verifier,
}

const CLIENT_INFO: &str = "client-info";
const TOKENS: &str = "tokens";
const VERIFIER: &str = "verifier";
const SERVER_METADATA: &str = "server-metadata";
const SERVER_URL: &str = "server-url";

/// Typed records for one protocol server.
#[derive(Clone)]
pub struct ServerCredentials {
    store: Arc<dyn CredentialStore>,
    server_url: String,
}

impl ServerCredentials {
    pub fn new(store: Arc<dyn CredentialStore>, server_url: impl Into<String>) -> Self {
        Self {
            store,
            server_url: server_url.into(),
        }
    }

    /// The server these records belong to.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn key(&self, kind: &str) -> String {
        format!("{kind}-{}", self.server_url)
    }

    /// Load a record, treating an unreadable one as absent.
    async fn load<T: DeserializeOwned>(&self, kind: &str) -> AuthResult<Option<T>> {
        let Some(value) = self.store.get(&self.key(kind)).await? else {
            return Ok(None);
        };
        match serde_json::from_value(value) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(server = %self.server_url, kind, error = %e, "Skipping invalid credential entry");
                Ok(None)
            }
        }
    }

    async fn save<T: Serialize>(&self, kind: &str, record: &T) -> AuthResult<()> {
        self.store
            .set(&self.key(kind), serde_json::to_value(record)?)
            .await
    }

    pub async fn client_information(&self) -> AuthResult<Option<ClientInformation>> {
        self.load(CLIENT_INFO).await
    }

    pub async fn save_client_information(&self, client: &ClientInformation) -> AuthResult<()> {
        self.save(CLIENT_INFO, client).await
    }

    pub async fn tokens(&self) -> AuthResult<Option<OAuthTokens>> {
        self.load(TOKENS).await
    }

    pub async fn save_tokens(&self, tokens: &OAuthTokens) -> AuthResult<()> {
        self.save(TOKENS, tokens).await
    }

    pub async fn code_verifier(&self) -> AuthResult<Option<String>> {
        self.load(VERIFIER).await
    }

    pub async fn save_code_verifier(&self, verifier: &str) -> AuthResult<()> {
        self.save(VERIFIER, &verifier).await
    }

    pub async fn server_metadata(&self) -> AuthResult<Option<OAuthMetadata>> {
        self.load(SERVER_METADATA).await
    }

    pub async fn save_server_metadata(&self, metadata: &OAuthMetadata) -> AuthResult<()> {
        self.save(SERVER_METADATA, metadata).await
    }

    /// Record the server URL itself so stored entries can be listed by server.
    pub async fn save_server_url(&self) -> AuthResult<()> {
        self.save(SERVER_URL, &self.server_url).await
    }

    /// Discard the records in `scope`.
    pub async fn invalidate(&self, scope: CredentialScope) -> AuthResult<()> {
        let kinds: &[&str] = match scope {
            CredentialScope::All => &[CLIENT_INFO, TOKENS, VERIFIER, SERVER_METADATA, SERVER_URL],
            CredentialScope::Client => &[CLIENT_INFO],
            CredentialScope::Tokens => &[TOKENS],
            CredentialScope::Verifier => &[VERIFIER],
        };
        for kind in kinds {
            self.store.remove(&self.key(kind)).await?;
        }
        debug!(server = %self.server_url, ?scope, "Invalidated credentials");
        Ok(())
    }
}

impl std::fmt::Debug for ServerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCredentials")
            .field("server_url", &self.server_url)
            .finish()
    }
}
