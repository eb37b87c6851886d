//! Application state.

use crate::config::InspectorConfig;
use crate::error::ServerResult;
use inspector_auth::{
    default_credentials_path, AuthFlow, CredentialStore, FileCredentialStore,
    MemoryCredentialStore,
};
use inspector_proxy::ProxyService;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

/// Authorization flows keyed by normalized server URL.
pub type FlowMap = Arc<RwLock<HashMap<String, Arc<Mutex<AuthFlow>>>>>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Session proxy.
    pub proxy: Arc<ProxyService>,
    /// Effective configuration.
    pub config: Arc<InspectorConfig>,
    /// Credential store shared by every flow.
    pub credentials: Arc<dyn CredentialStore>,
    /// Live authorization flows.
    pub flows: FlowMap,
    /// Client for the metadata proxy.
    pub http: reqwest::Client,
    port: Arc<AtomicU16>,
}

impl AppState {
    /// Build the state from configuration, with the real transport factory.
    pub fn new(config: InspectorConfig) -> ServerResult<Self> {
        let proxy = ProxyService::new(config.to_proxy_config())?;
        let credentials = credential_store(&config);
        Self::with_parts(config, proxy, credentials)
    }

    /// Build the state around an existing proxy and credential store.
    pub fn with_parts(
        config: InspectorConfig,
        proxy: ProxyService,
        credentials: Arc<dyn CredentialStore>,
    ) -> ServerResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.flow_config().request_timeout)
            .build()
            .map_err(inspector_auth::AuthError::from)?;
        let port = Arc::new(AtomicU16::new(config.port()));
        Ok(Self {
            proxy: Arc::new(proxy),
            config: Arc::new(config),
            credentials,
            flows: Arc::new(RwLock::new(HashMap::new())),
            http,
            port,
        })
    }

    /// Port the server is actually listening on.
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Relaxed)
    }

    pub fn set_port(&self, port: u16) {
        self.port.store(port, Ordering::Relaxed);
    }
}

/// File-backed store at the configured or default path, in memory otherwise.
fn credential_store(config: &InspectorConfig) -> Arc<dyn CredentialStore> {
    let path = config
        .credentials_path
        .clone()
        .or_else(default_credentials_path);
    match path {
        Some(path) => Arc::new(FileCredentialStore::with_path(path)),
        None => {
            warn!("No data directory available, keeping credentials in memory");
            Arc::new(MemoryCredentialStore::new())
        }
    }
}
