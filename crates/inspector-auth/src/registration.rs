//! Client registration strategies.
//!
//! Strategies run in order until one yields a client. The defaults try
//! dynamic registration, then a client persisted by an earlier flow, then a
//! static client synthesized from the inspector's own metadata.

use crate::client::register_client;
use crate::error::{AuthError, AuthResult};
use crate::storage::ServerCredentials;
use crate::types::{ClientInformation, ClientMetadata, OAuthMetadata};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info, warn};

/// Everything a strategy may need.
pub struct RegistrationContext<'a> {
    pub http: &'a Client,
    pub metadata: &'a OAuthMetadata,
    pub client_metadata: &'a ClientMetadata,
    pub credentials: &'a ServerCredentials,
}

/// Result of one strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationOutcome {
    Registered(ClientInformation),
    /// Not applicable or failed; the reason is reported if nothing succeeds.
    TryNext(String),
}

/// One way of obtaining a client record.
#[async_trait]
pub trait RegistrationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn register(&self, ctx: &RegistrationContext<'_>) -> AuthResult<RegistrationOutcome>;
}

/// RFC 7591 dynamic client registration.
#[derive(Debug, Default)]
pub struct DynamicRegistration;

#[async_trait]
impl RegistrationStrategy for DynamicRegistration {
    fn name(&self) -> &'static str {
        "dynamic"
    }

    async fn register(&self, ctx: &RegistrationContext<'_>) -> AuthResult<RegistrationOutcome> {
        if ctx.metadata.registration_endpoint.is_none() {
            return Ok(RegistrationOutcome::TryNext(
                "server does not advertise a registration endpoint".to_string(),
            ));
        }
        match register_client(ctx.http, ctx.metadata, ctx.client_metadata).await {
            Ok(client) => Ok(RegistrationOutcome::Registered(client)),
            Err(e) => {
                debug!(server = %ctx.credentials.server_url(), error = %e, "Dynamic registration failed");
                Ok(RegistrationOutcome::TryNext(e.to_string()))
            }
        }
    }
}

/// A client stored by an earlier flow for the same server.
#[derive(Debug, Default)]
pub struct PersistedClient;

#[async_trait]
impl RegistrationStrategy for PersistedClient {
    fn name(&self) -> &'static str {
        "persisted"
    }

    async fn register(&self, ctx: &RegistrationContext<'_>) -> AuthResult<RegistrationOutcome> {
        match ctx.credentials.client_information().await {
            Ok(Some(client)) => Ok(RegistrationOutcome::Registered(client)),
            Ok(None) => Ok(RegistrationOutcome::TryNext("no persisted client".to_string())),
            Err(e) => {
                warn!(server = %ctx.credentials.server_url(), error = %e, "Persisted client unreadable");
                Ok(RegistrationOutcome::TryNext(e.to_string()))
            }
        }
    }
}

/// A client synthesized from the inspector's fixed metadata.
#[derive(Debug, Default)]
pub struct StaticClient;

#[async_trait]
impl RegistrationStrategy for StaticClient {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn register(&self, ctx: &RegistrationContext<'_>) -> AuthResult<RegistrationOutcome> {
        let mut client = ClientInformation::public(format!(
            "static_client_{}",
            crate::current_time_ms()
        ));
        if let Value::Object(fields) = serde_json::to_value(ctx.client_metadata)? {
            client.extra = fields;
        }
        Ok(RegistrationOutcome::Registered(client))
    }
}

/// The default strategy order.
pub fn default_strategies() -> Vec<Box<dyn RegistrationStrategy>> {
    vec![
        Box::new(DynamicRegistration),
        Box::new(PersistedClient),
        Box::new(StaticClient),
    ]
}

/// Run `strategies` in order and return the first client with the strategy name.
pub async fn register_with(
    strategies: &[Box<dyn RegistrationStrategy>],
    ctx: &RegistrationContext<'_>,
) -> AuthResult<(ClientInformation, &'static str)> {
    let mut reasons = Vec::new();
    for strategy in strategies {
        match strategy.register(ctx).await? {
            RegistrationOutcome::Registered(client) => {
                info!(
                    server = %ctx.credentials.server_url(),
                    strategy = strategy.name(),
                    client_id = %client.client_id,
                    "Client registration completed"
                );
                return Ok((client, strategy.name()));
            }
            RegistrationOutcome::TryNext(reason) => {
                reasons.push(format!("{}: {reason}", strategy.name()));
            }
        }
    }
    Err(AuthError::Registration(format!(
        "No registration strategy produced a client ({})",
        reasons.join("; ")
    )))
}
