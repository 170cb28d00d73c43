//! `gw-auth` — the token-provider contract for graph gateway clients.
//!
//! The WebSocket layer never acquires tokens itself; it consumes a
//! [`TokenProvider`] that hands out the current bearer token, refreshes it
//! in place, and describes which endpoint a named WebSocket API lives at.
//! Production deployments implement the trait on top of their auth service;
//! this crate ships the two trivial implementations that need no HTTP at
//! all:
//!
//! | Provider               | Token source            | `refresh()`          |
//! |------------------------|-------------------------|----------------------|
//! | [`FixedTokenProvider`] | given at construction   | fails (fixed token)  |
//! | [`EnvTokenProvider`]   | env var, read each call | fails (fixed token)  |
//!
//! # Example
//!
//! ```rust,no_run
//! use gw_auth::{FixedTokenProvider, WsEndpoint};
//!
//! let provider = FixedTokenProvider::new("my-bearer-token")
//!     .with_endpoint("action-ws", WsEndpoint::new("wss://gw.example.com/api/action/1.0", "action-1.0"))
//!     .with_endpoint("events-ws", WsEndpoint::new("wss://gw.example.com/api/events/1.0", "events-1.0"));
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Where a named WebSocket API lives and how to speak to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEndpoint {
    /// Full `ws://` or `wss://` URL.
    pub url: String,
    /// Sub-protocol name sent in the handshake (the token is appended to it).
    pub protocol: String,
    /// Optional HTTP proxy descriptor; see [`ProxyConfig`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
}

impl WsEndpoint {
    pub fn new(url: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            protocol: protocol.into(),
            proxy: None,
        }
    }

    /// Attach proxy settings to the endpoint. See [`ProxyConfig`] for what
    /// the session layer currently does with them.
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }
}

/// HTTP proxy settings carried with an endpoint.
///
/// These are descriptive metadata for deployments that live behind a
/// proxy: providers can load and hand them out, but the session layer
/// connects to the endpoint URL directly and does not yet open a CONNECT
/// tunnel through the configured proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    /// `(username, password)` for proxy authorization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<(String, String)>,
}

/// Supplies bearer tokens and endpoint descriptors to the session layer.
///
/// Implementations must be safe to share across sessions: `token()` and
/// `refresh()` may be called concurrently from multiple reader tasks.
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    /// The current bearer token.
    ///
    /// # Errors
    ///
    /// Returns an error when no token can be produced.
    async fn token(&self) -> Result<String, AuthError>;

    /// Refresh the token in place. The session layer calls this exactly once
    /// when the gateway rejects a previously accepted token.
    ///
    /// # Errors
    ///
    /// Returns an error when the token cannot be renewed; the session treats
    /// this as fatal.
    async fn refresh(&self) -> Result<(), AuthError>;

    /// Epoch milliseconds at which the token should be proactively refreshed,
    /// or `None` when it never expires. Drives the events keep-alive timer.
    fn refresh_time(&self) -> Option<i64> {
        None
    }

    /// Endpoint descriptor for a named WebSocket API (`"action-ws"`,
    /// `"events-ws"`).
    ///
    /// # Errors
    ///
    /// Returns an error when no endpoint is configured for `api_name`.
    fn websocket_endpoint(&self, api_name: &str) -> Result<WsEndpoint, AuthError>;
}

/// Errors from token providers.
#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("no token available: {0}")]
    NoToken(String),

    #[error("token was given externally and cannot be refreshed: {0}")]
    FixedToken(String),

    #[error("environment variable {0} is not set")]
    MissingEnv(String),

    #[error("no websocket endpoint configured for api {0:?}")]
    UnknownApi(String),

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
}

// ── Fixed token ──────────────────────────────────────────────────────

/// Token handed in from outside; cannot be refreshed.
#[derive(Debug, Clone)]
pub struct FixedTokenProvider {
    token: String,
    endpoints: HashMap<String, WsEndpoint>,
}

impl FixedTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            endpoints: HashMap::new(),
        }
    }

    /// Register the endpoint for a named WebSocket API.
    pub fn with_endpoint(mut self, api_name: impl Into<String>, endpoint: WsEndpoint) -> Self {
        self.endpoints.insert(api_name.into(), endpoint);
        self
    }
}

#[async_trait::async_trait]
impl TokenProvider for FixedTokenProvider {
    async fn token(&self) -> Result<String, AuthError> {
        Ok(self.token.clone())
    }

    async fn refresh(&self) -> Result<(), AuthError> {
        Err(AuthError::FixedToken(
            "token was given at construction".to_owned(),
        ))
    }

    fn websocket_endpoint(&self, api_name: &str) -> Result<WsEndpoint, AuthError> {
        self.endpoints
            .get(api_name)
            .cloned()
            .ok_or_else(|| AuthError::UnknownApi(api_name.to_owned()))
    }
}

// ── Environment token ────────────────────────────────────────────────

/// Token read from an environment variable on every call, so external
/// rotation of the variable is picked up without a restart.
#[derive(Debug, Clone)]
pub struct EnvTokenProvider {
    var: String,
    endpoints: HashMap<String, WsEndpoint>,
}

impl EnvTokenProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self {
            var: var.into(),
            endpoints: HashMap::new(),
        }
    }

    /// Register the endpoint for a named WebSocket API.
    pub fn with_endpoint(mut self, api_name: impl Into<String>, endpoint: WsEndpoint) -> Self {
        self.endpoints.insert(api_name.into(), endpoint);
        self
    }
}

#[async_trait::async_trait]
impl TokenProvider for EnvTokenProvider {
    async fn token(&self) -> Result<String, AuthError> {
        std::env::var(&self.var).map_err(|_| AuthError::MissingEnv(self.var.clone()))
    }

    async fn refresh(&self) -> Result<(), AuthError> {
        Err(AuthError::FixedToken(format!(
            "token comes from environment variable {:?}",
            self.var
        )))
    }

    fn websocket_endpoint(&self, api_name: &str) -> Result<WsEndpoint, AuthError> {
        self.endpoints
            .get(api_name)
            .cloned()
            .ok_or_else(|| AuthError::UnknownApi(api_name.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_provider_serves_token_but_never_refreshes() {
        let provider = FixedTokenProvider::new("tok")
            .with_endpoint("action-ws", WsEndpoint::new("ws://localhost:1/x", "action-1.0"));

        assert_eq!(provider.token().await.unwrap(), "tok");
        assert!(matches!(
            provider.refresh().await,
            Err(AuthError::FixedToken(_))
        ));
        assert_eq!(provider.refresh_time(), None);

        let endpoint = provider.websocket_endpoint("action-ws").unwrap();
        assert_eq!(endpoint.protocol, "action-1.0");
        assert!(matches!(
            provider.websocket_endpoint("events-ws"),
            Err(AuthError::UnknownApi(_))
        ));
    }

    #[tokio::test]
    async fn env_provider_reads_variable_each_call() {
        std::env::set_var("GW_TEST_TOKEN_VAR", "first");
        let provider = EnvTokenProvider::new("GW_TEST_TOKEN_VAR");
        assert_eq!(provider.token().await.unwrap(), "first");

        std::env::set_var("GW_TEST_TOKEN_VAR", "rotated");
        assert_eq!(provider.token().await.unwrap(), "rotated");

        let missing = EnvTokenProvider::new("GW_TEST_TOKEN_VAR_MISSING");
        assert!(matches!(
            missing.token().await,
            Err(AuthError::MissingEnv(_))
        ));
    }
}
