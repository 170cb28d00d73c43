//! Reference action executor for the graph gateway.
//!
//! Connects to the action WebSocket API and handles three capabilities:
//!
//! - `ping` — reply with a pong and timestamp
//! - `echo` — reply with the submitted parameters
//! - `fail` — always fail, to exercise code-500 result reporting
//!
//! Usage:
//!   GW_TOKEN=secret gw-hello-action ws://localhost:8080/api/action-ws/1.0
//!
//! Env vars:
//!   GW_TOKEN        — bearer token (required)
//!   GW_WS_PROTOCOL  — handshake sub-protocol (default: "action-1.0.0")

use std::sync::Arc;

use chrono::Utc;
use tracing_subscriber::EnvFilter;

use gw_client::{
    ActionClient, ActionError, ActionHandler, ActionOutcome, EnvTokenProvider, SessionConfig,
    SubmitAction, WsEndpoint,
};

struct HelloHandler;

#[async_trait::async_trait]
impl ActionHandler for HelloHandler {
    async fn handle_action(
        &self,
        action: &SubmitAction,
    ) -> Result<ActionOutcome, ActionError> {
        tracing::info!(id = %action.id, capability = %action.capability, "executing action");
        match action.capability.as_str() {
            "ping" => Ok(ActionOutcome::Data(serde_json::json!({
                "pong": true,
                "timestamp": Utc::now().timestamp_millis(),
            }))),
            "echo" => {
                if action.parameters.is_null() {
                    Ok(ActionOutcome::Empty)
                } else {
                    Ok(ActionOutcome::Data(action.parameters.clone()))
                }
            }
            "fail" => Err(ActionError::Failed("this capability always fails".into())),
            other => Err(ActionError::Failed(format!("unknown capability: {other}"))),
        }
    }

    async fn on_config_changed(&self) {
        tracing::info!("gateway action configuration changed");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://localhost:8080/api/action-ws/1.0".into());
    let protocol =
        std::env::var("GW_WS_PROTOCOL").unwrap_or_else(|_| "action-1.0.0".into());

    let provider = Arc::new(
        EnvTokenProvider::new("GW_TOKEN")
            .with_endpoint("action-ws", WsEndpoint::new(&url, &protocol)),
    );

    tracing::info!(%url, %protocol, "starting action executor");

    let client = ActionClient::new(
        provider,
        SessionConfig::new("action-ws"),
        Arc::new(HelloHandler),
    )?;
    client.start().await?;
    tracing::info!("connected, executing actions until the session ends");

    tokio::select! {
        result = client.join() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
            client.stop().await?;
        }
    }

    tracing::info!("executor exiting");
    Ok(())
}
