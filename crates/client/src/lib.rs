//! `gw-client` — Resilient WebSocket clients for the graph gateway.
//!
//! Two clients share one session core: [`ActionClient`] executes actions
//! submitted by the gateway, [`EventsClient`] streams graph change
//! notifications. Both survive network failures and token expiry without
//! losing protocol state.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │  Your executor / consumer                                  │
//! │                                                            │
//! │   let provider = Arc::new(EnvTokenProvider::new("TOKEN")   │
//! │       .with_endpoint("action-ws", endpoint));              │
//! │   let client = ActionClient::new(                          │
//! │       provider, SessionConfig::new("action-ws"), handler)?;│
//! │   client.start().await?;                                   │
//! └──────────────┬─────────────────────────────────────────────┘
//!                │
//!     ActionClient / EventsClient      protocol layer
//!                │
//!            WsSession                 reconnect + token + 401 watch
//!                │
//!         tokio-tungstenite            one socket at a time
//! ```
//!
//! # Connection flow (hard-coded by the session)
//!
//! 1. Fetch the current token, open the socket with
//!    `Sec-WebSocket-Protocol: <protocol>, token-<token>`
//! 2. Until the first message is accepted the session is checking the
//!    token: an in-band 401 here is fatal (the token never worked)
//! 3. Any accepted message marks the session running and resets the
//!    reconnect backoff
//! 4. An in-band 401 after that refreshes the token once and reconnects
//!    immediately
//! 5. On disconnect: reconnect with a stepped, eventually randomized
//!    backoff (0s → 60s → spread over 60–600s)

pub mod action;
pub mod backoff;
pub mod error;
pub mod events;
pub mod session;
pub mod store;

// ── Re-exports for ergonomic imports ─────────────────────────────────

pub use action::{result_envelope, ActionClient, ActionHandler, ActionOutcome};
pub use backoff::ReconnectSchedule;
pub use error::{ActionError, SessionError, StoreError};
pub use events::{EventsClient, EventsHandler};
pub use session::{ReaderStatus, SessionConfig, SessionHandle, SessionHandler, WsSession};
pub use store::{ActionStore, DEFAULT_RETRIES};

// Re-export the protocol and auth surface so executors never need to
// import gw-protocol or gw-auth directly.
pub use gw_auth::{
    AuthError, EnvTokenProvider, FixedTokenProvider, ProxyConfig, TokenProvider, WsEndpoint,
};
pub use gw_protocol::{
    ActionMessage, ActionResult, EventMessage, EventsControl, EventsFilter, Receipt, SubmitAction,
};
