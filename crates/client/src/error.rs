//! Error types for the session layer and the stores.

use gw_auth::AuthError;
use gw_protocol::ProtocolError;

/// Errors surfaced by [`WsSession`](crate::session::WsSession) and the
/// protocol clients built on it.
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("websocket: {0}")]
    WebSocket(String),

    #[error("startup failed: {0}")]
    Startup(String),

    /// The gateway answered 401 before any message was ever accepted on the
    /// connection: the token is fundamentally invalid, refreshing would loop
    /// forever.
    #[error("token was never valid on this connection: {0}")]
    TokenNeverValid(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("could not send and all retries have been exhausted")]
    SendRetriesExhausted,

    #[error("session is not running")]
    NotRunning,

    /// A protocol-layer hook failed; the reader stores this and surfaces it
    /// when the session is joined.
    #[error("handler: {0}")]
    Handler(String),
}

/// Errors from [`ActionStore`](crate::store::ActionStore) mutations. Both
/// kinds are benign races in protocol handling and resolved by logging.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("message has expired: {kind} (id: {id})")]
    Expired { id: String, kind: &'static str },

    #[error("message id already stored: {kind} (id: {id})")]
    Exists { id: String, kind: &'static str },
}

/// Error returned by an [`ActionHandler`](crate::action::ActionHandler).
/// Converted into a code-500 action result, never propagated to the
/// transport.
#[derive(thiserror::Error, Debug)]
pub enum ActionError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
