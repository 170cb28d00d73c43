//! Graph gateway wire protocol: action messages, event messages, and the
//! in-band error envelope.
//!
//! All messages are JSON objects exchanged over a WebSocket sub-protocol.
//! Field names here are bit-exact contracts with the gateway — do not rename
//! without a protocol version bump.
//!
//! The two sub-protocols share a transport but not a vocabulary:
//!
//! - **Actions** (`action-ws`): a bidirectional submit/ack/nack/result RPC
//!   exchange, see [`ActionMessage`].
//! - **Events** (`events-ws`): a server push stream of graph change
//!   notifications, see [`EventMessage`] and [`EventsControl`].

pub mod action;
pub mod error;
pub mod events;

pub use action::{ActionMessage, ActionResult, Receipt, SubmitAction};
pub use error::{ErrorEnvelope, ErrorInfo, ProtocolError};
pub use events::{EventMessage, EventsControl, EventsFilter, TokenArgs, UnregisterArgs};

/// Current wall-clock time as milliseconds since the Unix epoch.
///
/// All expiry bookkeeping in the protocol (submit timeouts, store entries,
/// token refresh times) uses this unit.
pub fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Deserialize a JSON text into an arbitrary object map.
///
/// Returns an error for anything that is not a JSON object, since every
/// gateway message is one.
pub(crate) fn parse_object(text: &str) -> Result<serde_json::Map<String, serde_json::Value>, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|source| ProtocolError::Malformed { source, id: None })?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(ProtocolError::NotAnObject),
    }
}
