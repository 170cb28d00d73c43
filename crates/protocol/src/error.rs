//! Protocol errors and the in-band error envelope.

use serde::{Deserialize, Serialize};

/// Structured error report embedded in a gateway message:
/// `{"error":{"code":<int>,"message":"<str>"}}`.
///
/// The session layer watches for these — code 401 means the bearer token was
/// rejected and drives the refresh/reconnect logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: i64,
    pub message: String,
}

impl ErrorEnvelope {
    /// Extract the error info when `text` has the envelope shape, `None`
    /// for every other message.
    pub fn parse(text: &str) -> Option<ErrorInfo> {
        serde_json::from_str::<ErrorEnvelope>(text)
            .ok()
            .map(|envelope| envelope.error)
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "code {}: {}", self.code, self.message)
    }
}

/// Errors produced while parsing or serializing gateway messages.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("malformed message (id: {id:?}): {source}")]
    Malformed {
        #[source]
        source: serde_json::Error,
        id: Option<String>,
    },

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("unknown action message type {kind:?} (id: {id:?})")]
    UnknownAction { kind: String, id: Option<String> },

    #[error("message of type {kind:?} carries no id")]
    MissingId { kind: &'static str },
}

impl ProtocolError {
    /// The action id associated with the failure, when one was recoverable
    /// from the raw message. Used to Nack unparseable messages.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Malformed { id, .. } | Self::UnknownAction { id, .. } => id.as_deref(),
            Self::NotAnObject | Self::MissingId { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_parses_only_its_shape() {
        let info = ErrorEnvelope::parse(r#"{"error":{"code":401,"message":"token expired"}}"#)
            .expect("envelope");
        assert_eq!(info.code, 401);
        assert_eq!(info.message, "token expired");

        // An action-protocol error message is not an envelope.
        assert!(ErrorEnvelope::parse(r#"{"type":"error","code":401,"message":"x"}"#).is_none());
        assert!(ErrorEnvelope::parse("not json").is_none());
        assert!(ErrorEnvelope::parse(r#"{"error":"plain string"}"#).is_none());
    }
}
