//! Action protocol messages: the submit/ack/nack/result exchange.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::epoch_ms;

/// Wire envelope for the action sub-protocol, tagged by the `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ActionMessage {
    /// Gateway → client: execute an action.
    #[serde(rename = "submitAction")]
    Submit(SubmitAction),

    /// Client → gateway: result of a completed action. Also received when
    /// the remote side misroutes a result to an executor-only client.
    #[serde(rename = "sendActionResult")]
    Result(ActionResult),

    /// Positive receipt for the message carrying the same id.
    #[serde(rename = "acknowledged")]
    Ack(Receipt),

    /// Negative receipt; the peer wants the message with this id again.
    #[serde(rename = "negativeAcknowledged")]
    Nack(Receipt),

    /// Free-standing error report, not tied to an action id.
    #[serde(rename = "error")]
    Error { code: i64, message: String },

    /// The remote action handler configuration changed.
    #[serde(rename = "configChanged")]
    ConfigChanged,
}

/// An action request. `expires_at` is not part of the wire format: it is
/// computed exactly once, at parse time, as `now_ms + timeout`, and never
/// recomputed afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitAction {
    pub id: String,
    pub handler: String,
    pub capability: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Timeout in milliseconds.
    pub timeout: u64,
    #[serde(skip)]
    pub expires_at: i64,
}

/// Ack/Nack payload: an id plus an HTTP-style code and a human message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub id: String,
    pub code: i64,
    pub message: String,
}

/// A `sendActionResult` message. The result payload is double-encoded: the
/// `result` field on the wire is a JSON *string* containing the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub id: String,
    pub result: String,
}

impl ActionResult {
    /// Wrap `payload` for the wire, encoding it as a JSON string.
    pub fn new(id: impl Into<String>, payload: &serde_json::Value) -> Self {
        Self {
            id: id.into(),
            result: payload.to_string(),
        }
    }

    /// Decode the double-encoded payload.
    ///
    /// # Errors
    ///
    /// Returns an error when the `result` field does not contain valid JSON.
    pub fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.result)
    }
}

impl ActionMessage {
    /// Build an `acknowledged` receipt.
    pub fn ack(id: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self::Ack(Receipt {
            id: id.into(),
            code,
            message: message.into(),
        })
    }

    /// Build a `negativeAcknowledged` receipt.
    pub fn nack(id: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self::Nack(Receipt {
            id: id.into(),
            code,
            message: message.into(),
        })
    }

    /// Parse an inbound action message.
    ///
    /// An unknown `type` yields [`ProtocolError::UnknownAction`] carrying the
    /// offending id when one is present, so the caller can Nack it. A
    /// [`SubmitAction`] gets its `expires_at` stamped here.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed JSON, unknown message types, and
    /// id-carrying messages with an empty or missing id.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let map = crate::parse_object(text)?;
        let id = map.get("id").and_then(|v| v.as_str()).map(str::to_owned);
        let kind = map
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned();

        const KNOWN: [&str; 6] = [
            "submitAction",
            "sendActionResult",
            "acknowledged",
            "negativeAcknowledged",
            "error",
            "configChanged",
        ];
        if !KNOWN.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownAction { kind, id });
        }

        let mut message: ActionMessage =
            serde_json::from_value(serde_json::Value::Object(map))
                .map_err(|source| ProtocolError::Malformed { source, id })?;

        if let Some(empty_kind) = message.missing_id_kind() {
            return Err(ProtocolError::MissingId { kind: empty_kind });
        }
        if let ActionMessage::Submit(submit) = &mut message {
            submit.expires_at = epoch_ms() + submit.timeout as i64;
        }

        Ok(message)
    }

    /// Serialize for the wire.
    ///
    /// # Errors
    ///
    /// Returns an error when serialization fails (payloads containing
    /// non-string map keys, for example).
    pub fn to_wire(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|source| ProtocolError::Malformed {
            source,
            id: self.id().map(str::to_owned),
        })
    }

    /// The action id, for variants that carry one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Submit(m) => Some(&m.id),
            Self::Result(m) => Some(&m.id),
            Self::Ack(m) | Self::Nack(m) => Some(&m.id),
            Self::Error { .. } | Self::ConfigChanged => None,
        }
    }

    /// The wire name of this message's type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Submit(_) => "submitAction",
            Self::Result(_) => "sendActionResult",
            Self::Ack(_) => "acknowledged",
            Self::Nack(_) => "negativeAcknowledged",
            Self::Error { .. } => "error",
            Self::ConfigChanged => "configChanged",
        }
    }

    /// `Some(kind)` when this variant must carry an id but does not.
    fn missing_id_kind(&self) -> Option<&'static str> {
        self.id()
            .filter(|id| id.is_empty())
            .map(|_| self.kind())
    }
}
