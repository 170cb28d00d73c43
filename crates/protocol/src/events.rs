//! Events protocol messages: change notifications and stream control.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// A graph change notification pushed by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub id: String,
    /// Event kind: `CREATE`, `UPDATE` or `DELETE` (uppercased on parse).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Nanosecond-resolution companion to `timestamp`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nanotime: Option<i64>,
    pub body: serde_json::Value,
    pub metadata: serde_json::Value,
}

impl EventMessage {
    /// Parse an inbound event, uppercasing its type.
    ///
    /// # Errors
    ///
    /// Returns an error when the JSON does not match the event shape.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let mut event: EventMessage = serde_json::from_str(text)
            .map_err(|source| ProtocolError::Malformed { source, id: None })?;
        event.event_type = event.event_type.to_uppercase();
        Ok(event)
    }
}

/// A server-side subscription predicate. Without at least one filter the
/// gateway would flood the client with every graph change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsFilter {
    #[serde(rename = "filter-id")]
    pub id: String,
    #[serde(rename = "filter-type")]
    pub filter_type: String,
    #[serde(rename = "filter-content")]
    pub content: String,
}

impl EventsFilter {
    /// A filter with the default `jfilter` expression type.
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            filter_type: "jfilter".to_owned(),
            content: content.into(),
        }
    }
}

/// Control messages for the events stream, tagged by the `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventsControl {
    #[serde(rename = "register")]
    Register { args: EventsFilter },
    #[serde(rename = "unregister")]
    Unregister { args: UnregisterArgs },
    #[serde(rename = "clear")]
    Clear { args: serde_json::Value },
    /// Refreshes the server-side session token without reconnecting.
    #[serde(rename = "token")]
    Token { args: TokenArgs },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterArgs {
    #[serde(rename = "filter-id")]
    pub filter_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenArgs {
    #[serde(rename = "_TOKEN")]
    pub token: String,
}

impl EventsControl {
    pub fn register(filter: EventsFilter) -> Self {
        Self::Register { args: filter }
    }

    pub fn unregister(filter_id: impl Into<String>) -> Self {
        Self::Unregister {
            args: UnregisterArgs {
                filter_id: filter_id.into(),
            },
        }
    }

    pub fn clear() -> Self {
        Self::Clear {
            args: serde_json::json!({}),
        }
    }

    pub fn token(token: impl Into<String>) -> Self {
        Self::Token {
            args: TokenArgs {
                token: token.into(),
            },
        }
    }

    /// Serialize for the wire.
    ///
    /// # Errors
    ///
    /// Returns an error when serialization fails.
    pub fn to_wire(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|source| ProtocolError::Malformed { source, id: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_round_trip_preserves_all_fields() {
        let event = EventMessage {
            id: "e1".into(),
            event_type: "CREATE".into(),
            timestamp: 1_700_000_000_000,
            nanotime: Some(1_700_000_000_000_123_456),
            body: serde_json::json!({"ogit/_id": "node-1"}),
            metadata: serde_json::json!({"source": "test"}),
        };

        let wire = serde_json::to_string(&event).unwrap();
        let parsed = EventMessage::parse(&wire).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn event_type_is_uppercased() {
        let parsed = EventMessage::parse(
            r#"{"id":"e1","type":"create","timestamp":1,"body":{},"metadata":{}}"#,
        )
        .unwrap();
        assert_eq!(parsed.event_type, "CREATE");
        assert_eq!(parsed.nanotime, None);
    }

    #[test]
    fn register_message_wire_shape() {
        let wire = EventsControl::register(EventsFilter::new("f1", "(element.field=x)"))
            .to_wire()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(value["type"], "register");
        assert_eq!(value["args"]["filter-id"], "f1");
        assert_eq!(value["args"]["filter-type"], "jfilter");
        assert_eq!(value["args"]["filter-content"], "(element.field=x)");
    }

    #[test]
    fn token_message_wire_shape() {
        let wire = EventsControl::token("tok-123").to_wire().unwrap();
        let value: serde_json::Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(value["type"], "token");
        assert_eq!(value["args"]["_TOKEN"], "tok-123");
    }

    #[test]
    fn unregister_and_clear_wire_shapes() {
        let wire = EventsControl::unregister("f1").to_wire().unwrap();
        let value: serde_json::Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(value["type"], "unregister");
        assert_eq!(value["args"]["filter-id"], "f1");

        let wire = EventsControl::clear().to_wire().unwrap();
        let value: serde_json::Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(value["type"], "clear");
        assert_eq!(value["args"], serde_json::json!({}));
    }
}
