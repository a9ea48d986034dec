//! Server → Client messages on the state channel

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ChannelId, SessionId};

/// Raw `{type, data}` envelope as it appears on the wire.
///
/// `kind` stays a string so unknown channel tags can be skipped instead of
/// failing the whole frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// A decoded state-channel frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerPush {
    /// Fresh state for a subscribable channel
    State { channel: ChannelId, data: Value },
    /// Server-initiated logout; never fanned out to subscribers
    Logout { reason: Option<String> },
    /// A tag this client does not know yet
    Unknown { kind: String },
}

impl StateEnvelope {
    pub fn new(channel: ChannelId, data: Value) -> Self {
        Self {
            kind: channel.as_str().to_string(),
            data,
        }
    }

    /// Parse a text frame and classify it.
    pub fn decode(text: &str) -> Result<ServerPush, serde_json::Error> {
        let envelope: StateEnvelope = serde_json::from_str(text)?;
        Ok(envelope.into_push())
    }

    pub fn into_push(self) -> ServerPush {
        match self.kind.parse::<ChannelId>() {
            Ok(ChannelId::Logout) => ServerPush::Logout {
                reason: self
                    .data
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            Ok(channel) => ServerPush::State {
                channel,
                data: self.data,
            },
            Err(_) => ServerPush::Unknown { kind: self.kind },
        }
    }
}

/// Meaning of a payload pushed on the `CONNECTIONS` channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionsPush {
    /// A session's connection failed server-side
    Failure { session_id: SessionId, message: String },
    /// Routine connection inventory
    Inventory,
}

impl ConnectionsPush {
    /// A failure carries both `sessionId` and `message`; anything else is inventory.
    pub fn classify(data: &Value) -> Self {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Failure {
            session_id: SessionId,
            message: String,
        }

        match Failure::deserialize(data) {
            Ok(f) => ConnectionsPush::Failure {
                session_id: f.session_id,
                message: f.message,
            },
            Err(_) => ConnectionsPush::Inventory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_known_channel() {
        let push = StateEnvelope::decode(r#"{"type":"ENTRIES","data":[{"id":1}]}"#).unwrap();
        assert_eq!(
            push,
            ServerPush::State {
                channel: ChannelId::Entries,
                data: json!([{"id": 1}]),
            }
        );
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        let push = StateEnvelope::decode(r#"{"type":"PREFERENCES","data":{}}"#).unwrap();
        assert_eq!(
            push,
            ServerPush::Unknown {
                kind: "PREFERENCES".into()
            }
        );
    }

    #[test]
    fn logout_is_split_out_with_reason() {
        let push =
            StateEnvelope::decode(r#"{"type":"LOGOUT","data":{"reason":"session_invalidated"}}"#)
                .unwrap();
        assert_eq!(
            push,
            ServerPush::Logout {
                reason: Some("session_invalidated".into())
            }
        );
    }

    #[test]
    fn missing_data_defaults_to_null() {
        let push = StateEnvelope::decode(r#"{"type":"SNIPPETS"}"#).unwrap();
        assert!(matches!(push, ServerPush::State { data: Value::Null, .. }));
    }

    #[test]
    fn connections_failure_needs_both_fields() {
        assert_eq!(
            ConnectionsPush::classify(&json!({"sessionId": 7, "message": "x"})),
            ConnectionsPush::Failure {
                session_id: SessionId::from(7),
                message: "x".into(),
            }
        );
        assert_eq!(
            ConnectionsPush::classify(&json!({"sessionId": 7})),
            ConnectionsPush::Inventory
        );
        assert_eq!(
            ConnectionsPush::classify(&json!([{"sessionId": 7, "message": "x"}])),
            ConnectionsPush::Inventory
        );
    }
}
