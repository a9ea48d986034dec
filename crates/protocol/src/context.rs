//! Cross-context coordination messages
//!
//! Carried between windows/processes that share a credential, either over a
//! same-origin broadcast channel or as desktop host events.

use serde::{Deserialize, Serialize};

use crate::types::SessionId;

/// Name of the broadcast channel / host event namespace.
pub const CONTEXT_CHANNEL: &str = "termfleet_popout";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextMessage {
    /// A detached window for this session closed; its origin may reclaim it.
    PopoutClosed {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },
    /// Every context must drop its sessions and reload (forced logout).
    ForceClose,
}

impl ContextMessage {
    /// Host event name used by the desktop backend.
    pub fn event_name(&self) -> &'static str {
        match self {
            ContextMessage::PopoutClosed { .. } => "popout_closed",
            ContextMessage::ForceClose => "force_close",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn popout_closed_wire_shape() {
        let msg = ContextMessage::PopoutClosed {
            session_id: SessionId::from("abc"),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "popout_closed", "sessionId": "abc"})
        );
    }

    #[test]
    fn force_close_wire_shape() {
        let parsed: ContextMessage = serde_json::from_str(r#"{"type":"force_close"}"#).unwrap();
        assert_eq!(parsed, ContextMessage::ForceClose);
        assert_eq!(parsed.event_name(), "force_close");
    }

    #[test]
    fn numeric_session_ids_are_accepted() {
        let parsed: ContextMessage =
            serde_json::from_str(r#"{"type":"popout_closed","sessionId":12}"#).unwrap();
        assert_eq!(
            parsed,
            ContextMessage::PopoutClosed {
                session_id: SessionId::from(12)
            }
        );
    }
}
