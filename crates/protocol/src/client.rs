//! Client → Server messages on the state channel

use serde::{Deserialize, Serialize};

use crate::types::ChannelId;

/// Messages sent from the console to the state endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Ask the backend to re-push one channel, or every channel when `None`.
    Refresh {
        #[serde(rename = "type")]
        channel: Option<ChannelId>,
    },
}

impl ClientMessage {
    pub fn refresh(channel: Option<ChannelId>) -> Self {
        ClientMessage::Refresh { channel }
    }
}
