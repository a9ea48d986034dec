//! Core types shared across the protocol

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

/// Category of server-pushed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChannelId {
    Entries,
    Identities,
    Snippets,
    Connections,
    Logout,
}

impl ChannelId {
    pub const ALL: [ChannelId; 5] = [
        ChannelId::Entries,
        ChannelId::Identities,
        ChannelId::Snippets,
        ChannelId::Connections,
        ChannelId::Logout,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelId::Entries => "ENTRIES",
            ChannelId::Identities => "IDENTITIES",
            ChannelId::Snippets => "SNIPPETS",
            ChannelId::Connections => "CONNECTIONS",
            ChannelId::Logout => "LOGOUT",
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChannelId::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown channel: {s}"))
    }
}

/// Server-assigned session identifier.
///
/// The backend sends these as numbers in some payloads and strings in others;
/// both decode to the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<u64> for SessionId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u64),
            Str(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Num(n) => SessionId(n.to_string()),
            Raw::Str(s) => SessionId(s),
        })
    }
}

/// How a session is rendered on the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RendererKind {
    /// Interactive terminal over a raw byte stream
    Terminal,
    /// Graphical desktop, pixels handled by an external client library
    Guac,
    /// File manager speaking the file-operation opcodes
    Sftp,
}

impl RendererKind {
    /// Whether the console owns a byte-stream transport for this renderer.
    pub fn has_byte_transport(self) -> bool {
        matches!(self, RendererKind::Terminal | RendererKind::Sftp)
    }

    /// Endpoint path of the session socket for this renderer.
    pub fn endpoint_path(self) -> Option<&'static str> {
        match self {
            RendererKind::Terminal => Some("/api/ws/term"),
            RendererKind::Sftp => Some("/api/ws/sftp"),
            RendererKind::Guac => None,
        }
    }
}
