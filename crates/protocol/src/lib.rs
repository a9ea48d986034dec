//! termfleet Protocol
//!
//! Wire types shared by every socket the console holds. State envelopes are
//! JSON text frames; terminal and file-operation frames are opcode-prefixed
//! byte strings. Everything here is pure: no IO, no async.

use uuid::Uuid;

// Re-exports
pub mod client;
pub mod context;
pub mod file_ops;
pub mod installer;
pub mod server;
pub mod terminal;
pub mod types;

pub use client::ClientMessage;
pub use context::ContextMessage;
pub use file_ops::{FileReply, FileRequest};
pub use installer::InstallerEvent;
pub use server::{ConnectionsPush, ServerPush, StateEnvelope};
pub use terminal::{TermSize, TerminalInput};
pub use types::*;

/// Close code the backend uses when a credential was invalidated server-side.
pub const CLOSE_CREDENTIAL_INVALIDATED: u16 = 4010;

/// Generate a new unique ID (tab and browser identifiers).
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Errors produced while decoding an opcode-framed message.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,

    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("malformed payload for opcode 0x{opcode:02x}: {reason}")]
    Payload { opcode: u8, reason: String },
}
