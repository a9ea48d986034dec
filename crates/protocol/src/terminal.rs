//! Terminal socket framing
//!
//! Client → server frames are raw terminal input, except a frame starting with
//! `0x01` followed by ASCII `cols,rows`, which is a viewport resize. Server →
//! client frames are raw output and carry no framing.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Control byte that introduces a resize frame.
pub const RESIZE_CONTROL: u8 = 0x01;

/// Terminal viewport in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl TermSize {
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for TermSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

impl fmt::Display for TermSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.cols, self.rows)
    }
}

/// A client → server frame on a terminal socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalInput {
    Resize(TermSize),
    Data(Vec<u8>),
}

impl TerminalInput {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            TerminalInput::Resize(size) => {
                let body = size.to_string();
                let mut out = Vec::with_capacity(1 + body.len());
                out.push(RESIZE_CONTROL);
                out.extend_from_slice(body.as_bytes());
                out
            }
            TerminalInput::Data(bytes) => bytes.clone(),
        }
    }

    /// Server-side view of a frame. A leading `0x01` that is not followed by a
    /// well-formed `cols,rows` pair is treated as input (Ctrl-A).
    pub fn decode(frame: &[u8]) -> Self {
        if let Some((&RESIZE_CONTROL, rest)) = frame.split_first() {
            if let Some(size) = parse_size(rest) {
                return TerminalInput::Resize(size);
            }
        }
        TerminalInput::Data(frame.to_vec())
    }
}

fn parse_size(body: &[u8]) -> Option<TermSize> {
    let text = std::str::from_utf8(body).ok()?;
    let (cols, rows) = text.split_once(',')?;
    Some(TermSize::new(cols.parse().ok()?, rows.parse().ok()?))
}
