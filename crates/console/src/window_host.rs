//! Window hosts: whatever materializes a popped-out session window.
//!
//! Desktop shells expose a [`HostRuntime`] (named commands plus a named event
//! stream). Browsers open a same-origin URL addressed by session id.

use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

use termfleet_protocol::SessionId;

/// Desktop command that opens a detached session window.
pub const OPEN_POPOUT_COMMAND: &str = "open_popout";

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to launch window: {0}")]
    Launch(#[from] std::io::Error),

    #[error("host command {command} failed: {message}")]
    Command { command: String, message: String },

    #[error("host runtime is gone")]
    Closed,
}

/// A named event emitted by, or delivered through, a desktop host runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct HostEvent {
    pub name: String,
    pub payload: Value,
}

/// The capabilities a desktop shell gives the console.
pub trait HostRuntime: Send + Sync {
    fn invoke(&self, command: &str, args: Value) -> Result<(), HostError>;
    fn emit(&self, event: &str, payload: Value) -> Result<(), HostError>;
    fn listen(&self) -> broadcast::Receiver<HostEvent>;
}

/// In-process runtime: events loop back to every listener, invoked commands
/// are published for whoever embeds the console to act on.
#[derive(Debug)]
pub struct LocalHostRuntime {
    events: broadcast::Sender<HostEvent>,
    commands: broadcast::Sender<HostEvent>,
}

impl Default for LocalHostRuntime {
    fn default() -> Self {
        Self {
            events: broadcast::channel(64).0,
            commands: broadcast::channel(64).0,
        }
    }
}

impl LocalHostRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands passed to [`HostRuntime::invoke`], in call order.
    pub fn commands(&self) -> broadcast::Receiver<HostEvent> {
        self.commands.subscribe()
    }
}

impl HostRuntime for LocalHostRuntime {
    fn invoke(&self, command: &str, args: Value) -> Result<(), HostError> {
        self.commands
            .send(HostEvent {
                name: command.to_string(),
                payload: args,
            })
            .map(|_| ())
            .map_err(|_| HostError::Command {
                command: command.to_string(),
                message: "no handler attached".to_string(),
            })
    }

    fn emit(&self, event: &str, payload: Value) -> Result<(), HostError> {
        // Nobody listening is not a failure.
        let _ = self.events.send(HostEvent {
            name: event.to_string(),
            payload,
        });
        Ok(())
    }

    fn listen(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }
}

/// Opens independent windows for popped-out sessions.
pub trait WindowHost: Send + Sync {
    fn open_session_window(&self, session_id: &SessionId) -> Result<(), HostError>;
}

/// Asks the desktop shell to open the window.
pub struct DesktopWindowHost {
    runtime: Arc<dyn HostRuntime>,
}

impl DesktopWindowHost {
    pub fn new(runtime: Arc<dyn HostRuntime>) -> Self {
        Self { runtime }
    }
}

impl WindowHost for DesktopWindowHost {
    fn open_session_window(&self, session_id: &SessionId) -> Result<(), HostError> {
        self.runtime
            .invoke(OPEN_POPOUT_COMMAND, json!({ "sessionId": session_id }))
            .inspect_err(|e| {
                warn!(
                    component = "window_host",
                    event = "window_host.desktop_open_failed",
                    session_id = %session_id,
                    error = %e,
                    "Desktop host refused to open a window"
                );
            })
    }
}

/// Opens `{base}/popout/{id}` in the system browser.
pub struct BrowserWindowHost {
    base_url: String,
}

impl BrowserWindowHost {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    pub fn url_for(&self, session_id: &SessionId) -> String {
        format!(
            "{}/popout/{}",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode(session_id.as_str())
        )
    }
}

impl WindowHost for BrowserWindowHost {
    fn open_session_window(&self, session_id: &SessionId) -> Result<(), HostError> {
        let url = self.url_for(session_id);
        open::that(&url)?;
        info!(
            component = "window_host",
            event = "window_host.browser_opened",
            session_id = %session_id,
            url = %url,
        );
        Ok(())
    }
}
