//! Session multiplexer: bookkeeping for the sessions one context has open.
//!
//! Owns the ordered Active set, the Popped-Out set and the foreground
//! pointer. It never touches a socket: every operation returns the
//! [`MuxEffect`]s the owning actor must carry out (dial, dispose, notify).
//!
//! Ownership rule: a session in the Popped-Out set belongs to its detached
//! window. Anything that would touch its transport is refused here.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use termfleet_protocol::{ConnectionsPush, ContextMessage, RendererKind, SessionId};

use crate::file_session::FileOpError;
use crate::window_host::{HostError, WindowHost};

#[derive(Debug, Error)]
pub enum MultiplexError {
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    #[error("session {0} is popped out; its detached window owns it")]
    PoppedOut(SessionId),

    #[error("session {0} is already open")]
    Duplicate(SessionId),

    #[error("could not open a window for session {session_id}: {source}")]
    Host {
        session_id: SessionId,
        #[source]
        source: HostError,
    },

    #[error("session {0} has no byte transport")]
    NoTransport(SessionId),

    #[error(transparent)]
    File(#[from] FileOpError),

    #[error("multiplexer actor stopped")]
    Stopped,
}

/// One open session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    /// Inventory entry the session targets
    pub entry: String,
    pub renderer: RendererKind,
    #[serde(default)]
    pub hibernated: bool,
}

impl Session {
    pub fn new(id: impl Into<SessionId>, entry: impl Into<String>, renderer: RendererKind) -> Self {
        Self {
            id: id.into(),
            entry: entry.into(),
            renderer,
            hibernated: false,
        }
    }
}

/// Something the context should tell its user about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxNotice {
    /// The backend reported the session's connection failed.
    Evicted { session_id: SessionId, message: String },
    /// The session socket dropped.
    ConnectionClosed { session_id: SessionId },
    /// A detached window closed and the session is back here.
    Reclaimed { session_id: SessionId },
    /// Every session was dropped (forced logout).
    ForceClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxEffect {
    Dial(Session),
    Dispose(SessionId),
    Notify(MuxNotice),
}

/// Read-only view published by the actor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MuxSnapshot {
    pub sessions: Vec<SessionView>,
    pub foreground: Option<SessionId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub session: Session,
    pub popped_out: bool,
}

pub struct SessionMultiplexer {
    sessions: Vec<Session>,
    popped_out: HashSet<SessionId>,
    foreground: Option<SessionId>,
    /// Least recent first
    recency: Vec<SessionId>,
    host: Arc<dyn WindowHost>,
}

impl SessionMultiplexer {
    pub fn new(host: Arc<dyn WindowHost>) -> Self {
        Self {
            sessions: Vec::new(),
            popped_out: HashSet::new(),
            foreground: None,
            recency: Vec::new(),
            host,
        }
    }

    pub fn foreground_id(&self) -> Option<&SessionId> {
        self.foreground.as_ref()
    }

    pub fn session(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.iter().find(|s| &s.id == id)
    }

    pub fn is_popped_out(&self, id: &SessionId) -> bool {
        self.popped_out.contains(id)
    }

    /// This context owns the session's transport.
    pub fn is_owner(&self, id: &SessionId) -> bool {
        self.session(id).is_some() && !self.is_popped_out(id)
    }

    /// Guard for every transport-affecting operation.
    pub fn ensure_owned(&self, id: &SessionId) -> Result<&Session, MultiplexError> {
        let session = self
            .session(id)
            .ok_or_else(|| MultiplexError::UnknownSession(id.clone()))?;
        if self.is_popped_out(id) {
            return Err(MultiplexError::PoppedOut(id.clone()));
        }
        Ok(session)
    }

    pub fn snapshot(&self) -> MuxSnapshot {
        MuxSnapshot {
            sessions: self
                .sessions
                .iter()
                .map(|s| SessionView {
                    session: s.clone(),
                    popped_out: self.is_popped_out(&s.id),
                })
                .collect(),
            foreground: self.foreground.clone(),
        }
    }

    /// Append a session. It is foregrounded when nothing else is.
    pub fn add_session(&mut self, session: Session) -> Result<Vec<MuxEffect>, MultiplexError> {
        if self.session(&session.id).is_some() {
            return Err(MultiplexError::Duplicate(session.id));
        }
        if self.foreground.is_none() {
            self.foreground = Some(session.id.clone());
        }
        self.touch(&session.id);
        self.sessions.push(session.clone());

        Ok(dial_if_needed(session))
    }

    pub fn foreground(&mut self, id: &SessionId) -> Result<(), MultiplexError> {
        self.ensure_owned(id)?;
        self.foreground = Some(id.clone());
        self.touch(id);
        Ok(())
    }

    /// Hand the session to an independent window. Rolled back if the host
    /// cannot open one.
    pub fn pop_out(&mut self, id: &SessionId) -> Result<Vec<MuxEffect>, MultiplexError> {
        let renderer = self.ensure_owned(id)?.renderer;
        let previous_foreground = self.foreground.clone();

        self.popped_out.insert(id.clone());
        if self.foreground.as_ref() == Some(id) {
            self.foreground = self.most_recent_owned();
        }

        if let Err(source) = self.host.open_session_window(id) {
            self.popped_out.remove(id);
            self.foreground = previous_foreground;
            warn!(
                component = "multiplexer",
                event = "multiplexer.popout_rolled_back",
                session_id = %id,
                error = %source,
                "Pop-out aborted, host could not open a window"
            );
            return Err(MultiplexError::Host {
                session_id: id.clone(),
                source,
            });
        }

        info!(
            component = "multiplexer",
            event = "multiplexer.popped_out",
            session_id = %id,
        );
        Ok(if renderer.has_byte_transport() {
            vec![MuxEffect::Dispose(id.clone())]
        } else {
            Vec::new()
        })
    }

    /// Apply a message from another context.
    pub fn handle_context(&mut self, message: &ContextMessage) -> Vec<MuxEffect> {
        match message {
            ContextMessage::PopoutClosed { session_id } => self.reclaim(session_id),
            ContextMessage::ForceClose => self.force_close(),
        }
    }

    /// A detached window closed. Ids not popped out here are ignored.
    pub fn reclaim(&mut self, id: &SessionId) -> Vec<MuxEffect> {
        if !self.popped_out.remove(id) {
            return Vec::new();
        }
        let Some(session) = self.session(id).cloned() else {
            return Vec::new();
        };

        self.foreground = Some(id.clone());
        self.touch(id);
        info!(
            component = "multiplexer",
            event = "multiplexer.reclaimed",
            session_id = %id,
        );

        let mut effects = dial_if_needed(session);
        effects.push(MuxEffect::Notify(MuxNotice::Reclaimed {
            session_id: id.clone(),
        }));
        effects
    }

    /// React to a `CONNECTIONS` push. Only failure reports evict.
    pub fn handle_connections(&mut self, data: &Value) -> Vec<MuxEffect> {
        let ConnectionsPush::Failure {
            session_id,
            message,
        } = ConnectionsPush::classify(data)
        else {
            return Vec::new();
        };

        let was_owned = self.is_owner(&session_id);
        if !self.remove(&session_id) {
            return Vec::new();
        }
        if self.foreground.as_ref() == Some(&session_id) {
            self.foreground = None;
        }

        warn!(
            component = "multiplexer",
            event = "multiplexer.evicted",
            session_id = %session_id,
            message = %message,
            "Backend reported a session failure"
        );

        let mut effects = Vec::new();
        if was_owned {
            effects.push(MuxEffect::Dispose(session_id.clone()));
        }
        effects.push(MuxEffect::Notify(MuxNotice::Evicted {
            session_id,
            message,
        }));
        effects
    }

    /// User closed the session.
    pub fn close_session(&mut self, id: &SessionId) -> Result<Vec<MuxEffect>, MultiplexError> {
        self.ensure_owned(id)?;
        self.remove(id);
        if self.foreground.as_ref() == Some(id) {
            self.foreground = self.most_recent_owned();
        }
        Ok(vec![MuxEffect::Dispose(id.clone())])
    }

    /// The session socket dropped on its own.
    pub fn handle_terminated(&mut self, id: &SessionId) -> Vec<MuxEffect> {
        if !self.is_owner(id) {
            return Vec::new();
        }
        self.remove(id);
        if self.foreground.as_ref() == Some(id) {
            self.foreground = self.most_recent_owned();
        }
        vec![MuxEffect::Notify(MuxNotice::ConnectionClosed {
            session_id: id.clone(),
        })]
    }

    /// Drop every session: owned transports are disposed, both sets cleared.
    /// A second call finds nothing to do.
    pub fn force_close(&mut self) -> Vec<MuxEffect> {
        if self.sessions.is_empty() {
            return Vec::new();
        }
        let mut effects: Vec<MuxEffect> = self
            .sessions
            .iter()
            .filter(|s| s.renderer.has_byte_transport() && !self.popped_out.contains(&s.id))
            .map(|s| MuxEffect::Dispose(s.id.clone()))
            .collect();

        self.sessions.clear();
        self.popped_out.clear();
        self.recency.clear();
        self.foreground = None;

        effects.push(MuxEffect::Notify(MuxNotice::ForceClosed));
        effects
    }

    fn remove(&mut self, id: &SessionId) -> bool {
        let before = self.sessions.len();
        self.sessions.retain(|s| &s.id != id);
        self.popped_out.remove(id);
        self.recency.retain(|r| r != id);
        self.sessions.len() != before
    }

    fn touch(&mut self, id: &SessionId) {
        self.recency.retain(|r| r != id);
        self.recency.push(id.clone());
    }

    fn most_recent_owned(&self) -> Option<SessionId> {
        self.recency
            .iter()
            .rev()
            .find(|id| !self.popped_out.contains(*id) && self.session(id).is_some())
            .cloned()
    }
}

fn dial_if_needed(session: Session) -> Vec<MuxEffect> {
    if session.renderer.has_byte_transport() {
        vec![MuxEffect::Dial(session)]
    } else {
        Vec::new()
    }
}
