//! Commands sent to the multiplexer actor from its handle.

use tokio::sync::oneshot;

use termfleet_protocol::{FileRequest, SessionId, TermSize};

use crate::file_session::FileSession;
use crate::multiplexer::{MultiplexError, Session};

pub type Reply<T> = oneshot::Sender<Result<T, MultiplexError>>;

pub enum MuxCommand {
    // -- Session set --
    AddSession {
        session: Session,
        reply: Reply<()>,
    },
    Foreground {
        id: SessionId,
        reply: Reply<()>,
    },
    PopOut {
        id: SessionId,
        reply: Reply<()>,
    },
    CloseSession {
        id: SessionId,
        reply: Reply<()>,
    },
    /// Drop everything locally (forced logout in this context).
    ForceClose,

    // -- Transport operations (ownership-guarded) --
    SendInput {
        id: SessionId,
        data: Vec<u8>,
        reply: Reply<()>,
    },
    Resize {
        id: SessionId,
        size: TermSize,
        reply: Reply<()>,
    },
    FileOp {
        id: SessionId,
        request: FileRequest,
        reply: Reply<()>,
    },
    /// Hand out the session's file driver so a save can run off the actor.
    Files {
        id: SessionId,
        reply: Reply<FileSession>,
    },

    Shutdown,
}
