//! File operations over a session socket.
//!
//! [`FileSession`] writes opcode frames onto a [`TerminalHandle`]. Saves are
//! single-flight per session: the lock is taken before `SaveBegin` is queued
//! and released once `SaveEnd` has been written to the socket.
//!
//! [`FileReplyStream`] decodes what the server sends back.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use termfleet_protocol::file_ops::FileOpcode;
use termfleet_protocol::{FileReply, FileRequest, SessionId};

use crate::transport::{TerminalHandle, TransportError, TransportPhase};

#[derive(Debug, Error)]
pub enum FileOpError {
    #[error("a save is already in flight for session {0}")]
    SaveInFlight(SessionId),

    #[error("save of {path} was interrupted: the session socket closed")]
    Interrupted { path: String },

    #[error("{0:?} frames are only sent as part of a save")]
    SaveFrame(FileOpcode),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// File-operation driver for one session. Clones share the save lock.
#[derive(Clone, Debug)]
pub struct FileSession {
    transport: TerminalHandle,
    save_lock: Arc<Mutex<()>>,
}

impl FileSession {
    pub fn new(transport: TerminalHandle) -> Self {
        Self {
            transport,
            save_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        self.transport.session_id()
    }

    /// Write `content` to `path` as `SaveBegin`, `Chunk`×N, `SaveEnd`.
    ///
    /// Resolves once the whole sequence has been written. A partial sequence
    /// is discarded by the server, so an interrupted save is reported and
    /// never retried.
    pub async fn save(&self, path: &str, content: &[u8]) -> Result<(), FileOpError> {
        let _guard = self
            .save_lock
            .try_lock()
            .map_err(|_| FileOpError::SaveInFlight(self.session_id().clone()))?;

        if self.transport.phase() != TransportPhase::Open {
            return Err(TransportError::Closed(self.session_id().clone()).into());
        }

        let frames = FileRequest::save_sequence(path, content);
        let frame_count = frames.len();
        for frame in frames {
            self.transport.send_frame(frame.encode());
        }

        if self.transport.flush().await.is_err() {
            warn!(
                component = "file_ops",
                event = "file_ops.save_interrupted",
                session_id = %self.session_id(),
                path = %path,
                "Socket closed before the save sequence was written"
            );
            return Err(FileOpError::Interrupted {
                path: path.to_string(),
            });
        }

        info!(
            component = "file_ops",
            event = "file_ops.saved",
            session_id = %self.session_id(),
            path = %path,
            bytes = content.len(),
            chunks = frame_count - 2,
            "Save sequence written"
        );
        Ok(())
    }

    /// Send a single-frame operation. Fire-and-forget.
    pub fn send(&self, request: FileRequest) -> Result<(), FileOpError> {
        let opcode = request.opcode();
        if matches!(
            opcode,
            FileOpcode::SaveBegin | FileOpcode::Chunk | FileOpcode::SaveEnd
        ) {
            return Err(FileOpError::SaveFrame(opcode));
        }
        debug!(
            component = "file_ops",
            event = "file_ops.sent",
            session_id = %self.session_id(),
            opcode = ?opcode,
        );
        self.transport.send_frame(request.encode());
        Ok(())
    }

    pub fn delete_file(&self, path: &str) -> Result<(), FileOpError> {
        self.send(FileRequest::DeleteFile {
            path: path.to_string(),
        })
    }

    pub fn delete_folder(&self, path: &str) -> Result<(), FileOpError> {
        self.send(FileRequest::DeleteFolder {
            path: path.to_string(),
        })
    }

    pub fn rename(&self, path: &str, new_path: &str) -> Result<(), FileOpError> {
        self.send(FileRequest::Rename {
            path: path.to_string(),
            new_path: new_path.to_string(),
        })
    }

    pub fn list_files(&self, path: &str) -> Result<(), FileOpError> {
        self.send(FileRequest::ListFiles {
            path: path.to_string(),
        })
    }

    /// Wait until queued single-frame operations have been written.
    pub async fn flush(&self) -> Result<(), FileOpError> {
        Ok(self.transport.flush().await?)
    }

    /// Close the session's socket.
    pub fn close(&self) {
        self.transport.dispose();
    }
}

/// Decoded server → client file frames.
pub struct FileReplyStream {
    inbound: mpsc::Receiver<Bytes>,
}

impl FileReplyStream {
    pub fn new(inbound: mpsc::Receiver<Bytes>) -> Self {
        Self { inbound }
    }

    /// Next well-formed reply. Malformed frames are logged and skipped.
    /// `None` once the socket is gone.
    pub async fn next(&mut self) -> Option<FileReply> {
        loop {
            let frame = self.inbound.recv().await?;
            match FileReply::decode(&frame) {
                Ok(reply) => return Some(reply),
                Err(e) => {
                    warn!(
                        component = "file_ops",
                        event = "file_ops.reply_malformed",
                        error = %e,
                        frame_bytes = frame.len(),
                        "Skipping malformed file reply"
                    );
                }
            }
        }
    }

    /// Skip until the server signals `Ready`. `false` if the socket closed first.
    pub async fn wait_ready(&mut self) -> bool {
        while let Some(reply) = self.next().await {
            if reply == FileReply::Ready {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use termfleet_protocol::file_ops::SaveAssembler;
    use termfleet_protocol::{RendererKind, TermSize};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;

    use crate::transport::{TerminalTransport, TransportSettings};

    const WAIT: Duration = Duration::from_secs(5);

    struct Fixture {
        session: FileSession,
        replies: FileReplyStream,
        server: WebSocketStream<TcpStream>,
    }

    async fn fixture() -> Fixture {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let settings = TransportSettings {
            ws_base: format!("ws://{}", listener.local_addr().unwrap()),
            token: "tok".into(),
            resize_interval: Duration::from_secs(60),
        };
        let (events, _events_rx) = mpsc::unbounded_channel();
        let (handle, inbound) = TerminalTransport::connect(
            &settings,
            SessionId::from("s1"),
            RendererKind::Sftp,
            TermSize::default(),
            events,
        )
        .unwrap();

        let (tcp, _) = listener.accept().await.unwrap();
        let server = tokio_tungstenite::accept_async(tcp).await.unwrap();
        handle.wait_open().await.unwrap();

        Fixture {
            session: FileSession::new(handle),
            replies: FileReplyStream::new(inbound),
            server,
        }
    }

    /// Next binary frame the server receives, skipping resize text frames.
    async fn next_binary(server: &mut WebSocketStream<TcpStream>) -> Vec<u8> {
        loop {
            let msg = tokio::time::timeout(WAIT, server.next())
                .await
                .expect("no frame")
                .expect("stream ended")
                .expect("read error");
            if let Message::Binary(data) = msg {
                return data.to_vec();
            }
        }
    }

    #[tokio::test]
    async fn save_writes_begin_chunks_end_in_order() {
        let mut fx = fixture().await;
        let content: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();

        fx.session.save("/etc/motd", &content).await.unwrap();

        let mut assembler = SaveAssembler::new();
        let mut opcodes = Vec::new();
        let mut chunk_sizes = Vec::new();
        let saved = loop {
            let frame = next_binary(&mut fx.server).await;
            opcodes.push(frame[0]);
            let request = FileRequest::decode(&frame).unwrap();
            if let FileRequest::Chunk { bytes } = &request {
                chunk_sizes.push(bytes.len());
            }
            if let Some(done) = assembler.push(request) {
                break done;
            }
        };

        assert_eq!(opcodes, vec![0x2, 0x3, 0x3, 0x3, 0x4]);
        assert_eq!(chunk_sizes, vec![1024, 1024, 952]);
        assert_eq!(saved, ("/etc/motd".to_string(), content));
    }

    #[tokio::test]
    async fn second_save_while_first_in_flight_is_rejected() {
        let mut fx = fixture().await;

        let (first, second) = tokio::join!(
            fx.session.save("/a", b"one"),
            fx.session.save("/b", b"two"),
        );
        first.unwrap();
        assert!(matches!(second, Err(FileOpError::SaveInFlight(_))));

        // Only the first sequence reached the wire.
        let begin = FileRequest::decode(&next_binary(&mut fx.server).await).unwrap();
        assert_eq!(begin, FileRequest::SaveBegin { path: "/a".into() });

        // The lock is free again afterwards.
        fx.session.save("/b", b"two").await.unwrap();
    }

    #[tokio::test]
    async fn single_frame_operations_use_their_opcodes() {
        let mut fx = fixture().await;
        fx.session.delete_file("/tmp/x").unwrap();
        fx.session.delete_folder("/tmp/d").unwrap();
        fx.session.rename("/tmp/a", "/tmp/b").unwrap();

        let frames = [
            next_binary(&mut fx.server).await,
            next_binary(&mut fx.server).await,
            next_binary(&mut fx.server).await,
        ];
        let decoded: Vec<(u8, Value)> = frames
            .iter()
            .map(|f| (f[0], serde_json::from_slice(&f[1..]).unwrap()))
            .collect();
        assert_eq!(
            decoded,
            vec![
                (0x6, json!({"path": "/tmp/x"})),
                (0x7, json!({"path": "/tmp/d"})),
                (0x8, json!({"path": "/tmp/a", "newPath": "/tmp/b"})),
            ]
        );
    }

    #[tokio::test]
    async fn save_frames_cannot_be_sent_individually() {
        let fx = fixture().await;
        let err = fx.session.send(FileRequest::SaveEnd).unwrap_err();
        assert!(matches!(err, FileOpError::SaveFrame(FileOpcode::SaveEnd)));
    }

    #[tokio::test]
    async fn replies_decode_and_skip_garbage() {
        let mut fx = fixture().await;
        fx.server
            .send(Message::Binary(FileReply::Ready.encode().into()))
            .await
            .unwrap();
        fx.server
            .send(Message::Binary(vec![0x42].into()))
            .await
            .unwrap();
        fx.server
            .send(Message::Binary(
                FileReply::Error {
                    message: "Permission denied".into(),
                }
                .encode()
                .into(),
            ))
            .await
            .unwrap();

        assert!(fx.replies.wait_ready().await);
        assert_eq!(
            fx.replies.next().await,
            Some(FileReply::Error {
                message: "Permission denied".into()
            })
        );
    }

    #[tokio::test]
    async fn save_on_closed_socket_fails_without_holding_the_lock() {
        let fx = fixture().await;
        drop(fx.server);
        tokio::time::timeout(WAIT, fx.session.transport.closed())
            .await
            .unwrap();

        for _ in 0..2 {
            let err = fx.session.save("/a", b"x").await.unwrap_err();
            assert!(matches!(err, FileOpError::Transport(TransportError::Closed(_))));
        }
    }
}
