//! Terminal session transport: one socket per session, raw bytes plus resize.
//!
//! The socket is owned by a spawned task. The [`TerminalHandle`] queues
//! outbound frames on an unbounded FIFO that the task's single writer
//! drains, so per-socket ordering is the order of calls. Frames queued while
//! the socket is still dialing are dropped.
//!
//! Inbound frames go to the consumer untouched. A socket that drops is
//! reported once as [`TransportEvent::Terminated`]; there is no reconnect.
//! [`TerminalHandle::dispose`] detaches that report first, so an intentional
//! teardown is never mistaken for a remote disconnect. A consumer that
//! stops draining inbound frames stalls reads, never teardown: dispose
//! interrupts a pending delivery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use termfleet_protocol::{RendererKind, SessionId, TermSize, TerminalInput};

const INBOUND_CAPACITY: usize = 256;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("renderer {0:?} has no byte transport")]
    NoByteTransport(RendererKind),

    #[error("transport for session {0} is closed")]
    Closed(SessionId),
}

/// Where and how session sockets connect.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub ws_base: String,
    pub token: String,
    pub resize_interval: Duration,
}

impl TransportSettings {
    pub fn endpoint(&self, renderer: RendererKind, session_id: &SessionId) -> Option<String> {
        let path = renderer.endpoint_path()?;
        Some(format!(
            "{}{}?sessionToken={}&sessionId={}",
            self.ws_base,
            path,
            urlencoding::encode(&self.token),
            urlencoding::encode(session_id.as_str()),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportPhase {
    Connecting,
    Open,
    Closed,
}

/// Reported to the transport's owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The socket dropped or never opened. Not sent after `dispose`.
    Terminated {
        session_id: SessionId,
        code: Option<u16>,
    },
}

enum Outbound {
    Frame(Message),
    /// Fires once every frame queued before it has been written.
    Flush(oneshot::Sender<()>),
    Close,
}

/// Caller side of a session socket (cheap to Clone).
#[derive(Clone)]
pub struct TerminalHandle {
    session_id: SessionId,
    renderer: RendererKind,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    size_tx: Arc<watch::Sender<TermSize>>,
    phase_rx: watch::Receiver<TransportPhase>,
    detached: Arc<AtomicBool>,
    disposed: Arc<Notify>,
}

impl std::fmt::Debug for TerminalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalHandle")
            .field("session_id", &self.session_id)
            .field("renderer", &self.renderer)
            .field("phase", &*self.phase_rx.borrow())
            .finish()
    }
}

impl TerminalHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn renderer(&self) -> RendererKind {
        self.renderer
    }

    pub fn phase(&self) -> TransportPhase {
        *self.phase_rx.borrow()
    }

    pub fn size(&self) -> TermSize {
        *self.size_tx.borrow()
    }

    /// Resolve once the socket is open. `Err` if it closed first.
    pub async fn wait_open(&self) -> Result<(), TransportError> {
        let mut rx = self.phase_rx.clone();
        let result = match rx.wait_for(|p| *p != TransportPhase::Connecting).await {
            Ok(phase) if *phase == TransportPhase::Open => Ok(()),
            _ => Err(TransportError::Closed(self.session_id.clone())),
        };
        result
    }

    /// Phase updates without holding the socket open.
    pub fn watch_phase(&self) -> watch::Receiver<TransportPhase> {
        self.phase_rx.clone()
    }

    /// Resolve once the socket is closed, for whatever reason.
    pub async fn closed(&self) {
        let mut rx = self.phase_rx.clone();
        let _ = rx.wait_for(|p| *p == TransportPhase::Closed).await;
    }

    /// Keystrokes or pasted data.
    pub fn send_input(&self, data: &[u8]) {
        let frame = match std::str::from_utf8(data) {
            Ok(text) => Message::Text(text.into()),
            Err(_) => Message::Binary(Bytes::copy_from_slice(data)),
        };
        self.enqueue(Outbound::Frame(frame));
    }

    /// Record the new viewport and report it right away; the periodic
    /// resend keeps reporting it while the socket is open.
    pub fn resize(&self, size: TermSize) {
        self.size_tx.send_replace(size);
        self.enqueue(Outbound::Frame(resize_frame(size)));
    }

    /// Opcode-framed file operation (or any other binary frame).
    pub fn send_frame(&self, frame: Vec<u8>) {
        self.enqueue(Outbound::Frame(Message::Binary(frame.into())));
    }

    /// Wait until everything queued so far has been written to the socket.
    pub async fn flush(&self) -> Result<(), TransportError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.enqueue(Outbound::Flush(done_tx));
        done_rx
            .await
            .map_err(|_| TransportError::Closed(self.session_id.clone()))
    }

    /// Detach termination reporting, then close the socket.
    pub fn dispose(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(
            component = "transport",
            event = "transport.disposed",
            session_id = %self.session_id,
        );
        let _ = self.outbound_tx.send(Outbound::Close);
        self.disposed.notify_one();
    }

    fn enqueue(&self, frame: Outbound) {
        if self.outbound_tx.send(frame).is_err() {
            debug!(
                component = "transport",
                event = "transport.send_after_close",
                session_id = %self.session_id,
            );
        }
    }
}

pub struct TerminalTransport;

impl TerminalTransport {
    /// Dial the session socket for `renderer`. Returns the handle and the
    /// receiver of inbound frames.
    pub fn connect(
        settings: &TransportSettings,
        session_id: SessionId,
        renderer: RendererKind,
        size: TermSize,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(TerminalHandle, mpsc::Receiver<Bytes>), TransportError> {
        let url = settings
            .endpoint(renderer, &session_id)
            .ok_or(TransportError::NoByteTransport(renderer))?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (size_tx, size_rx) = watch::channel(size);
        let (phase_tx, phase_rx) = watch::channel(TransportPhase::Connecting);
        let detached = Arc::new(AtomicBool::new(false));
        let disposed = Arc::new(Notify::new());

        let task = TransportTask {
            session_id: session_id.clone(),
            url,
            resize_interval: settings.resize_interval,
            size_rx,
            phase_tx,
            inbound_tx,
            events,
            detached: Arc::clone(&detached),
            disposed: Arc::clone(&disposed),
        };
        tokio::spawn(task.run(outbound_rx));

        Ok((
            TerminalHandle {
                session_id,
                renderer,
                outbound_tx,
                size_tx: Arc::new(size_tx),
                phase_rx,
                detached,
                disposed,
            },
            inbound_rx,
        ))
    }
}

struct TransportTask {
    session_id: SessionId,
    url: String,
    resize_interval: Duration,
    size_rx: watch::Receiver<TermSize>,
    phase_tx: watch::Sender<TransportPhase>,
    inbound_tx: mpsc::Sender<Bytes>,
    events: mpsc::UnboundedSender<TransportEvent>,
    detached: Arc<AtomicBool>,
    disposed: Arc<Notify>,
}

enum Exit {
    Disposed,
    Dropped(Option<u16>),
}

impl TransportTask {
    async fn run(self, mut outbound_rx: mpsc::UnboundedReceiver<Outbound>) {
        let connect = tokio_tungstenite::connect_async(self.url.as_str());
        tokio::pin!(connect);

        let dialed = loop {
            tokio::select! {
                result = &mut connect => break result,
                cmd = outbound_rx.recv() => match cmd {
                    Some(Outbound::Close) | None => {
                        self.finish(Exit::Disposed);
                        return;
                    }
                    Some(_) => {
                        debug!(
                            component = "transport",
                            event = "transport.dropped_before_open",
                            session_id = %self.session_id,
                        );
                    }
                },
            }
        };

        let ws = match dialed {
            Ok((ws, _response)) => ws,
            Err(e) => {
                warn!(
                    component = "transport",
                    event = "transport.dial_failed",
                    session_id = %self.session_id,
                    error = %e,
                    "Session socket failed to open"
                );
                self.finish(Exit::Dropped(None));
                return;
            }
        };

        let (mut sink, mut stream) = ws.split();
        self.phase_tx.send_replace(TransportPhase::Open);
        info!(
            component = "transport",
            event = "transport.opened",
            session_id = %self.session_id,
            "Session socket open"
        );

        let exit = 'io: {
            let initial = *self.size_rx.borrow();
            if sink.send(resize_frame(initial)).await.is_err() {
                break 'io Exit::Dropped(None);
            }

            let mut ticker = tokio::time::interval(self.resize_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    cmd = outbound_rx.recv() => match cmd {
                        Some(Outbound::Close) | None => break 'io Exit::Disposed,
                        Some(Outbound::Flush(done)) => {
                            let _ = done.send(());
                        }
                        Some(Outbound::Frame(frame)) => {
                            if sink.send(frame).await.is_err() {
                                break 'io Exit::Dropped(None);
                            }
                        }
                    },
                    _ = ticker.tick() => {
                        if self.detached.load(Ordering::SeqCst) {
                            continue;
                        }
                        let size = *self.size_rx.borrow();
                        if sink.send(resize_frame(size)).await.is_err() {
                            break 'io Exit::Dropped(None);
                        }
                    }
                    frame = stream.next() => match frame {
                        Some(Ok(Message::Binary(data))) => {
                            if !self.deliver(data).await {
                                break 'io Exit::Disposed;
                            }
                        }
                        Some(Ok(Message::Text(text))) => {
                            if !self.deliver(Bytes::from(text.as_str().to_owned())).await {
                                break 'io Exit::Disposed;
                            }
                        }
                        Some(Ok(Message::Close(close))) => {
                            break 'io Exit::Dropped(close.map(|f| u16::from(f.code)));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(
                                component = "transport",
                                event = "transport.read_failed",
                                session_id = %self.session_id,
                                error = %e,
                            );
                            break 'io Exit::Dropped(None);
                        }
                        None => break 'io Exit::Dropped(None),
                    },
                }
            }
        };

        if matches!(exit, Exit::Disposed)
            && tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await.is_err()
        {
            debug!(
                component = "transport",
                event = "transport.close_timed_out",
                session_id = %self.session_id,
            );
        }
        self.finish(exit);
    }

    /// Hand a frame to the consumer. `false` once the handle was disposed
    /// while the consumer was not draining.
    async fn deliver(&self, data: Bytes) -> bool {
        tokio::select! {
            biased;
            _ = self.disposed.notified() => false,
            // A consumer that went away just stops receiving.
            _ = self.inbound_tx.send(data) => true,
        }
    }

    fn finish(&self, exit: Exit) {
        self.phase_tx.send_replace(TransportPhase::Closed);
        match exit {
            Exit::Disposed => {
                debug!(
                    component = "transport",
                    event = "transport.closed",
                    session_id = %self.session_id,
                );
            }
            Exit::Dropped(code) => {
                if self.detached.load(Ordering::SeqCst) {
                    return;
                }
                info!(
                    component = "transport",
                    event = "transport.terminated",
                    session_id = %self.session_id,
                    code = ?code,
                    "Session socket dropped"
                );
                let _ = self.events.send(TransportEvent::Terminated {
                    session_id: self.session_id.clone(),
                    code,
                });
            }
        }
    }
}

fn resize_frame(size: TermSize) -> Message {
    let encoded = TerminalInput::Resize(size).encode();
    Message::Text(String::from_utf8_lossy(&encoded).into_owned().into())
}
