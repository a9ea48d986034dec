//! Multiplexer actor: owns a SessionMultiplexer and the session transports.
//!
//! One tokio task per context. External callers use `MultiplexerHandle`,
//! which sends `MuxCommand`s over an mpsc channel. The actor also listens to
//! the cross-context bus, the registry's `CONNECTIONS` channel and transport
//! termination reports, so every mutation of the session sets happens here.
//! Lock-free reads go through `ArcSwap`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use termfleet_protocol::{ChannelId, ContextMessage, FileRequest, SessionId, TermSize};

use crate::bus::ContextBus;
use crate::credentials::CredentialStore;
use crate::file_session::FileSession;
use crate::multiplexer::{
    MultiplexError, MuxEffect, MuxNotice, MuxSnapshot, Session, SessionMultiplexer,
};
use crate::multiplexer_command::{MuxCommand, Reply};
use crate::registry::{Subscription, SubscriptionRegistry};
use crate::transport::{
    TerminalHandle, TerminalTransport, TransportError, TransportEvent, TransportPhase,
    TransportSettings,
};

/// Opens the byte transport for a session.
pub trait SessionDialer: Send + Sync {
    fn dial(
        &self,
        session: &Session,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<TerminalHandle, TransportError>;
}

/// Output of one session, tagged with its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutput {
    pub session_id: SessionId,
    pub data: Bytes,
}

/// Dials real sockets and funnels every session's output into one channel.
///
/// The session token is read from the credential store on every dial, so a
/// login that happens after start applies to the next session opened.
pub struct WsDialer {
    ws_base: String,
    credentials: CredentialStore,
    resize_interval: Duration,
    size: TermSize,
    output: mpsc::Sender<SessionOutput>,
}

impl WsDialer {
    pub fn new(
        ws_base: String,
        credentials: CredentialStore,
        resize_interval: Duration,
        size: TermSize,
        output: mpsc::Sender<SessionOutput>,
    ) -> Self {
        Self {
            ws_base,
            credentials,
            resize_interval,
            size,
            output,
        }
    }

    fn settings(&self) -> TransportSettings {
        TransportSettings {
            ws_base: self.ws_base.clone(),
            token: self.credentials.active_token().unwrap_or_default(),
            resize_interval: self.resize_interval,
        }
    }
}

impl SessionDialer for WsDialer {
    fn dial(
        &self,
        session: &Session,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<TerminalHandle, TransportError> {
        let (handle, mut inbound) = TerminalTransport::connect(
            &self.settings(),
            session.id.clone(),
            session.renderer,
            self.size,
            events,
        )?;

        let output = self.output.clone();
        let session_id = session.id.clone();
        let mut phase = handle.watch_phase();
        tokio::spawn(async move {
            while let Some(data) = inbound.recv().await {
                let chunk = SessionOutput {
                    session_id: session_id.clone(),
                    data,
                };
                // A closed session stops waiting on a slow consumer.
                tokio::select! {
                    biased;
                    sent = output.send(chunk) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                    _ = phase.wait_for(|p| *p == TransportPhase::Closed) => {
                        debug!(
                            component = "multiplexer",
                            event = "multiplexer.output_abandoned",
                            session_id = %session_id,
                        );
                        break;
                    }
                }
            }
        });

        Ok(handle)
    }
}

/// Handle to a running multiplexer actor (cheap to Clone).
#[derive(Clone)]
pub struct MultiplexerHandle {
    command_tx: mpsc::Sender<MuxCommand>,
    snapshot: Arc<ArcSwap<MuxSnapshot>>,
    notices: broadcast::Sender<MuxNotice>,
}

impl MultiplexerHandle {
    pub fn spawn(
        mux: SessionMultiplexer,
        dialer: Arc<dyn SessionDialer>,
        registry: &SubscriptionRegistry,
        bus: &dyn ContextBus,
    ) -> MultiplexerHandle {
        let (command_tx, command_rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(64);
        let snapshot = Arc::new(ArcSwap::from_pointee(mux.snapshot()));

        // Unbounded: every CONNECTIONS push must reach reconciliation.
        let (connections_tx, connections_rx) = mpsc::unbounded_channel::<Value>();
        let connections = registry.register(ChannelId::Connections, move |data| {
            if connections_tx.send(data.clone()).is_err() {
                debug!(
                    component = "multiplexer",
                    event = "multiplexer.connections_after_shutdown",
                );
            }
        });

        let actor = MuxActor {
            mux,
            dialer,
            links: HashMap::new(),
            events_tx,
            notices: notices.clone(),
            snapshot: Arc::clone(&snapshot),
            connections,
        };
        tokio::spawn(actor.run(command_rx, events_rx, bus.subscribe(), connections_rx));

        MultiplexerHandle {
            command_tx,
            snapshot,
            notices,
        }
    }

    /// Lock-free snapshot read.
    pub fn snapshot(&self) -> Arc<MuxSnapshot> {
        self.snapshot.load_full()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<MuxNotice> {
        self.notices.subscribe()
    }

    pub async fn add_session(&self, session: Session) -> Result<(), MultiplexError> {
        self.request(|reply| MuxCommand::AddSession { session, reply })
            .await
    }

    pub async fn foreground(&self, id: &SessionId) -> Result<(), MultiplexError> {
        let id = id.clone();
        self.request(|reply| MuxCommand::Foreground { id, reply }).await
    }

    pub async fn pop_out(&self, id: &SessionId) -> Result<(), MultiplexError> {
        let id = id.clone();
        self.request(|reply| MuxCommand::PopOut { id, reply }).await
    }

    pub async fn close_session(&self, id: &SessionId) -> Result<(), MultiplexError> {
        let id = id.clone();
        self.request(|reply| MuxCommand::CloseSession { id, reply })
            .await
    }

    pub async fn send_input(&self, id: &SessionId, data: &[u8]) -> Result<(), MultiplexError> {
        let id = id.clone();
        let data = data.to_vec();
        self.request(|reply| MuxCommand::SendInput { id, data, reply })
            .await
    }

    pub async fn resize(&self, id: &SessionId, size: TermSize) -> Result<(), MultiplexError> {
        let id = id.clone();
        self.request(|reply| MuxCommand::Resize { id, size, reply })
            .await
    }

    pub async fn file_op(&self, id: &SessionId, request: FileRequest) -> Result<(), MultiplexError> {
        let id = id.clone();
        self.request(|reply| MuxCommand::FileOp { id, request, reply })
            .await
    }

    /// Ownership is checked when the save starts; the save itself runs on
    /// the caller's task.
    pub async fn save(
        &self,
        id: &SessionId,
        path: &str,
        content: &[u8],
    ) -> Result<(), MultiplexError> {
        let id = id.clone();
        let files = self.request(|reply| MuxCommand::Files { id, reply }).await?;
        files.save(path, content).await?;
        Ok(())
    }

    pub async fn force_close(&self) {
        let _ = self.command_tx.send(MuxCommand::ForceClose).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(MuxCommand::Shutdown).await;
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> MuxCommand,
    ) -> Result<T, MultiplexError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| MultiplexError::Stopped)?;
        reply_rx.await.map_err(|_| MultiplexError::Stopped)?
    }
}

struct Link {
    handle: TerminalHandle,
    files: FileSession,
}

struct MuxActor {
    mux: SessionMultiplexer,
    dialer: Arc<dyn SessionDialer>,
    links: HashMap<SessionId, Link>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    notices: broadcast::Sender<MuxNotice>,
    snapshot: Arc<ArcSwap<MuxSnapshot>>,
    connections: Subscription,
}

impl MuxActor {
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<MuxCommand>,
        mut events_rx: mpsc::UnboundedReceiver<TransportEvent>,
        bus_rx: broadcast::Receiver<ContextMessage>,
        mut connections_rx: mpsc::UnboundedReceiver<Value>,
    ) {
        let mut bus_rx = Some(bus_rx);

        loop {
            tokio::select! {
                cmd = command_rx.recv() => match cmd {
                    Some(MuxCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                Some(event) = events_rx.recv() => self.handle_transport_event(event),
                Some(data) = connections_rx.recv() => {
                    let effects = self.mux.handle_connections(&data);
                    self.apply(effects);
                }
                msg = recv_bus(&mut bus_rx) => match msg {
                    Ok(message) => {
                        debug!(
                            component = "multiplexer",
                            event = "multiplexer.context_message",
                            kind = message.event_name(),
                        );
                        let effects = self.mux.handle_context(&message);
                        self.apply(effects);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(
                            component = "multiplexer",
                            event = "multiplexer.bus_lagged",
                            skipped = n,
                            "Context bus subscriber lagged, skipped {n} messages"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => bus_rx = None,
                },
            }
            self.snapshot.store(Arc::new(self.mux.snapshot()));
        }

        self.connections.unsubscribe();
        for (_, link) in self.links.drain() {
            link.handle.dispose();
        }
        info!(
            component = "multiplexer",
            event = "multiplexer.stopped",
            "Multiplexer actor stopped"
        );
    }

    fn handle_command(&mut self, cmd: MuxCommand) {
        match cmd {
            MuxCommand::AddSession { session, reply } => {
                let result = self.mux.add_session(session).map(|effects| self.apply(effects));
                let _ = reply.send(result);
            }
            MuxCommand::Foreground { id, reply } => {
                let _ = reply.send(self.mux.foreground(&id));
            }
            MuxCommand::PopOut { id, reply } => {
                let result = self.mux.pop_out(&id).map(|effects| self.apply(effects));
                let _ = reply.send(result);
            }
            MuxCommand::CloseSession { id, reply } => {
                let result = self.mux.close_session(&id).map(|effects| self.apply(effects));
                let _ = reply.send(result);
            }
            MuxCommand::ForceClose => {
                let effects = self.mux.force_close();
                self.apply(effects);
            }
            MuxCommand::SendInput { id, data, reply } => {
                let result = self.link(&id).map(|link| link.handle.send_input(&data));
                let _ = reply.send(result);
            }
            MuxCommand::Resize { id, size, reply } => {
                let result = self.link(&id).map(|link| link.handle.resize(size));
                let _ = reply.send(result);
            }
            MuxCommand::FileOp { id, request, reply } => {
                let result = self
                    .link(&id)
                    .and_then(|link| link.files.send(request).map_err(MultiplexError::from));
                let _ = reply.send(result);
            }
            MuxCommand::Files { id, reply } => {
                let result = self.link(&id).map(|link| link.files.clone());
                let _ = reply.send(result);
            }
            MuxCommand::Shutdown => {}
        }
    }

    /// Ownership guard, then the live transport.
    fn link(&self, id: &SessionId) -> Result<&Link, MultiplexError> {
        self.mux.ensure_owned(id)?;
        self.links
            .get(id)
            .ok_or_else(|| MultiplexError::NoTransport(id.clone()))
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        let TransportEvent::Terminated { session_id, code } = event;

        // A report from a transport that has since been replaced is stale.
        let current = self
            .links
            .get(&session_id)
            .is_some_and(|link| link.handle.phase() == TransportPhase::Closed);
        if !current {
            debug!(
                component = "multiplexer",
                event = "multiplexer.stale_termination",
                session_id = %session_id,
            );
            return;
        }

        info!(
            component = "multiplexer",
            event = "multiplexer.session_terminated",
            session_id = %session_id,
            code = ?code,
            "Session connection closed"
        );
        self.links.remove(&session_id);
        let effects = self.mux.handle_terminated(&session_id);
        self.apply(effects);
    }

    fn apply(&mut self, effects: Vec<MuxEffect>) {
        let mut queue: VecDeque<MuxEffect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                MuxEffect::Dial(session) => {
                    match self.dialer.dial(&session, self.events_tx.clone()) {
                        Ok(handle) => {
                            let files = FileSession::new(handle.clone());
                            if let Some(old) = self.links.insert(session.id.clone(), Link { handle, files }) {
                                old.handle.dispose();
                            }
                        }
                        Err(e) => {
                            warn!(
                                component = "multiplexer",
                                event = "multiplexer.dial_failed",
                                session_id = %session.id,
                                error = %e,
                                "Could not open session transport"
                            );
                            queue.extend(self.mux.handle_terminated(&session.id));
                        }
                    }
                }
                MuxEffect::Dispose(id) => {
                    if let Some(link) = self.links.remove(&id) {
                        link.handle.dispose();
                    }
                }
                MuxEffect::Notify(notice) => {
                    debug!(
                        component = "multiplexer",
                        event = "multiplexer.notice",
                        notice = ?notice,
                    );
                    let _ = self.notices.send(notice);
                }
            }
        }
    }
}

async fn recv_bus(
    rx: &mut Option<broadcast::Receiver<ContextMessage>>,
) -> Result<ContextMessage, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::StreamExt;
    use serde_json::json;
    use termfleet_protocol::RendererKind;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;

    use crate::bus::BroadcastBus;
    use crate::window_host::{HostError, WindowHost};

    const WAIT: Duration = Duration::from_secs(5);

    struct AllowAll;

    impl WindowHost for AllowAll {
        fn open_session_window(&self, _: &SessionId) -> Result<(), HostError> {
            Ok(())
        }
    }

    struct Fixture {
        handle: MultiplexerHandle,
        registry: SubscriptionRegistry,
        bus: BroadcastBus,
        sockets: mpsc::UnboundedReceiver<WebSocketStream<TcpStream>>,
        _output: mpsc::Receiver<SessionOutput>,
        _data: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (sockets_tx, sockets) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                if let Ok(ws) = tokio_tungstenite::accept_async(tcp).await {
                    let _ = sockets_tx.send(ws);
                }
            }
        });

        let data = tempfile::tempdir().unwrap();
        let credentials = CredentialStore::new(data.path().join("credentials.json"));
        credentials.set_session_token("tok").unwrap();
        let (output_tx, output) = mpsc::channel(64);
        let dialer = WsDialer::new(
            format!("ws://{addr}"),
            credentials,
            Duration::from_secs(60),
            TermSize::default(),
            output_tx,
        );
        let registry = SubscriptionRegistry::new();
        let bus = BroadcastBus::new();
        let handle = MultiplexerHandle::spawn(
            SessionMultiplexer::new(Arc::new(AllowAll)),
            Arc::new(dialer),
            &registry,
            &bus,
        );
        Fixture {
            handle,
            registry,
            bus,
            sockets,
            _output: output,
            _data: data,
        }
    }

    async fn next_socket(fx: &mut Fixture) -> WebSocketStream<TcpStream> {
        tokio::time::timeout(WAIT, fx.sockets.recv())
            .await
            .expect("no connection")
            .unwrap()
    }

    /// Drain until the client closes the socket.
    async fn expect_closed(ws: &mut WebSocketStream<TcpStream>) {
        loop {
            match tokio::time::timeout(WAIT, ws.next()).await.expect("never closed") {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            }
        }
    }

    async fn next_notice(rx: &mut broadcast::Receiver<MuxNotice>) -> MuxNotice {
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    fn term(id: &str) -> Session {
        Session::new(id, "entry", RendererKind::Terminal)
    }

    #[tokio::test]
    async fn failure_push_on_connections_evicts_and_disposes() {
        let mut fx = fixture().await;
        let mut notices = fx.handle.subscribe_notices();
        fx.handle.add_session(term("1")).await.unwrap();
        fx.handle.add_session(term("2")).await.unwrap();
        let mut first = next_socket(&mut fx).await;
        let _second = next_socket(&mut fx).await;

        fx.registry.publish(
            ChannelId::Connections,
            json!({"sessionId": "1", "message": "Authentication failed"}),
        );

        assert_eq!(
            next_notice(&mut notices).await,
            MuxNotice::Evicted {
                session_id: SessionId::from("1"),
                message: "Authentication failed".into(),
            }
        );
        expect_closed(&mut first).await;
        let ids: Vec<_> = fx
            .handle
            .snapshot()
            .sessions
            .iter()
            .map(|v| v.session.id.clone())
            .collect();
        assert_eq!(ids, vec![SessionId::from("2")]);
    }

    #[tokio::test]
    async fn failure_after_a_burst_of_pushes_still_evicts() {
        let mut fx = fixture().await;
        let mut notices = fx.handle.subscribe_notices();
        fx.handle.add_session(term("3")).await.unwrap();
        let mut socket = next_socket(&mut fx).await;

        // Published without yielding, so the actor cannot drain in between.
        for i in 0..200 {
            fx.registry
                .publish(ChannelId::Connections, json!({"sessionId": "3", "status": i}));
        }
        fx.registry.publish(
            ChannelId::Connections,
            json!({"sessionId": "3", "message": "Host unreachable"}),
        );

        assert_eq!(
            next_notice(&mut notices).await,
            MuxNotice::Evicted {
                session_id: SessionId::from("3"),
                message: "Host unreachable".into(),
            }
        );
        expect_closed(&mut socket).await;
        assert!(fx.handle.snapshot().sessions.is_empty());
    }

    #[tokio::test]
    async fn pop_out_hands_off_transport_and_reclaim_redials() {
        let mut fx = fixture().await;
        let mut notices = fx.handle.subscribe_notices();
        let id = SessionId::from("7");
        fx.handle.add_session(term("7")).await.unwrap();
        let mut original = next_socket(&mut fx).await;

        fx.handle.pop_out(&id).await.unwrap();
        expect_closed(&mut original).await;
        assert!(matches!(
            fx.handle.send_input(&id, b"ls\r").await,
            Err(MultiplexError::PoppedOut(_))
        ));
        assert!(matches!(
            fx.handle.resize(&id, TermSize::new(100, 30)).await,
            Err(MultiplexError::PoppedOut(_))
        ));

        // The detached window closes.
        fx.bus
            .publish(&ContextMessage::PopoutClosed {
                session_id: id.clone(),
            })
            .unwrap();
        assert_eq!(
            next_notice(&mut notices).await,
            MuxNotice::Reclaimed {
                session_id: id.clone()
            }
        );

        let _reclaimed = next_socket(&mut fx).await;
        let snapshot = fx.handle.snapshot();
        assert_eq!(snapshot.foreground, Some(id.clone()));
        assert!(!snapshot.sessions[0].popped_out);
        fx.handle.send_input(&id, b"ls\r").await.unwrap();
    }

    #[tokio::test]
    async fn remote_drop_surfaces_connection_closed() {
        let mut fx = fixture().await;
        let mut notices = fx.handle.subscribe_notices();
        fx.handle.add_session(term("3")).await.unwrap();
        let mut server = next_socket(&mut fx).await;

        server.close(None).await.unwrap();

        assert_eq!(
            next_notice(&mut notices).await,
            MuxNotice::ConnectionClosed {
                session_id: SessionId::from("3")
            }
        );
        assert!(fx.handle.snapshot().sessions.is_empty());
    }

    #[tokio::test]
    async fn force_close_over_bus_drops_everything() {
        let mut fx = fixture().await;
        let mut notices = fx.handle.subscribe_notices();
        fx.handle.add_session(term("1")).await.unwrap();
        let mut server = next_socket(&mut fx).await;

        fx.bus.publish(&ContextMessage::ForceClose).unwrap();

        assert_eq!(next_notice(&mut notices).await, MuxNotice::ForceClosed);
        expect_closed(&mut server).await;
        assert_eq!(*fx.handle.snapshot(), MuxSnapshot::default());
    }

    #[tokio::test]
    async fn file_ops_go_through_the_ownership_guard() {
        let mut fx = fixture().await;
        let id = SessionId::from("f");
        fx.handle
            .add_session(Session::new("f", "entry", RendererKind::Sftp))
            .await
            .unwrap();
        let mut server = next_socket(&mut fx).await;

        // Wait for the socket to be usable before saving.
        loop {
            match fx.handle.save(&id, "/tmp/a", b"hello").await {
                Ok(()) => break,
                Err(MultiplexError::File(_)) => tokio::time::sleep(Duration::from_millis(10)).await,
                Err(e) => panic!("unexpected {e}"),
            }
        }
        fx.handle
            .file_op(
                &id,
                FileRequest::DeleteFile {
                    path: "/tmp/b".into(),
                },
            )
            .await
            .unwrap();

        let mut opcodes = Vec::new();
        while opcodes.len() < 4 {
            let msg = tokio::time::timeout(WAIT, server.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Binary(data) = msg {
                opcodes.push(data[0]);
            }
        }
        assert_eq!(opcodes, vec![0x2, 0x3, 0x4, 0x6]);

        assert!(matches!(
            fx.handle.file_op(&SessionId::from("nope"), FileRequest::SaveEnd).await,
            Err(MultiplexError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn graphical_session_has_no_transport() {
        let fx = fixture().await;
        let id = SessionId::from("g");
        fx.handle
            .add_session(Session::new("g", "entry", RendererKind::Guac))
            .await
            .unwrap();
        assert!(matches!(
            fx.handle.send_input(&id, b"x").await,
            Err(MultiplexError::NoTransport(_))
        ));
    }
}
