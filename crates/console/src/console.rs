//! Wiring for one console context.
//!
//! Builds the registry, the state-sync channel, the cross-context bus, the
//! window host and the multiplexer actor, and connects forced logout to the
//! bus: a context whose credential is revoked tells the others, and every
//! context that hears it runs forced logout itself.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{info, warn};

use termfleet_protocol::{ContextMessage, SessionId, TermSize};

use crate::bus::{BroadcastBus, BusError, ContextBus, HostEventBus};
use crate::config::{ConfigError, ConsoleConfig, HostKind};
use crate::credentials::{ClientIdentity, CredentialStore};
use crate::multiplexer::{Session, SessionMultiplexer};
use crate::multiplexer_actor::{MultiplexerHandle, SessionOutput, WsDialer};
use crate::registry::SubscriptionRegistry;
use crate::state_sync::{
    LogoutOrigin, StateSyncChannel, StateSyncHandle, SyncEvent, SyncSettings,
};
use crate::transport::{
    TerminalHandle, TerminalTransport, TransportError, TransportEvent, TransportSettings,
};
use crate::window_host::{
    BrowserWindowHost, DesktopWindowHost, HostRuntime, LocalHostRuntime, WindowHost,
};

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Everything a context needs from its environment.
pub struct ConsoleOptions {
    pub config: ConsoleConfig,
    pub credentials: CredentialStore,
    pub identity: ClientIdentity,
    /// Desktop shell capabilities; an in-process runtime is used when absent.
    pub host_runtime: Option<Arc<dyn HostRuntime>>,
    /// Shared bus endpoint; a fresh one for the chosen host kind when absent.
    pub bus: Option<Arc<dyn ContextBus>>,
    /// Where session output goes.
    pub output: mpsc::Sender<SessionOutput>,
    pub initial_size: TermSize,
}

/// A running console context.
pub struct Console {
    pub registry: SubscriptionRegistry,
    pub sync: StateSyncHandle,
    pub sessions: MultiplexerHandle,
    pub bus: Arc<dyn ContextBus>,
    config: ConsoleConfig,
    credentials: CredentialStore,
}

impl Console {
    /// Must be called inside a tokio runtime.
    pub fn start(options: ConsoleOptions) -> Result<Self, ConsoleError> {
        let ConsoleOptions {
            config,
            credentials,
            identity,
            host_runtime,
            bus,
            output,
            initial_size,
        } = options;

        let ws_base = config.ws_base()?;
        let registry = SubscriptionRegistry::new();

        let runtime: Arc<dyn HostRuntime> =
            host_runtime.unwrap_or_else(|| Arc::new(LocalHostRuntime::new()));
        let (window_host, bus): (Arc<dyn WindowHost>, Arc<dyn ContextBus>) = match config.host {
            HostKind::Browser => (
                Arc::new(BrowserWindowHost::new(config.popout_base())),
                bus.unwrap_or_else(|| Arc::new(BroadcastBus::new())),
            ),
            HostKind::Desktop => (
                Arc::new(DesktopWindowHost::new(Arc::clone(&runtime))),
                bus.unwrap_or_else(|| Arc::new(HostEventBus::new(Arc::clone(&runtime)))),
            ),
        };

        let sync = StateSyncChannel::spawn(
            SyncSettings {
                ws_base: ws_base.clone(),
                identity,
                retry_interval: config.retry_interval(),
                watchdog: config.watchdog(),
            },
            registry.clone(),
            credentials.clone(),
        );

        let dialer = WsDialer::new(
            ws_base,
            credentials.clone(),
            config.resize_interval(),
            initial_size,
            output,
        );
        let sessions = MultiplexerHandle::spawn(
            SessionMultiplexer::new(window_host),
            Arc::new(dialer),
            &registry,
            bus.as_ref(),
        );

        tokio::spawn(relay_forced_logout(
            sync.clone(),
            Arc::clone(&bus),
            registry.clone(),
            sessions.clone(),
        ));

        info!(
            component = "console",
            event = "console.started",
            host = ?config.host,
            server_url = %config.server_url,
            "Console context started"
        );

        Ok(Self {
            registry,
            sync,
            sessions,
            bus,
            config,
            credentials,
        })
    }

    pub fn config(&self) -> &ConsoleConfig {
        &self.config
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Open a detached context for a session that was popped out elsewhere.
    pub fn detach(
        &self,
        session: &Session,
        size: TermSize,
    ) -> Result<(DetachedSession, mpsc::Receiver<Bytes>), ConsoleError> {
        let settings = TransportSettings {
            ws_base: self.config.ws_base()?,
            token: self.credentials.active_token().unwrap_or_default(),
            resize_interval: self.config.resize_interval(),
        };
        Ok(DetachedSession::open(
            &settings,
            session,
            size,
            Arc::clone(&self.bus),
        )?)
    }

    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
        self.sync.shutdown().await;
    }
}

/// Server-side revocation goes out on the bus; a revocation heard on the bus
/// runs forced logout here without being published again.
async fn relay_forced_logout(
    sync: StateSyncHandle,
    bus: Arc<dyn ContextBus>,
    registry: SubscriptionRegistry,
    sessions: MultiplexerHandle,
) {
    let mut events = sync.subscribe_events();
    let mut peers = bus.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SyncEvent::ForcedLogout { origin, .. }) => {
                    if origin == LogoutOrigin::Server {
                        if let Err(e) = bus.publish(&ContextMessage::ForceClose) {
                            warn!(
                                component = "console",
                                event = "console.force_close_publish_failed",
                                error = %e,
                                "Could not tell other contexts to close"
                            );
                        }
                    }
                    sessions.force_close().await;
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            msg = peers.recv() => match msg {
                Ok(ContextMessage::ForceClose) => {
                    info!(
                        component = "console",
                        event = "console.peer_forced_logout",
                        "Another context was logged out"
                    );
                    sync.peer_logged_out().await;
                    // Covers contexts without a credential of their own.
                    registry.reset_all();
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }
}

/// The window a popped-out session lives in. It owns the session's
/// transport until it closes, then hands the session back.
pub struct DetachedSession {
    session_id: SessionId,
    transport: TerminalHandle,
    bus: Arc<dyn ContextBus>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl DetachedSession {
    pub fn open(
        settings: &TransportSettings,
        session: &Session,
        size: TermSize,
        bus: Arc<dyn ContextBus>,
    ) -> Result<(Self, mpsc::Receiver<Bytes>), TransportError> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (transport, output) = TerminalTransport::connect(
            settings,
            session.id.clone(),
            session.renderer,
            size,
            events_tx,
        )?;
        Ok((
            Self {
                session_id: session.id.clone(),
                transport,
                bus,
                events,
            },
            output,
        ))
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn transport(&self) -> &TerminalHandle {
        &self.transport
    }

    /// Resolve when this window should go away: its socket dropped, or
    /// another context asked everyone to close.
    pub async fn wait_for_end(&mut self) {
        let mut bus_rx = self.bus.subscribe();
        loop {
            tokio::select! {
                Some(TransportEvent::Terminated { .. }) = self.events.recv() => return,
                msg = bus_rx.recv() => match msg {
                    Ok(ContextMessage::ForceClose) => return,
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return,
                },
            }
        }
    }

    /// Dispose the transport, then tell the origin it can reclaim.
    pub fn close(self) -> Result<(), BusError> {
        self.transport.dispose();
        info!(
            component = "console",
            event = "console.detached_closed",
            session_id = %self.session_id,
        );
        self.bus.publish(&ContextMessage::PopoutClosed {
            session_id: self.session_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::StreamExt;
    use serde_json::json;
    use termfleet_protocol::{ChannelId, RendererKind};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;

    use crate::multiplexer::MuxNotice;
    use crate::state_sync::SyncStatus;
    use crate::sync_transition::SyncPhase;
    use crate::window_host::OPEN_POPOUT_COMMAND;

    const WAIT: Duration = Duration::from_secs(5);

    type Sockets = mpsc::UnboundedReceiver<(String, WebSocketStream<TcpStream>)>;

    /// State sockets dialed with the `revoked` token are closed with 4010
    /// right away; session sockets are handed to the test with their query.
    async fn backend(revoked: Option<&'static str>) -> (String, Sockets) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut path = String::new();
                    let mut query = String::new();
                    let callback =
                        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                            path = req.uri().path().to_string();
                            query = req.uri().query().unwrap_or_default().to_string();
                            Ok(resp)
                        };
                    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(tcp, callback).await
                    else {
                        return;
                    };
                    if path == "/api/ws/state" {
                        let revoke = revoked
                            .is_some_and(|token| query.contains(&format!("sessionToken={token}&")));
                        if revoke {
                            let _ = ws
                                .close(Some(CloseFrame {
                                    code: CloseCode::from(4010),
                                    reason: "Session invalidated".into(),
                                }))
                                .await;
                        }
                        while let Some(Ok(_)) = ws.next().await {}
                    } else {
                        let _ = tx.send((query, ws));
                    }
                });
            }
        });
        (format!("http://{addr}"), rx)
    }

    fn options(
        server_url: &str,
        dir: &std::path::Path,
        bus: Arc<dyn ContextBus>,
        token: Option<&str>,
    ) -> ConsoleOptions {
        let credentials = CredentialStore::new(dir.join("credentials.json"));
        if let Some(token) = token {
            credentials.set_session_token(token).unwrap();
        }
        // Output is not under test; the receiver is dropped.
        let (output, _) = mpsc::channel(64);
        ConsoleOptions {
            config: ConsoleConfig {
                server_url: server_url.to_string(),
                retry_interval_ms: 30,
                ..Default::default()
            },
            credentials,
            identity: ClientIdentity {
                tab_id: termfleet_protocol::new_id(),
                browser_id: "browser".into(),
            },
            host_runtime: None,
            bus: Some(bus),
            output,
            initial_size: TermSize::default(),
        }
    }

    /// Next session socket and the query it was dialed with.
    async fn next_dial(sockets: &mut Sockets) -> (String, WebSocketStream<TcpStream>) {
        tokio::time::timeout(WAIT, sockets.recv())
            .await
            .expect("no session socket")
            .unwrap()
    }

    async fn next_socket(sockets: &mut Sockets) -> WebSocketStream<TcpStream> {
        next_dial(sockets).await.1
    }

    async fn wait_phase(console: &Console, phase: SyncPhase) {
        let mut status = console.sync.watch_status();
        tokio::time::timeout(WAIT, status.wait_for(|s: &SyncStatus| s.phase == phase))
            .await
            .unwrap()
            .unwrap();
    }

    async fn closed(ws: &mut WebSocketStream<TcpStream>) {
        loop {
            match tokio::time::timeout(WAIT, ws.next()).await.expect("never closed") {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            }
        }
    }

    #[tokio::test]
    async fn forced_logout_closes_every_context() {
        let (server_url, mut sockets) = backend(Some("tok-a")).await;
        let bus: Arc<dyn ContextBus> = Arc::new(BroadcastBus::new());
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();

        // B holds its own credential on a healthy state socket.
        let b = Console::start(options(&server_url, dir_b.path(), Arc::clone(&bus), Some("tok-b")))
            .unwrap();
        let mut b_events = b.sync.subscribe_events();
        let mut b_notices = b.sessions.subscribe_notices();
        wait_phase(&b, SyncPhase::Open).await;
        b.registry.publish(ChannelId::Snippets, json!(["ls"]));
        b.sessions
            .add_session(Session::new("1", "entry", RendererKind::Terminal))
            .await
            .unwrap();
        let mut b_socket = next_socket(&mut sockets).await;

        let a = Console::start(options(&server_url, dir_a.path(), Arc::clone(&bus), Some("tok-a")))
            .unwrap();
        wait_phase(&a, SyncPhase::Invalidated).await;
        assert_eq!(a.credentials().active_token(), None);

        match tokio::time::timeout(WAIT, b_events.recv()).await.unwrap().unwrap() {
            SyncEvent::ForcedLogout { origin, .. } => assert_eq!(origin, LogoutOrigin::Peer),
        }
        assert_eq!(
            tokio::time::timeout(WAIT, b_notices.recv()).await.unwrap().unwrap(),
            MuxNotice::ForceClosed
        );
        closed(&mut b_socket).await;
        assert!(b.sessions.snapshot().sessions.is_empty());

        assert_eq!(b.credentials().active_token(), None);
        wait_phase(&b, SyncPhase::Invalidated).await;
        assert!(b.registry.last(ChannelId::Snippets).is_none());
    }

    #[tokio::test]
    async fn login_after_start_dials_sessions_with_the_new_token() {
        let (server_url, mut sockets) = backend(None).await;
        let bus: Arc<dyn ContextBus> = Arc::new(BroadcastBus::new());
        let dir = tempfile::tempdir().unwrap();
        let console = Console::start(options(&server_url, dir.path(), bus, None)).unwrap();

        console.sync.set_credential("fresh").await;
        console
            .sessions
            .add_session(Session::new("2", "entry", RendererKind::Terminal))
            .await
            .unwrap();

        let (query, _socket) = next_dial(&mut sockets).await;
        assert!(query.contains("sessionToken=fresh&"), "dialed with {query}");
    }

    #[tokio::test]
    async fn pop_out_then_detached_close_reclaims_and_foregrounds() {
        let (server_url, mut sockets) = backend(None).await;
        let bus: Arc<dyn ContextBus> = Arc::new(BroadcastBus::new());
        let runtime = Arc::new(LocalHostRuntime::new());
        let mut commands = runtime.commands();
        let dir = tempfile::tempdir().unwrap();

        let mut opts = options(&server_url, dir.path(), Arc::clone(&bus), Some("tok"));
        opts.config.host = HostKind::Desktop;
        opts.host_runtime = Some(runtime.clone());
        let origin = Console::start(opts).unwrap();
        let mut notices = origin.sessions.subscribe_notices();

        let session = Session::new("5", "entry", RendererKind::Terminal);
        origin.sessions.add_session(session.clone()).await.unwrap();
        let mut first = next_socket(&mut sockets).await;

        origin.sessions.pop_out(&session.id).await.unwrap();
        let command = commands.recv().await.unwrap();
        assert_eq!(command.name, OPEN_POPOUT_COMMAND);
        assert_eq!(command.payload, json!({"sessionId": "5"}));
        closed(&mut first).await;

        // The detached window takes over the session, then closes.
        let (detached, _output) = origin.detach(&session, TermSize::default()).unwrap();
        let mut detached_socket = next_socket(&mut sockets).await;
        detached.close().unwrap();
        closed(&mut detached_socket).await;

        assert_eq!(
            tokio::time::timeout(WAIT, notices.recv()).await.unwrap().unwrap(),
            MuxNotice::Reclaimed {
                session_id: session.id.clone()
            }
        );
        let _reclaimed = next_socket(&mut sockets).await;
        assert_eq!(origin.sessions.snapshot().foreground, Some(session.id.clone()));
    }

    #[tokio::test]
    async fn detached_window_ends_on_force_close() {
        let (server_url, mut sockets) = backend(None).await;
        let bus: Arc<dyn ContextBus> = Arc::new(BroadcastBus::new());
        let dir = tempfile::tempdir().unwrap();
        let console =
            Console::start(options(&server_url, dir.path(), Arc::clone(&bus), Some("tok"))).unwrap();

        let session = Session::new("9", "entry", RendererKind::Terminal);
        let (mut detached, _output) = console.detach(&session, TermSize::default()).unwrap();
        let _socket = next_socket(&mut sockets).await;

        let publisher = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            bus.publish(&ContextMessage::ForceClose).unwrap();
        };
        let (ended, ()) = tokio::join!(
            tokio::time::timeout(WAIT, detached.wait_for_end()),
            publisher
        );
        assert!(ended.is_ok());
    }
}
