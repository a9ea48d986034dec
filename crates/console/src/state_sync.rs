//! State synchronization channel: one socket per credential.
//!
//! A single task owns the socket and the [`SyncState`]. Commands, dial
//! results, timer expiries and socket frames are all funneled into that task
//! and turned into [`SyncInput`]s; [`transition`] decides, the task executes
//! the resulting effects. Callers hold a [`StateSyncHandle`].

use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use termfleet_protocol::{ChannelId, ClientMessage, ServerPush, StateEnvelope};

use crate::credentials::{ClientIdentity, CredentialStore};
use crate::registry::SubscriptionRegistry;
use crate::sync_transition::{transition, SyncEffect, SyncInput, SyncPhase, SyncState};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection parameters for the state endpoint.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// `ws://host:port` origin, no trailing slash
    pub ws_base: String,
    pub identity: ClientIdentity,
    pub retry_interval: Duration,
    pub watchdog: Duration,
}

impl SyncSettings {
    pub fn endpoint(&self, token: &str) -> String {
        format!(
            "{}/api/ws/state?sessionToken={}&tabId={}&browserId={}",
            self.ws_base,
            urlencoding::encode(token),
            urlencoding::encode(&self.identity.tab_id),
            urlencoding::encode(&self.identity.browser_id),
        )
    }
}

/// What the UI needs to render connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub connection_error: bool,
    pub has_connected: bool,
}

impl From<&SyncState> for SyncStatus {
    fn from(state: &SyncState) -> Self {
        Self {
            phase: state.phase,
            connection_error: state.connection_error,
            has_connected: state.has_connected,
        }
    }
}

/// Who revoked the credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutOrigin {
    /// The server closed or pushed a logout on this context's socket.
    Server,
    /// Another context relayed its forced logout over the bus.
    Peer,
}

/// Consequences that leave the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Credential revoked; the stored credential is already gone.
    ForcedLogout {
        reason: Option<String>,
        origin: LogoutOrigin,
    },
}

enum SyncCommand {
    SetCredential(String),
    ClearCredential,
    PeerLoggedOut,
    RequestRefresh(Option<ChannelId>),
    Shutdown,
}

enum Internal {
    Dialed {
        generation: u64,
        result: Box<Result<WsStream, tungstenite::Error>>,
    },
    Timer(SyncInput),
}

/// Handle to a running state-sync task (cheap to Clone).
#[derive(Clone)]
pub struct StateSyncHandle {
    command_tx: mpsc::Sender<SyncCommand>,
    status_rx: watch::Receiver<SyncStatus>,
    events_tx: broadcast::Sender<SyncEvent>,
    credentials: CredentialStore,
}

impl StateSyncHandle {
    /// Store `token` and start a fresh connection with the active credential
    /// (an override token still wins over it).
    pub async fn set_credential(&self, token: &str) {
        if let Err(e) = self.credentials.set_session_token(token) {
            warn!(
                component = "state_sync",
                event = "state_sync.credential_store_failed",
                error = %e,
                "Failed to persist credential"
            );
        }
        let active = self
            .credentials
            .active_token()
            .unwrap_or_else(|| token.to_string());
        self.send(SyncCommand::SetCredential(active)).await;
    }

    /// Run forced logout locally because another context was logged out.
    /// A no-op when this context holds no credential.
    pub async fn peer_logged_out(&self) {
        self.send(SyncCommand::PeerLoggedOut).await;
    }

    /// Forget the credential: buffers reset, socket torn down.
    pub async fn clear_credential(&self) {
        if let Err(e) = self.credentials.clear() {
            warn!(
                component = "state_sync",
                event = "state_sync.credential_store_failed",
                error = %e,
                "Failed to clear credential"
            );
        }
        self.send(SyncCommand::ClearCredential).await;
    }

    /// Ask the backend to re-push `channel` (or everything). Dropped unless open.
    pub async fn request_refresh(&self, channel: Option<ChannelId>) {
        self.send(SyncCommand::RequestRefresh(channel)).await;
    }

    pub async fn shutdown(&self) {
        self.send(SyncCommand::Shutdown).await;
    }

    pub fn status(&self) -> SyncStatus {
        *self.status_rx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events_tx.subscribe()
    }

    async fn send(&self, cmd: SyncCommand) {
        if self.command_tx.send(cmd).await.is_err() {
            debug!(
                component = "state_sync",
                event = "state_sync.command_dropped",
                "State sync task is gone, command dropped"
            );
        }
    }
}

/// Builder for the state-sync task.
pub struct StateSyncChannel;

impl StateSyncChannel {
    /// Start the task. If the store already holds a credential, the first
    /// connection attempt begins immediately.
    pub fn spawn(
        settings: SyncSettings,
        registry: SubscriptionRegistry,
        credentials: CredentialStore,
    ) -> StateSyncHandle {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let state = SyncState::default();
        let (status_tx, status_rx) = watch::channel(SyncStatus::from(&state));
        let (events_tx, _) = broadcast::channel(16);

        let driver = SyncDriver {
            settings,
            registry,
            credentials: credentials.clone(),
            state,
            token: None,
            sink: None,
            stream: None,
            internal_tx,
            status_tx,
            events_tx: events_tx.clone(),
            logout_reason: None,
            logout_origin: LogoutOrigin::Server,
        };
        tokio::spawn(driver.run(command_rx, internal_rx));

        StateSyncHandle {
            command_tx,
            status_rx,
            events_tx,
            credentials,
        }
    }
}

struct SyncDriver {
    settings: SyncSettings,
    registry: SubscriptionRegistry,
    credentials: CredentialStore,
    state: SyncState,
    token: Option<String>,
    sink: Option<WsSink>,
    stream: Option<WsRead>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    status_tx: watch::Sender<SyncStatus>,
    events_tx: broadcast::Sender<SyncEvent>,
    logout_reason: Option<String>,
    logout_origin: LogoutOrigin,
}

impl SyncDriver {
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<SyncCommand>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) {
        if let Some(token) = self.credentials.active_token() {
            self.token = Some(token);
            self.apply(SyncInput::CredentialSet).await;
        }

        loop {
            tokio::select! {
                cmd = command_rx.recv() => match cmd {
                    Some(SyncCommand::SetCredential(token)) => {
                        self.token = Some(token);
                        self.apply(SyncInput::CredentialSet).await;
                    }
                    Some(SyncCommand::ClearCredential) => {
                        self.token = None;
                        self.apply(SyncInput::CredentialCleared).await;
                    }
                    Some(SyncCommand::PeerLoggedOut) => {
                        self.logout_origin = LogoutOrigin::Peer;
                        self.apply(SyncInput::PeerLoggedOut).await;
                        self.logout_origin = LogoutOrigin::Server;
                    }
                    Some(SyncCommand::RequestRefresh(channel)) => self.send_refresh(channel).await,
                    Some(SyncCommand::Shutdown) | None => break,
                },
                Some(internal) = internal_rx.recv() => self.handle_internal(internal).await,
                frame = next_frame(&mut self.stream), if self.stream.is_some() => {
                    self.handle_frame(frame).await;
                }
            }
        }

        self.tear_down().await;
        info!(
            component = "state_sync",
            event = "state_sync.stopped",
            "State sync task stopped"
        );
    }

    async fn apply(&mut self, input: SyncInput) {
        let before = self.state.phase;
        let (next, effects) = transition(self.state.clone(), input.clone());
        self.state = next;

        if before != self.state.phase {
            debug!(
                component = "state_sync",
                event = "state_sync.transition",
                from = ?before,
                to = ?self.state.phase,
                input = ?input,
            );
        }

        for effect in effects {
            self.execute(effect).await;
        }

        let status = SyncStatus::from(&self.state);
        self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }

    async fn execute(&mut self, effect: SyncEffect) {
        match effect {
            SyncEffect::Dial => self.dial(),
            SyncEffect::TearDown => self.tear_down().await,
            SyncEffect::ScheduleRetry { generation } => {
                debug!(
                    component = "state_sync",
                    event = "state_sync.retry_scheduled",
                    generation,
                    delay_ms = self.settings.retry_interval.as_millis() as u64,
                );
                self.arm_timer(
                    self.settings.retry_interval,
                    SyncInput::RetryElapsed { generation },
                );
            }
            SyncEffect::ArmWatchdog { generation } => {
                self.arm_timer(
                    self.settings.watchdog,
                    SyncInput::WatchdogElapsed { generation },
                );
            }
            SyncEffect::ResetBuffers => self.registry.reset_all(),
            SyncEffect::ForcedLogout => self.forced_logout(),
        }
    }

    fn dial(&self) {
        let Some(token) = self.token.as_deref() else {
            return;
        };
        let url = self.settings.endpoint(token);
        let generation = self.state.generation;
        let tx = self.internal_tx.clone();
        let limit = self.settings.watchdog;

        debug!(
            component = "state_sync",
            event = "state_sync.dialing",
            generation,
            ws_base = %self.settings.ws_base,
        );

        tokio::spawn(async move {
            // A handshake that never completes counts as a failed dial.
            let dialed = tokio::time::timeout(limit, tokio_tungstenite::connect_async(url)).await;
            let result = match dialed {
                Ok(dialed) => dialed.map(|(ws, _response)| ws),
                Err(_) => Err(tungstenite::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("handshake not answered within {limit:?}"),
                ))),
            };
            let _ = tx.send(Internal::Dialed {
                generation,
                result: Box::new(result),
            });
        });
    }

    fn arm_timer(&self, delay: Duration, input: SyncInput) {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::Timer(input));
        });
    }

    async fn tear_down(&mut self) {
        self.stream = None;
        if let Some(mut sink) = self.sink.take() {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
        }
    }

    fn forced_logout(&mut self) {
        self.token = None;
        if let Err(e) = self.credentials.clear() {
            warn!(
                component = "state_sync",
                event = "state_sync.credential_clear_failed",
                error = %e,
                "Failed to clear credential during forced logout"
            );
        }
        let reason = self.logout_reason.take();
        let origin = self.logout_origin;
        warn!(
            component = "state_sync",
            event = "state_sync.forced_logout",
            reason = ?reason,
            origin = ?origin,
            "Credential invalidated"
        );
        let _ = self.events_tx.send(SyncEvent::ForcedLogout { reason, origin });
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Dialed { generation, result } => {
                let current =
                    generation == self.state.generation && self.state.phase == SyncPhase::Connecting;
                match *result {
                    Ok(mut ws) if !current => {
                        let _ = tokio::time::timeout(CLOSE_TIMEOUT, ws.close(None)).await;
                    }
                    Err(_) if !current => {}
                    Ok(ws) => {
                        let (sink, stream) = ws.split();
                        self.sink = Some(sink);
                        self.stream = Some(stream);
                        info!(
                            component = "state_sync",
                            event = "state_sync.opened",
                            generation,
                            "State channel open"
                        );
                        self.apply(SyncInput::Opened).await;
                    }
                    Err(e) => {
                        debug!(
                            component = "state_sync",
                            event = "state_sync.dial_failed",
                            generation,
                            error = %e,
                        );
                        self.apply(SyncInput::Failed).await;
                    }
                }
            }
            Internal::Timer(input) => self.apply(input).await,
        }
    }

    async fn handle_frame(&mut self, frame: Option<Result<Message, tungstenite::Error>>) {
        match frame {
            Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()).await,
            Some(Ok(Message::Close(close))) => {
                let code = close.as_ref().map(|f| u16::from(f.code));
                info!(
                    component = "state_sync",
                    event = "state_sync.closed",
                    code = ?code,
                    "State channel closed by server"
                );
                self.drop_socket();
                self.apply(SyncInput::Closed { code }).await;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(
                    component = "state_sync",
                    event = "state_sync.socket_error",
                    error = %e,
                    "State channel error"
                );
                self.drop_socket();
                self.apply(SyncInput::Failed).await;
            }
            None => {
                self.drop_socket();
                self.apply(SyncInput::Closed { code: None }).await;
            }
        }
    }

    async fn handle_text(&mut self, text: &str) {
        match StateEnvelope::decode(text) {
            Ok(ServerPush::State { channel, data }) => self.registry.publish(channel, data),
            Ok(ServerPush::Logout { reason }) => {
                self.logout_reason = reason;
                self.apply(SyncInput::LogoutPushed).await;
            }
            Ok(ServerPush::Unknown { kind }) => {
                debug!(
                    component = "state_sync",
                    event = "state_sync.unknown_type",
                    kind = %kind,
                );
            }
            Err(e) => {
                warn!(
                    component = "state_sync",
                    event = "state_sync.parse_failed",
                    error = %e,
                    payload_bytes = text.len(),
                    "Failed to parse state envelope"
                );
            }
        }
    }

    async fn send_refresh(&mut self, channel: Option<ChannelId>) {
        let open = self.state.phase == SyncPhase::Open;
        let Some(sink) = self.sink.as_mut().filter(|_| open) else {
            debug!(
                component = "state_sync",
                event = "state_sync.refresh_dropped",
                channel = ?channel,
                "Refresh requested while not open"
            );
            return;
        };

        let json = match serde_json::to_string(&ClientMessage::refresh(channel)) {
            Ok(json) => json,
            Err(e) => {
                warn!(
                    component = "state_sync",
                    event = "state_sync.serialize_failed",
                    error = %e,
                );
                return;
            }
        };
        if let Err(e) = sink.send(Message::Text(json.into())).await {
            debug!(
                component = "state_sync",
                event = "state_sync.refresh_send_failed",
                error = %e,
            );
        }
    }

    fn drop_socket(&mut self) {
        self.sink = None;
        self.stream = None;
    }
}

async fn next_frame(stream: &mut Option<WsRead>) -> Option<Result<Message, tungstenite::Error>> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
