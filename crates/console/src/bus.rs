//! Cross-context bus: how windows sharing a credential talk to each other.
//!
//! Two backends, picked when the console is built. [`BroadcastBus`] is the
//! same-origin broadcast channel; [`HostEventBus`] rides on desktop host
//! events. Every subscriber sees every message, including its own, so
//! handlers must be idempotent.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use termfleet_protocol::context::CONTEXT_CHANNEL;
use termfleet_protocol::ContextMessage;

use crate::window_host::{HostError, HostRuntime};

const BUS_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to encode context message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Host(#[from] HostError),
}

pub trait ContextBus: Send + Sync {
    fn publish(&self, message: &ContextMessage) -> Result<(), BusError>;
    fn subscribe(&self) -> broadcast::Receiver<ContextMessage>;
}

/// In-memory broadcast channel shared by every context of one origin.
/// Clones are endpoints on the same channel.
#[derive(Debug, Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<ContextMessage>,
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self {
            tx: broadcast::channel(BUS_CAPACITY).0,
        }
    }
}

impl BroadcastBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContextBus for BroadcastBus {
    fn publish(&self, message: &ContextMessage) -> Result<(), BusError> {
        debug!(
            component = "bus",
            event = "bus.published",
            channel = CONTEXT_CHANNEL,
            kind = message.event_name(),
        );
        // No other context open is fine.
        let _ = self.tx.send(message.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ContextMessage> {
        self.tx.subscribe()
    }
}

/// Context messages carried as named desktop host events.
pub struct HostEventBus {
    runtime: Arc<dyn HostRuntime>,
    tx: broadcast::Sender<ContextMessage>,
}

impl HostEventBus {
    /// Must be called inside a tokio runtime: a task decodes host events
    /// into context messages for as long as the host runtime lives.
    pub fn new(runtime: Arc<dyn HostRuntime>) -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        tokio::spawn(decode_host_events(runtime.listen(), tx.clone()));
        Self { runtime, tx }
    }
}

impl ContextBus for HostEventBus {
    fn publish(&self, message: &ContextMessage) -> Result<(), BusError> {
        let payload = serde_json::to_value(message)?;
        self.runtime.emit(message.event_name(), payload)?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ContextMessage> {
        self.tx.subscribe()
    }
}

async fn decode_host_events(
    mut events: broadcast::Receiver<crate::window_host::HostEvent>,
    tx: broadcast::Sender<ContextMessage>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if !matches!(event.name.as_str(), "popout_closed" | "force_close") {
                    continue;
                }
                match serde_json::from_value::<ContextMessage>(event.payload) {
                    Ok(message) => {
                        let _ = tx.send(message);
                    }
                    Err(e) => warn!(
                        component = "bus",
                        event = "bus.host_event_malformed",
                        name = %event.name,
                        error = %e,
                        "Dropping malformed host event"
                    ),
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(
                    component = "bus",
                    event = "bus.lagged",
                    skipped = n,
                    "Host event listener lagged, skipped {n} events"
                );
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window_host::LocalHostRuntime;
    use serde_json::json;
    use std::time::Duration;
    use termfleet_protocol::SessionId;

    #[tokio::test]
    async fn broadcast_bus_reaches_every_endpoint() {
        let origin = BroadcastBus::new();
        let detached = origin.clone();
        let mut origin_rx = origin.subscribe();
        let mut detached_rx = detached.subscribe();

        let msg = ContextMessage::PopoutClosed {
            session_id: SessionId::from("4"),
        };
        detached.publish(&msg).unwrap();

        assert_eq!(origin_rx.recv().await.unwrap(), msg);
        assert_eq!(detached_rx.recv().await.unwrap(), msg);
    }

    #[tokio::test]
    async fn host_event_bus_round_trips_through_named_events() {
        let runtime = Arc::new(LocalHostRuntime::new());
        let mut raw = runtime.listen();
        let bus = HostEventBus::new(runtime.clone());
        let mut rx = bus.subscribe();

        bus.publish(&ContextMessage::ForceClose).unwrap();

        let event = raw.recv().await.unwrap();
        assert_eq!(event.name, "force_close");
        assert_eq!(event.payload, json!({"type": "force_close"}));

        let decoded = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decoded, ContextMessage::ForceClose);
    }

    #[tokio::test]
    async fn host_event_bus_ignores_foreign_and_malformed_events() {
        let runtime = Arc::new(LocalHostRuntime::new());
        let bus = HostEventBus::new(runtime.clone());
        let mut rx = bus.subscribe();

        runtime.emit("theme_changed", json!({"dark": true})).unwrap();
        runtime.emit("popout_closed", json!({"nope": 1})).unwrap();
        runtime
            .emit(
                "popout_closed",
                json!({"type": "popout_closed", "sessionId": 8}),
            )
            .unwrap();

        let decoded = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            decoded,
            ContextMessage::PopoutClosed {
                session_id: SessionId::from(8u64)
            }
        );
    }
}
