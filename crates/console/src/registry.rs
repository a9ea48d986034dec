//! Subscription registry: per-channel fan-out with a last-value buffer.
//!
//! `publish` overwrites the channel's buffer and calls every subscriber with
//! the new payload. `register` replays the buffered value synchronously, so a
//! late subscriber sees current state without waiting for the next push.
//!
//! Subscribers are called outside the map's shard lock, over a snapshot taken
//! when the publish started, so a callback may register or unregister other
//! subscribers (or itself) freely.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, error};

use termfleet_protocol::ChannelId;

type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
struct ChannelSlot {
    buffer: Option<Arc<Value>>,
    subscribers: Vec<(u64, Callback)>,
}

#[derive(Default)]
struct Inner {
    slots: DashMap<ChannelId, ChannelSlot>,
    next_id: AtomicU64,
}

/// Shared fan-out table. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<Inner>,
}

/// Deregistration capability returned by [`SubscriptionRegistry::register`].
#[must_use = "keep the Subscription to be able to unsubscribe later"]
pub struct Subscription {
    inner: Weak<Inner>,
    channel: ChannelId,
    id: u64,
}

impl Subscription {
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Remove the callback. Calling this more than once is a no-op.
    pub fn unsubscribe(&self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if let Some(mut slot) = inner.slots.get_mut(&self.channel) {
            slot.subscribers.retain(|(id, _)| *id != self.id);
        };
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `callback` to `channel`. If the channel already has a buffered
    /// value, the callback runs once with it before this returns.
    pub fn register<F>(&self, channel: ChannelId, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let replay = {
            let mut slot = self.inner.slots.entry(channel).or_default();
            slot.subscribers.push((id, Arc::clone(&callback)));
            slot.buffer.clone()
        };

        debug!(
            component = "registry",
            event = "registry.subscribed",
            channel = %channel,
            subscriber_id = id,
            replay = replay.is_some(),
        );

        if let Some(value) = replay {
            invoke(channel, id, &callback, &value);
        }

        Subscription {
            inner: Arc::downgrade(&self.inner),
            channel,
            id,
        }
    }

    /// Store `payload` as the channel's current value and fan it out.
    pub fn publish(&self, channel: ChannelId, payload: Value) {
        let payload = Arc::new(payload);
        let snapshot = {
            let mut slot = self.inner.slots.entry(channel).or_default();
            slot.buffer = Some(Arc::clone(&payload));
            slot.subscribers.clone()
        };

        debug!(
            component = "registry",
            event = "registry.published",
            channel = %channel,
            subscribers = snapshot.len(),
        );

        for (id, callback) in &snapshot {
            invoke(channel, *id, callback, &payload);
        }
    }

    /// Forget every buffered value. Subscribers stay registered.
    pub fn reset_all(&self) {
        for mut slot in self.inner.slots.iter_mut() {
            slot.buffer = None;
        }
        debug!(component = "registry", event = "registry.reset");
    }

    /// Current buffered value for `channel`, if any.
    pub fn last(&self, channel: ChannelId) -> Option<Arc<Value>> {
        self.inner
            .slots
            .get(&channel)
            .and_then(|slot| slot.buffer.clone())
    }

    pub fn subscriber_count(&self, channel: ChannelId) -> usize {
        self.inner
            .slots
            .get(&channel)
            .map(|slot| slot.subscribers.len())
            .unwrap_or(0)
    }
}

fn invoke(channel: ChannelId, id: u64, callback: &Callback, value: &Value) {
    if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
        error!(
            component = "registry",
            event = "registry.subscriber_panicked",
            channel = %channel,
            subscriber_id = id,
            "Subscriber panicked; continuing with the remaining subscribers"
        );
    }
}
