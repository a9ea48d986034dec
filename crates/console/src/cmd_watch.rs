//! `termfleet watch` / `termfleet refresh`: print state pushes as JSON lines.

use std::process::ExitCode;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use termfleet::registry::{Subscription, SubscriptionRegistry};
use termfleet::state_sync::{StateSyncChannel, StateSyncHandle, SyncEvent, SyncSettings};
use termfleet::sync_transition::SyncPhase;
use termfleet_protocol::ChannelId;

use crate::{Env, EXIT_FORCED_LOGOUT};

pub async fn watch(env: Env, channel: Option<ChannelId>) -> anyhow::Result<ExitCode> {
    env.require_token()?;
    let registry = SubscriptionRegistry::new();
    let sync = spawn_sync(env, registry.clone())?;
    let mut events = sync.subscribe_events();
    let mut status = sync.watch_status();
    let subscriptions = print_channels(&registry, channel);

    let code = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SyncEvent::ForcedLogout { reason, .. }) => {
                    eprintln!(
                        "  Logged out by the server{}",
                        reason.map(|r| format!(": {r}")).unwrap_or_default()
                    );
                    break ExitCode::from(EXIT_FORCED_LOGOUT);
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break ExitCode::FAILURE,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break ExitCode::FAILURE;
                }
                let current = *status.borrow_and_update();
                if current.connection_error {
                    eprintln!("  Connection lost, retrying...");
                } else if current.phase == SyncPhase::Open {
                    eprintln!("  Connected");
                }
            }
            _ = tokio::signal::ctrl_c() => break ExitCode::SUCCESS,
        }
    };

    for subscription in &subscriptions {
        subscription.unsubscribe();
    }
    sync.shutdown().await;
    Ok(code)
}

pub async fn refresh(
    env: Env,
    channel: Option<ChannelId>,
    wait_ms: u64,
) -> anyhow::Result<ExitCode> {
    env.require_token()?;
    let open_timeout = env.config.watchdog() * 2;
    let registry = SubscriptionRegistry::new();
    let sync = spawn_sync(env, registry.clone())?;

    let mut status = sync.watch_status();
    let opened = matches!(
        tokio::time::timeout(
            open_timeout,
            status.wait_for(|s| s.phase == SyncPhase::Open),
        )
        .await,
        Ok(Ok(_))
    );
    if !opened {
        sync.shutdown().await;
        anyhow::bail!("state channel did not open within {open_timeout:?}");
    }

    // Current values replay on register, refreshed ones follow.
    let subscriptions = print_channels(&registry, channel);
    sync.request_refresh(channel).await;
    info!(
        component = "cli",
        event = "cli.refresh_requested",
        channel = ?channel,
    );
    tokio::time::sleep(Duration::from_millis(wait_ms)).await;

    for subscription in &subscriptions {
        subscription.unsubscribe();
    }
    sync.shutdown().await;
    Ok(ExitCode::SUCCESS)
}

fn spawn_sync(env: Env, registry: SubscriptionRegistry) -> anyhow::Result<StateSyncHandle> {
    let settings = SyncSettings {
        ws_base: env.config.ws_base()?,
        identity: env.identity,
        retry_interval: env.config.retry_interval(),
        watchdog: env.config.watchdog(),
    };
    Ok(StateSyncChannel::spawn(settings, registry, env.credentials))
}

fn print_channels(registry: &SubscriptionRegistry, only: Option<ChannelId>) -> Vec<Subscription> {
    let channels: Vec<ChannelId> = match only {
        Some(channel) => vec![channel],
        None => ChannelId::ALL.to_vec(),
    };
    channels
        .into_iter()
        .map(|channel| registry.register(channel, move |payload| print_push(channel, payload)))
        .collect()
}

fn print_push(channel: ChannelId, payload: &Value) {
    match serde_json::to_string(&json!({ "channel": channel, "payload": payload })) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(
            component = "cli",
            event = "cli.print_failed",
            channel = %channel,
            error = %e,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn channel_filter_registers_only_that_channel() {
        let registry = SubscriptionRegistry::new();
        let subs = print_channels(&registry, Some(ChannelId::Snippets));
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].channel(), ChannelId::Snippets);
        assert_eq!(registry.subscriber_count(ChannelId::Snippets), 1);
        assert_eq!(registry.subscriber_count(ChannelId::Entries), 0);

        let all = print_channels(&registry, None);
        assert_eq!(all.len(), ChannelId::ALL.len());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _printer = registry.register(ChannelId::Snippets, move |v| {
            sink.lock().unwrap().push(v.clone())
        });
        registry.publish(ChannelId::Snippets, json!([1]));
        assert_eq!(*seen.lock().unwrap(), vec![json!([1])]);
    }
}
