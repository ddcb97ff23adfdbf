//! The invalidation subscriber: always-on relay subscriptions that turn
//! publish events into cache writes, so most lookups are hits before any
//! client asks.

use crate::{resolve, unix_now, App, MAPPING_KIND, RELAY_LIST_KIND, SERVER_LIST_KIND};
use relay_client::{Event, Filter, SubMessage};
use site_cache::{CachedValue, Namespace, PathMapping};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Stored-event lookback on the mapping subscription, rehydrating the
/// cache for sites published while the subscriber was down.
const MAPPING_LOOKBACK: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct InvalidationConfig {
    pub enabled: bool,
    /// Curated fast relays, independent of any per-publisher list.
    pub relays: Vec<Url>,
    pub reconnect_delay: Duration,
}

// Lifecycle of one relay's subscription, exported as a status gauge.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Status {
    Disabled = 0,
    Connecting = 1,
    Live = 2,
    Degraded = 3,
    Closed = 4,
}

fn set_status(relay: &Url, status: Status) {
    metrics::gauge!("invalidation_status", "relay" => relay.to_string()).set(status as u8 as f64);
}

/// Spawn one subscriber task per invalidation relay. Returns the task
/// handles so shutdown can await them after cancelling `token`.
pub fn spawn(
    app: Arc<App>,
    config: InvalidationConfig,
    token: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    if !config.enabled {
        for relay in &config.relays {
            set_status(relay, Status::Disabled);
        }
        tracing::info!("realtime invalidation is disabled");
        return Vec::new();
    }
    config
        .relays
        .iter()
        .cloned()
        .map(|relay| {
            let app = app.clone();
            let token = token.clone();
            let delay = config.reconnect_delay;
            tokio::spawn(async move { run_relay(app, relay, delay, token).await })
        })
        .collect()
}

async fn run_relay(app: Arc<App>, relay: Url, reconnect_delay: Duration, token: CancellationToken) {
    loop {
        set_status(&relay, Status::Connecting);
        let filters = vec![
            Filter::new()
                .kind(MAPPING_KIND)
                .since(unix_now().saturating_sub(MAPPING_LOOKBACK.as_secs())),
            Filter::new().kind(RELAY_LIST_KIND).since(unix_now()),
            Filter::new().kind(SERVER_LIST_KIND).since(unix_now()),
        ];
        let subscribed = tokio::select! {
            subscribed = app.pool.subscribe(&relay, filters) => subscribed,
            _ = token.cancelled() => break,
        };

        match subscribed {
            Ok(mut subscription) => {
                set_status(&relay, Status::Live);
                tracing::info!(%relay, "invalidation subscription live");
                loop {
                    let message = tokio::select! {
                        message = subscription.recv() => message,
                        _ = token.cancelled() => {
                            set_status(&relay, Status::Closed);
                            return;
                        }
                    };
                    match message {
                        Some(SubMessage::Event(event)) => {
                            metrics::counter!("invalidation_events").increment(1);
                            // A broken event must never take down the
                            // subscription.
                            if let Err(err) = apply_event(&app, &event).await {
                                tracing::warn!(
                                    %relay,
                                    event_id = event.id,
                                    kind = event.kind,
                                    %err,
                                    "failed to apply publish event"
                                );
                            }
                        }
                        Some(SubMessage::Eose) => {
                            tracing::debug!(%relay, "invalidation backlog drained")
                        }
                        Some(SubMessage::Closed) | None => break,
                    }
                }
            }
            Err(err) => tracing::debug!(%relay, %err, "invalidation subscribe failed"),
        }

        if token.is_cancelled() {
            break;
        }
        set_status(&relay, Status::Degraded);
        tracing::debug!(%relay, delay = ?reconnect_delay, "invalidation subscription lost, reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = token.cancelled() => break,
        }
    }
    set_status(&relay, Status::Closed);
}

/// Apply one publish event to the cache.
///
/// Mapping events upsert (or, when they carry no content hash, delete)
/// their path entry; list events replace the publisher's relay or server
/// list wholesale, falling back to the configured defaults when the new
/// list has no usable entries.
pub async fn apply_event(app: &App, event: &Event) -> anyhow::Result<()> {
    if event.pubkey.len() != 64 || !event.pubkey.bytes().all(|b| b.is_ascii_hexdigit()) {
        anyhow::bail!("event author is not a 64-hex pubkey");
    }
    match event.kind {
        MAPPING_KIND => {
            let Some(path) = event.tag_value("d") else {
                return Ok(());
            };
            let key = resolve::mapping_key(&event.pubkey, path);
            match event.tag_value("x") {
                Some(hash) if resolve::is_sha256_hex(hash) => {
                    // Replaceable semantics: an older event never clobbers
                    // a newer cached mapping.
                    if let Some(CachedValue::PathMapping(existing)) =
                        app.cache.get_sticky(Namespace::Paths, &key).await
                    {
                        if existing.created_at > event.created_at {
                            return Ok(());
                        }
                    }
                    let mapping = PathMapping {
                        pubkey: event.pubkey.clone(),
                        path: path.to_string(),
                        sha256: hash.to_ascii_lowercase(),
                        created_at: event.created_at,
                    };
                    app.cache
                        .put(Namespace::Paths, &key, &CachedValue::PathMapping(mapping))
                        .await;
                    app.cache.delete(Namespace::Negative, &key).await;
                }
                _ => {
                    // No usable content hash: the path was unpublished.
                    app.cache.delete(Namespace::Paths, &key).await;
                }
            }
        }
        RELAY_LIST_KIND => {
            let urls = resolve::relay_urls_from_event(event);
            let relays = if urls.is_empty() {
                app.config
                    .default_relays
                    .iter()
                    .map(Url::to_string)
                    .collect()
            } else {
                urls
            };
            app.cache
                .put(
                    Namespace::Relays,
                    &event.pubkey,
                    &CachedValue::RelayList { relays },
                )
                .await;
        }
        SERVER_LIST_KIND => {
            let urls = resolve::server_urls_from_event(event);
            let servers = if urls.is_empty() {
                app.config
                    .default_servers
                    .iter()
                    .map(Url::to_string)
                    .collect()
            } else {
                urls
            };
            app.cache
                .put(
                    Namespace::Servers,
                    &event.pubkey,
                    &CachedValue::ServerList { servers },
                )
                .await;
        }
        other => tracing::debug!(kind = other, "ignoring event of unexpected kind"),
    }
    Ok(())
}
