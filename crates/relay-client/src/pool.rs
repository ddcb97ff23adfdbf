use crate::conn::{Connection, SubMessage};
use crate::{Event, Filter};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

/// How long to wait after the first event of a unique lookup for a newer
/// one before closing the subscription early.
const UNIQUE_LOOKUP_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections idle longer than this are closed by the janitor.
    pub idle_threshold: Duration,
    /// How often the janitor sweeps the connection table.
    pub cleanup_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_threshold: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

// A connection which may be ready (Some), currently being dialed (locked),
// or neither (None and unlocked).
type DialState = Arc<tokio::sync::Mutex<Option<Arc<Connection>>>>;

/// Owns every outgoing relay connection.
///
/// Connections are dialed lazily on first use, shared between queries and
/// subscriptions, and reaped by a background janitor once idle. Cloning the
/// pool shares the connection table.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<Inner>,
}

struct Inner {
    conns: std::sync::Mutex<HashMap<Url, DialState>>,
    config: PoolConfig,
    shutdown: CancellationToken,
}

enum QueryItem {
    Event(Event),
    RelayDone,
}

impl RelayPool {
    pub fn new(config: PoolConfig) -> Self {
        let inner = Arc::new(Inner {
            conns: Default::default(),
            config,
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(janitor(inner.clone()));
        Self { inner }
    }

    /// Number of connections currently held (ready or being dialed).
    pub fn connection_count(&self) -> usize {
        let conns = self.inner.conns.lock().unwrap();
        conns
            .values()
            .filter(|state| match state.try_lock() {
                Ok(state) => state.as_ref().map_or(false, |conn| conn.is_alive()),
                Err(_) => true,
            })
            .count()
    }

    /// Broadcast `filter` to every relay in `relays` and collect events
    /// until all contacted relays signal end-of-stored-events or the
    /// timeout fires, whichever comes first.
    ///
    /// Relays that cannot be reached within the deadline are silently
    /// dropped from the query; a pool-wide failure yields an empty list.
    pub async fn query(&self, relays: &[Url], filter: Filter, timeout: Duration) -> Vec<Event> {
        let deadline = tokio::time::Instant::now() + timeout;
        let relays = self.prioritize(relays);
        if relays.is_empty() {
            return Vec::new();
        }
        metrics::counter!("relay_pool_queries").increment(1);

        let unique = filter.is_unique_lookup();
        let contacted = relays.len();
        let query_token = self.inner.shutdown.child_token();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for url in relays {
            let pool = self.clone();
            let filter = filter.clone();
            let tx = tx.clone();
            let token = query_token.clone();
            tokio::spawn(async move {
                pool.query_relay(url, filter, deadline, tx, token).await;
            });
        }
        drop(tx);
        // Cancelling on return closes the per-relay subscriptions without
        // touching the underlying connections.
        let _guard = query_token.drop_guard();

        let mut events = Vec::new();
        let mut done = 0;
        let mut cutoff = deadline;
        loop {
            tokio::select! {
                item = rx.recv() => match item {
                    None => break,
                    Some(QueryItem::Event(event)) => {
                        if unique && events.is_empty() {
                            cutoff = cutoff.min(tokio::time::Instant::now() + UNIQUE_LOOKUP_GRACE);
                        }
                        events.push(event);
                    }
                    Some(QueryItem::RelayDone) => {
                        done += 1;
                        if done == contacted {
                            break;
                        }
                    }
                },
                _ = tokio::time::sleep_until(cutoff) => break,
            }
        }
        events
    }

    async fn query_relay(
        &self,
        url: Url,
        filter: Filter,
        deadline: tokio::time::Instant,
        tx: mpsc::UnboundedSender<QueryItem>,
        token: CancellationToken,
    ) {
        let conn = tokio::select! {
            dialed = tokio::time::timeout_at(deadline, self.connect(&url)) => match dialed {
                Ok(Ok(conn)) => conn,
                Ok(Err(err)) => {
                    tracing::debug!(%url, %err, "relay unreachable, dropped from query");
                    let _ = tx.send(QueryItem::RelayDone);
                    return;
                }
                Err(_elapsed) => {
                    tracing::debug!(%url, "relay dial timed out, dropped from query");
                    let _ = tx.send(QueryItem::RelayDone);
                    return;
                }
            },
            _ = token.cancelled() => return,
        };

        let (sub_id, mut sub_rx) = conn.subscribe(vec![filter]);
        loop {
            let message = tokio::select! {
                message = sub_rx.recv() => message,
                _ = tokio::time::sleep_until(deadline) => break,
                _ = token.cancelled() => break,
            };
            match message {
                Some(SubMessage::Event(event)) => {
                    if tx.send(QueryItem::Event(event)).is_err() {
                        break;
                    }
                }
                Some(SubMessage::Eose) | Some(SubMessage::Closed) | None => break,
            }
        }
        conn.unsubscribe(&sub_id);
        let _ = tx.send(QueryItem::RelayDone);
    }

    /// Get or dial the connection for `url`. At most one connection exists
    /// per URL; concurrent callers wait on the same dial.
    pub(crate) async fn connect(&self, url: &Url) -> crate::Result<Arc<Connection>> {
        let state = {
            let mut conns = self.inner.conns.lock().unwrap();
            conns.entry(url.clone()).or_default().clone()
        };
        let mut state = state.lock().await;

        // Fast path: already connected.
        if let Some(conn) = state.as_ref() {
            if conn.is_alive() {
                conn.touch();
                return Ok(conn.clone());
            }
        }

        // Slow path: dial the relay.
        let conn = Arc::new(Connection::dial(url.clone()).await?);
        *state = Some(conn.clone());
        Ok(conn)
    }

    // Deduplicate, preferring relays which are already connected. The sort
    // is stable, so the caller's order is preserved within each class.
    fn prioritize(&self, relays: &[Url]) -> Vec<Url> {
        let mut seen = HashSet::new();
        let mut relays: Vec<Url> = relays
            .iter()
            .filter(|url| seen.insert((*url).clone()))
            .cloned()
            .collect();
        let conns = self.inner.conns.lock().unwrap();
        relays.sort_by_key(|url| {
            let connected = conns.get(url).map_or(false, |state| match state.try_lock() {
                Ok(state) => state.as_ref().map_or(false, |conn| conn.is_alive()),
                Err(_) => true,
            });
            !connected
        });
        relays
    }

    /// Open a long-lived subscription on a single relay. The returned
    /// stream yields events until the subscription or its connection
    /// closes; dropping it sends CLOSE without tearing down the connection.
    pub async fn subscribe(&self, url: &Url, filters: Vec<Filter>) -> crate::Result<Subscription> {
        let conn = self.connect(url).await?;
        let (sub_id, rx) = conn.subscribe(filters);
        Ok(Subscription { conn, sub_id, rx })
    }

    /// Close every connection and stop the janitor. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let states: Vec<DialState> = {
            let mut conns = self.inner.conns.lock().unwrap();
            conns.drain().map(|(_, state)| state).collect()
        };
        for state in states {
            if let Some(conn) = state.lock().await.take() {
                conn.close();
            }
        }
    }
}

/// A long-lived subscription held open on one relay connection.
pub struct Subscription {
    conn: Arc<Connection>,
    sub_id: String,
    rx: mpsc::UnboundedReceiver<SubMessage>,
}

impl Subscription {
    /// Next message, or `None` once the stream is exhausted after a close.
    /// Receiving counts as use of the underlying connection, keeping an
    /// active subscription ahead of the idle janitor.
    pub async fn recv(&mut self) -> Option<SubMessage> {
        let message = self.rx.recv().await;
        self.conn.touch();
        message
    }

    pub fn relay(&self) -> &Url {
        self.conn.url()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.conn.unsubscribe(&self.sub_id);
    }
}

async fn janitor(inner: Arc<Inner>) {
    let mut interval = tokio::time::interval(inner.config.cleanup_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }
        sweep(&inner);
    }
}

// Close connections which have not been used within the idle threshold.
fn sweep(inner: &Inner) {
    let mut conns = inner.conns.lock().unwrap();
    conns.retain(|url, state| {
        // Retain entries which are currently being dialed.
        let Ok(state) = state.try_lock() else {
            return true;
        };
        let Some(conn) = state.as_ref() else {
            return false;
        };
        if !conn.is_alive() {
            return false;
        }
        if conn.idle_for() >= inner.config.idle_threshold {
            tracing::debug!(%url, "closing idle relay connection");
            conn.close();
            return false;
        }
        true
    });
}
