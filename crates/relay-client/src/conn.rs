use crate::wire::{ClientMessage, RelayMessage};
use crate::{Event, Filter};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// One logical connection to a relay.
///
/// The socket is owned by a spawned task; this handle carries a command
/// channel into that task plus the idle clock the pool's janitor reads.
pub(crate) struct Connection {
    url: Url,
    cmd_tx: mpsc::UnboundedSender<Command>,
    last_used: Mutex<Instant>,
}

enum Command {
    Subscribe {
        sub_id: String,
        filters: Vec<Filter>,
        events: mpsc::UnboundedSender<SubMessage>,
    },
    Unsubscribe {
        sub_id: String,
    },
    Shutdown,
}

/// Item of a subscription stream.
#[derive(Debug)]
pub enum SubMessage {
    Event(Event),
    /// The relay signalled end-of-stored-events for this subscription.
    Eose,
    /// The subscription or its connection is gone.
    Closed,
}

impl Connection {
    pub(crate) async fn dial(url: Url) -> crate::Result<Self> {
        let (socket, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        tracing::debug!(%url, "connected to relay");
        metrics::gauge!("relay_pool_connections").increment(1);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_socket(url.clone(), socket, cmd_rx));

        Ok(Self {
            url,
            cmd_tx,
            last_used: Mutex::new(Instant::now()),
        })
    }

    /// Open a subscription with a fresh id. The receiver yields events until
    /// EOSE handling or closure; the subscription stays registered after
    /// EOSE so live events keep flowing until `unsubscribe`.
    pub(crate) fn subscribe(
        &self,
        filters: Vec<Filter>,
    ) -> (String, mpsc::UnboundedReceiver<SubMessage>) {
        self.touch();
        let sub_id = uuid::Uuid::new_v4().to_string();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let command = Command::Subscribe {
            sub_id: sub_id.clone(),
            filters,
            events: events_tx.clone(),
        };
        if self.cmd_tx.send(command).is_err() {
            // Socket task already exited; surface as an immediately-closed
            // subscription rather than an error.
            let _ = events_tx.send(SubMessage::Closed);
        }
        (sub_id, events_rx)
    }

    pub(crate) fn unsubscribe(&self, sub_id: &str) {
        let _ = self.cmd_tx.send(Command::Unsubscribe {
            sub_id: sub_id.to_string(),
        });
    }

    pub(crate) fn close(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }

    pub(crate) fn is_alive(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    pub(crate) fn touch(&self) {
        *self.last_used.lock().unwrap() = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_used.lock().unwrap().elapsed()
    }

    pub(crate) fn url(&self) -> &Url {
        &self.url
    }
}

async fn run_socket(
    url: Url,
    mut socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut subs: HashMap<String, mpsc::UnboundedSender<SubMessage>> = HashMap::new();
    let start = tokio::time::Instant::now() + KEEPALIVE_INTERVAL;
    let mut keepalive = tokio::time::interval_at(start, KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = cmd_rx.recv() => match command {
                None | Some(Command::Shutdown) => break,
                Some(Command::Subscribe { sub_id, filters, events }) => {
                    let frame = ClientMessage::Req { sub_id: sub_id.clone(), filters }.encode();
                    subs.insert(sub_id, events);
                    if socket.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Some(Command::Unsubscribe { sub_id }) => {
                    if subs.remove(&sub_id).is_some() {
                        let frame = ClientMessage::Close { sub_id }.encode();
                        if socket.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                }
            },
            message = socket.next() => match message {
                Some(Ok(Message::Text(text))) => dispatch(&url, &text, &mut subs),
                Some(Ok(Message::Ping(payload))) => {
                    if socket.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(%url, %err, "relay socket error");
                    break;
                }
            },
            _ = keepalive.tick() => {
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    // Whatever ends the socket ends every subscription riding on it.
    for events in subs.into_values() {
        let _ = events.send(SubMessage::Closed);
    }
    let _ = socket.close(None).await;
    metrics::gauge!("relay_pool_connections").decrement(1);
    tracing::debug!(%url, "relay connection closed");
}

fn dispatch(url: &Url, text: &str, subs: &mut HashMap<String, mpsc::UnboundedSender<SubMessage>>) {
    match RelayMessage::parse(text) {
        Ok(RelayMessage::Event { sub_id, event }) => {
            if let Some(events) = subs.get(&sub_id) {
                let _ = events.send(SubMessage::Event(event));
            }
        }
        Ok(RelayMessage::Eose { sub_id }) => {
            if let Some(events) = subs.get(&sub_id) {
                let _ = events.send(SubMessage::Eose);
            }
        }
        Ok(RelayMessage::Closed { sub_id, message }) => {
            tracing::debug!(%url, sub_id, message, "relay closed subscription");
            if let Some(events) = subs.remove(&sub_id) {
                let _ = events.send(SubMessage::Closed);
            }
        }
        Ok(RelayMessage::Notice { message }) => {
            tracing::debug!(%url, message, "relay notice");
        }
        Ok(RelayMessage::Unknown) => {
            tracing::debug!(%url, "ignoring unrecognized relay frame");
        }
        Err(err) => {
            tracing::debug!(%url, %err, "malformed relay frame");
        }
    }
}
