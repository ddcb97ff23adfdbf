//! In-process upstreams for gateway tests: a relay speaking just enough of
//! the subscription protocol, and a blob server with canned responses.

use axum::http::StatusCode;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use nsite_gateway::{App, GatewayConfig, MAPPING_KIND};
use relay_client::{Event, Filter, PoolConfig, RelayPool};
use sha2::{Digest, Sha256};
use site_cache::{CacheConfig, CacheStore, MemoryBackend};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

pub struct MockRelay {
    pub url: Url,
    /// REQ frames received, across all connections.
    pub reqs: Arc<AtomicUsize>,
}

/// Serve `stored` to any subscription whose filters match, then EOSE.
pub async fn spawn_relay(stored: Vec<Event>) -> MockRelay {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = Url::parse(&format!("ws://{}", listener.local_addr().unwrap())).unwrap();
    let reqs = Arc::new(AtomicUsize::new(0));
    let counter = reqs.clone();
    let stored = Arc::new(stored);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let stored = stored.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    let Message::Text(text) = message else {
                        continue;
                    };
                    let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
                    if frame[0] != "REQ" {
                        continue;
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                    let sub_id = frame[1].as_str().unwrap().to_string();
                    let filters: Vec<Filter> = frame.as_array().unwrap()[2..]
                        .iter()
                        .map(|f| serde_json::from_value(f.clone()).unwrap())
                        .collect();
                    for event in stored
                        .iter()
                        .filter(|ev| filters.iter().any(|filter| filter.matches(ev)))
                    {
                        let frame = serde_json::json!(["EVENT", sub_id, event]).to_string();
                        if ws.send(Message::Text(frame)).await.is_err() {
                            return;
                        }
                    }
                    let frame = serde_json::json!(["EOSE", sub_id]).to_string();
                    if ws.send(Message::Text(frame)).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    MockRelay { url, reqs }
}

pub struct MockBlobServer {
    pub url: Url,
    pub hits: Arc<AtomicUsize>,
}

#[derive(Clone)]
struct BlobState {
    status: StatusCode,
    body: Bytes,
    content_type: &'static str,
    hits: Arc<AtomicUsize>,
}

/// Respond to every `GET /<sha256>` with the given status and body.
pub async fn spawn_blob_server(
    status: StatusCode,
    body: Vec<u8>,
    content_type: &'static str,
) -> MockBlobServer {
    use axum::routing::get;

    let hits = Arc::new(AtomicUsize::new(0));
    let state = BlobState {
        status,
        body: Bytes::from(body),
        content_type,
        hits: hits.clone(),
    };
    let router = axum::Router::new()
        .route("/:sha", get(blob_handler))
        .with_state(state);

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(router.into_make_service())
            .await
            .unwrap()
    });
    MockBlobServer {
        url: Url::parse(&format!("http://{addr}/")).unwrap(),
        hits,
    }
}

async fn blob_handler(
    axum::extract::State(state): axum::extract::State<BlobState>,
) -> impl axum::response::IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    (
        state.status,
        [(axum::http::header::CONTENT_TYPE, state.content_type)],
        state.body.clone(),
    )
}

/// An `App` over the memory cache backend and a fresh relay pool.
pub async fn test_app(relays: Vec<Url>, servers: Vec<Url>) -> Arc<App> {
    let cache = CacheStore::with_backend(Arc::new(MemoryBackend::new(4096)), CacheConfig::default());
    let pool = RelayPool::new(PoolConfig::default());
    let config = GatewayConfig {
        default_relays: relays,
        default_servers: servers,
        relay_query_timeout: Duration::from_secs(2),
        ..GatewayConfig::default()
    };
    Arc::new(App::new(cache, pool, config).unwrap())
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn mapping_event(pubkey_hex: &str, path: &str, sha256: &str, created_at: u64) -> Event {
    Event {
        id: format!("map-{path}-{created_at}"),
        pubkey: pubkey_hex.to_string(),
        created_at,
        kind: MAPPING_KIND,
        tags: vec![
            vec!["d".to_string(), path.to_string()],
            vec!["x".to_string(), sha256.to_string()],
        ],
        content: String::new(),
        sig: String::new(),
    }
}

pub fn list_event(pubkey_hex: &str, kind: u32, tags: Vec<Vec<&str>>) -> Event {
    Event {
        id: format!("list-{kind}"),
        pubkey: pubkey_hex.to_string(),
        created_at: 1,
        kind,
        tags: tags
            .into_iter()
            .map(|tag| tag.into_iter().map(str::to_string).collect())
            .collect(),
        content: String::new(),
        sig: String::new(),
    }
}
