pub mod blobs;
pub mod invalidation;
pub mod logging;
pub mod metrics_server;
pub mod mime_repair;
pub mod resolve;
pub mod server;

use relay_client::RelayPool;
use site_cache::CacheStore;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use url::Url;

/// Addressable event kind mapping one site path to a content hash.
pub const MAPPING_KIND: u32 = 34128;
/// Replaceable event kind listing a publisher's preferred relays.
pub const RELAY_LIST_KIND: u32 = 10002;
/// Replaceable event kind listing a publisher's preferred blob servers.
pub const SERVER_LIST_KIND: u32 = 10063;

pub const USER_AGENT: &str = concat!("nsite-gateway/", env!("CARGO_PKG_VERSION"));

/// Everything the request pipeline needs, constructed once at startup and
/// passed around explicitly. There is no process-global state; tests build
/// their own `App` against mock upstreams.
pub struct App {
    pub cache: CacheStore,
    pub pool: RelayPool,
    pub http: reqwest::Client,
    pub config: GatewayConfig,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Suffix stripped from request hosts to obtain the pubkey label.
    pub base_domain: String,
    /// Seed relays for per-publisher discovery.
    pub default_relays: Vec<Url>,
    /// Fallback blob servers for publishers without a server list.
    pub default_servers: Vec<Url>,
    /// Ceiling on the wall time of a single relay query.
    pub relay_query_timeout: Duration,
    /// Per-server deadline for one blob fetch.
    pub request_timeout: Duration,
    /// Byte cap on fetched blobs.
    pub max_file_size: u64,
    /// Value of the Cache-Control header on served blobs.
    pub cache_control: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_domain: "localhost".to_string(),
            default_relays: Vec::new(),
            default_servers: Vec::new(),
            relay_query_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            max_file_size: 50 * 1024 * 1024,
            cache_control: "public, max-age=3600".to_string(),
        }
    }
}

impl App {
    pub fn new(cache: CacheStore, pool: RelayPool, config: GatewayConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            cache,
            pool,
            http,
            config,
        })
    }
}

/// Seconds since the epoch, as stamped on events.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}
