//! Namespaced, TTL'd key-value caching with pluggable storage.
//!
//! Every value the gateway resolves (publisher keys, relay and server
//! lists, path mappings, blob bytes, negative marks) lives here under its
//! own namespace and lifetime. The cache is exactly that: every backend
//! failure on the write path is logged and swallowed, and every failure on
//! the read path behaves as a miss.

mod backend;
pub use backend::Backend;

mod disk;
mod kv;
mod memory;
pub use memory::MemoryBackend;

mod value;
pub use value::{CachedValue, PathMapping};

use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unrecognized cache backend selector: '{0}'")]
    UnknownBackend(String),
    #[error("key-value backend: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("file backend: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The seven sub-caches. Each has a fixed key shape, value variant, and
/// default lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// Lowercase hostname -> publisher key.
    Domains,
    /// Publisher key -> preferred read relays.
    Relays,
    /// Publisher key -> preferred blob servers.
    Servers,
    /// Publisher key + path -> current mapping.
    Paths,
    /// Content hash -> URLs that served it.
    Blobs,
    /// Content hash -> raw bytes.
    Content,
    /// Short-lived "authoritatively absent" marks.
    Negative,
}

impl Namespace {
    pub fn prefix(&self) -> &'static str {
        match self {
            Namespace::Domains => "domains",
            Namespace::Relays => "relays",
            Namespace::Servers => "servers",
            Namespace::Paths => "paths",
            Namespace::Blobs => "blobs",
            Namespace::Content => "content",
            Namespace::Negative => "negative",
        }
    }

    fn default_ttl(&self, config: &CacheConfig) -> Duration {
        match self {
            Namespace::Content => config.content_ttl,
            Namespace::Negative => config.negative_ttl,
            _ => config.default_ttl,
        }
    }

    // Only the read-path namespaces participate in sliding expiration.
    // Negative marks must age out on schedule, and blob bytes only slide
    // when a caller opts in with an explicit touch.
    fn slides(&self) -> bool {
        matches!(
            self,
            Namespace::Domains | Namespace::Relays | Namespace::Servers | Namespace::Paths
        )
    }

    fn expects(&self, value: &CachedValue) -> bool {
        matches!(
            (self, value),
            (Namespace::Domains, CachedValue::Pubkey { .. })
                | (Namespace::Relays, CachedValue::RelayList { .. })
                | (Namespace::Servers, CachedValue::ServerList { .. })
                | (Namespace::Paths, CachedValue::PathMapping(_))
                | (Namespace::Blobs, CachedValue::BlobUrls { .. })
                | (Namespace::Content, CachedValue::Bytes { .. })
                | (Namespace::Negative, CachedValue::Marker)
        )
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub default_ttl: Duration,
    pub content_ttl: Duration,
    pub negative_ttl: Duration,
    pub sliding_expiration: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            content_ttl: Duration::from_secs(1800),
            negative_ttl: Duration::from_secs(10),
            sliding_expiration: false,
        }
    }
}

/// The cache store: typed, namespaced reads and writes over one backend
/// handle. Cheap to clone; all clones share the backend.
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn Backend>,
    config: CacheConfig,
}

impl CacheStore {
    /// Open the backend named by `selector` (see [`Backend`] docs for the
    /// accepted schemes). Fails fast when the backend cannot be opened.
    pub async fn open(selector: &str, config: CacheConfig) -> Result<Self, Error> {
        let backend = backend::open(selector).await?;
        Ok(Self { backend, config })
    }

    pub fn with_backend(backend: Arc<dyn Backend>, config: CacheConfig) -> Self {
        Self { backend, config }
    }

    fn key(ns: Namespace, key: &str) -> String {
        format!("{}:{}", ns.prefix(), key)
    }

    /// Read without side effects: never extends an entry's lifetime.
    pub async fn get_sticky(&self, ns: Namespace, key: &str) -> Option<CachedValue> {
        let full = Self::key(ns, key);
        let raw = match self.backend.get(&full).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                metrics::counter!("cache_misses", "namespace" => ns.prefix()).increment(1);
                return None;
            }
            Err(err) => {
                tracing::debug!(key = full, %err, "cache read failed, treating as miss");
                metrics::counter!("cache_errors", "namespace" => ns.prefix()).increment(1);
                return None;
            }
        };
        match serde_json::from_slice::<CachedValue>(&raw) {
            Ok(value) if ns.expects(&value) => {
                metrics::counter!("cache_hits", "namespace" => ns.prefix()).increment(1);
                Some(value)
            }
            Ok(_) | Err(_) => {
                tracing::warn!(key = full, "corrupt cache entry, dropping");
                let _ = self.backend.delete(&full).await;
                None
            }
        }
    }

    /// Read on the serving path: under sliding expiration, a hit in a
    /// read-path namespace refreshes the entry's TTL.
    pub async fn get_refreshing(&self, ns: Namespace, key: &str) -> Option<CachedValue> {
        let value = self.get_sticky(ns, key).await?;
        if self.config.sliding_expiration && ns.slides() {
            let full = Self::key(ns, key);
            if let Err(err) = self.backend.touch(&full, ns.default_ttl(&self.config)).await {
                tracing::debug!(key = full, %err, "cache touch failed");
            }
        }
        Some(value)
    }

    pub async fn put(&self, ns: Namespace, key: &str, value: &CachedValue) {
        self.put_ttl(ns, key, value, ns.default_ttl(&self.config))
            .await
    }

    pub async fn put_ttl(&self, ns: Namespace, key: &str, value: &CachedValue, ttl: Duration) {
        debug_assert!(ns.expects(value));
        let full = Self::key(ns, key);
        let raw = match serde_json::to_vec(value) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(key = full, %err, "failed to encode cache value");
                return;
            }
        };
        if let Err(err) = self.backend.put(&full, raw, ttl).await {
            tracing::debug!(key = full, %err, "cache write failed");
            metrics::counter!("cache_errors", "namespace" => ns.prefix()).increment(1);
        }
    }

    pub async fn delete(&self, ns: Namespace, key: &str) {
        let full = Self::key(ns, key);
        if let Err(err) = self.backend.delete(&full).await {
            tracing::debug!(key = full, %err, "cache delete failed");
        }
    }

    pub async fn clear(&self, ns: Namespace) {
        if let Err(err) = self.backend.clear(&format!("{}:", ns.prefix())).await {
            tracing::debug!(namespace = ns.prefix(), %err, "cache clear failed");
        }
    }

    /// After a `domains` hit, refresh every pubkey-scoped entry for the
    /// site in one go. A refresh is a hint: failures are logged, never
    /// propagated.
    pub async fn touch_related(&self, pubkey_hex: &str, domain: &str) {
        if !self.config.sliding_expiration {
            return;
        }
        let ttl = self.config.default_ttl;
        let domains_key = Self::key(Namespace::Domains, domain);
        let relays_key = Self::key(Namespace::Relays, pubkey_hex);
        let servers_key = Self::key(Namespace::Servers, pubkey_hex);
        let (domains, relays, servers) = tokio::join!(
            self.backend.touch(&domains_key, ttl),
            self.backend.touch(&relays_key, ttl),
            self.backend.touch(&servers_key, ttl),
        );
        for result in [domains, relays, servers] {
            if let Err(err) = result {
                tracing::debug!(pubkey = pubkey_hex, %err, "related cache refresh failed");
            }
        }
    }

    pub async fn close(&self) {
        self.backend.close().await;
    }
}
