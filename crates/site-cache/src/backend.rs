use crate::{disk::SledBackend, kv::RedisBackend, memory::MemoryBackend, Error};
use std::sync::Arc;
use std::time::Duration;

/// Raw storage underneath the cache: namespaced string keys to opaque
/// bytes, each entry carrying its own time-to-live.
///
/// All methods may touch the network and are safe to call concurrently.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), Error>;

    async fn delete(&self, key: &str) -> Result<(), Error>;

    /// Drop every entry whose key starts with `prefix`.
    async fn clear(&self, prefix: &str) -> Result<(), Error>;

    /// Reset the entry's TTL without re-transmitting its value. Returns
    /// false when the entry no longer exists.
    async fn touch(&self, key: &str, ttl: Duration) -> Result<bool, Error>;

    /// Flush and release backend resources. Idempotent.
    async fn close(&self) {}
}

/// Open the backend named by a selector string:
///
/// - `memory`: in-process map, bounded, nothing persisted;
/// - `kv://host:port[/db]`: networked key-value server (Redis protocol);
/// - `file://path`: embedded single-process database.
///
/// An unknown scheme or an unreachable/unopenable backend is an error;
/// startup fails fast rather than silently downgrading to memory.
pub async fn open(selector: &str) -> Result<Arc<dyn Backend>, Error> {
    if selector == "memory" {
        return Ok(Arc::new(MemoryBackend::new(MemoryBackend::DEFAULT_CAPACITY)));
    }
    if let Some(rest) = selector.strip_prefix("kv://") {
        let backend = RedisBackend::open(&format!("redis://{rest}")).await?;
        return Ok(Arc::new(backend));
    }
    if let Some(path) = selector.strip_prefix("file://") {
        let backend = SledBackend::open(std::path::Path::new(path))?;
        return Ok(Arc::new(backend));
    }
    Err(Error::UnknownBackend(selector.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_selector_is_rejected() {
        assert!(matches!(
            open("mystery://x").await,
            Err(Error::UnknownBackend(_))
        ));
        assert!(matches!(open("").await, Err(Error::UnknownBackend(_))));
    }

    #[tokio::test]
    async fn memory_selector_opens() {
        assert!(open("memory").await.is_ok());
    }

    #[tokio::test]
    async fn unreachable_kv_fails_fast() {
        // Port 1 is never a key-value server; opening must error rather
        // than hand back a half-alive backend.
        assert!(open("kv://127.0.0.1:1").await.is_err());
    }
}
