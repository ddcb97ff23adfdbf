use crate::{backend::Backend, Error};
use redis::AsyncCommands;
use std::time::Duration;

/// Networked key-value backend speaking the Redis protocol.
///
/// TTLs are native (`SET ... EX`), so `touch` is a bare `EXPIRE` and never
/// re-transmits the value. The connection manager transparently redials
/// dropped connections; individual command failures surface as errors for
/// the store to log.
pub struct RedisBackend {
    conn: redis::aio::ConnectionManager,
}

impl RedisBackend {
    /// Connects eagerly so that a misconfigured or unreachable server is a
    /// startup failure, not a steady-state surprise.
    pub async fn open(url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait::async_trait]
impl Backend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let () = conn.set_ex(key, value, ttl_seconds(ttl)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let () = conn.del(key).await?;
        Ok(())
    }

    async fn clear(&self, prefix: &str) -> Result<(), Error> {
        let mut scan_conn = self.conn.clone();
        let mut keys: Vec<String> = Vec::new();
        {
            let mut iter = scan_conn
                .scan_match::<_, String>(format!("{prefix}*"))
                .await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }
        if !keys.is_empty() {
            let mut conn = self.conn.clone();
            let () = conn.del(keys).await?;
        }
        Ok(())
    }

    async fn touch(&self, key: &str, ttl: Duration) -> Result<bool, Error> {
        let mut conn = self.conn.clone();
        Ok(conn.expire(key, ttl_seconds(ttl) as i64).await?)
    }
}
