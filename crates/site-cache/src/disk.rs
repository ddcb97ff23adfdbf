use crate::{backend::Backend, Error};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

// sled has no per-entry TTL, so each stored value carries its deadline and
// a background task prunes what readers have not already dropped.
#[derive(Serialize, Deserialize)]
struct StoredEntry {
    expires_at_ms: u64,
    value: Vec<u8>,
}

/// Embedded single-process file database backend.
pub struct SledBackend {
    db: sled::Db,
    prune: CancellationToken,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

impl SledBackend {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let db = sled::open(path)?;
        let prune = CancellationToken::new();
        tokio::spawn(prune_loop(db.clone(), prune.clone()));
        Ok(Self { db, prune })
    }
}

impl Drop for SledBackend {
    fn drop(&mut self) {
        self.prune.cancel();
    }
}

#[async_trait::async_trait]
impl Backend for SledBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let Some(raw) = self.db.get(key)? else {
            return Ok(None);
        };
        let Ok(entry) = serde_json::from_slice::<StoredEntry>(&raw) else {
            // Unreadable on-disk entry: drop it rather than serve garbage.
            self.db.remove(key)?;
            return Ok(None);
        };
        if entry.expires_at_ms <= now_ms() {
            self.db.remove(key)?;
            return Ok(None);
        }
        Ok(Some(entry.value))
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), Error> {
        let entry = StoredEntry {
            expires_at_ms: now_ms() + ttl.as_millis() as u64,
            value,
        };
        self.db.insert(key, serde_json::to_vec(&entry)?)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.db.remove(key)?;
        Ok(())
    }

    async fn clear(&self, prefix: &str) -> Result<(), Error> {
        let keys: Vec<sled::IVec> = self
            .db
            .scan_prefix(prefix)
            .keys()
            .collect::<Result<_, _>>()?;
        for key in keys {
            self.db.remove(key)?;
        }
        Ok(())
    }

    async fn touch(&self, key: &str, ttl: Duration) -> Result<bool, Error> {
        let Some(raw) = self.db.get(key)? else {
            return Ok(false);
        };
        let Ok(mut entry) = serde_json::from_slice::<StoredEntry>(&raw) else {
            self.db.remove(key)?;
            return Ok(false);
        };
        let now = now_ms();
        if entry.expires_at_ms <= now {
            self.db.remove(key)?;
            return Ok(false);
        }
        entry.expires_at_ms = now + ttl.as_millis() as u64;
        self.db.insert(key, serde_json::to_vec(&entry)?)?;
        Ok(true)
    }

    async fn close(&self) {
        self.prune.cancel();
        if let Err(err) = self.db.flush_async().await {
            tracing::warn!(%err, "failed to flush file cache backend");
        }
    }
}

async fn prune_loop(db: sled::Db, token: CancellationToken) {
    let mut interval = tokio::time::interval(PRUNE_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = interval.tick() => {}
        }
        let now = now_ms();
        let mut pruned = 0usize;
        for item in db.iter() {
            let Ok((key, raw)) = item else { continue };
            let expired = serde_json::from_slice::<StoredEntry>(&raw)
                .map_or(true, |entry| entry.expires_at_ms <= now);
            if expired {
                let _ = db.remove(key);
                pruned += 1;
            }
        }
        if pruned > 0 {
            tracing::debug!(pruned, "pruned expired file cache entries");
        }
    }
}
