use crate::{backend::Backend, Error};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-process backend: a mutexed map with per-entry deadlines, bounded by
/// entry count with FIFO eviction under pressure. Expired entries are
/// dropped lazily on read and opportunistically while evicting.
pub struct MemoryBackend {
    store: Mutex<Store>,
    capacity: usize,
}

#[derive(Default)]
struct Store {
    entries: HashMap<String, Entry>,
    // Keys in first-insertion order; may contain keys already deleted.
    order: VecDeque<String>,
}

impl MemoryBackend {
    pub const DEFAULT_CAPACITY: usize = 65_536;

    pub fn new(capacity: usize) -> Self {
        Self {
            store: Mutex::new(Store::default()),
            capacity,
        }
    }

    fn evict(&self, store: &mut Store) {
        // Clear expired queue heads first, then fall back to plain FIFO.
        let now = Instant::now();
        loop {
            let expired = match store.order.front() {
                Some(front) => store
                    .entries
                    .get(front)
                    .map_or(true, |entry| entry.expires_at <= now),
                None => break,
            };
            if !expired {
                break;
            }
            if let Some(front) = store.order.pop_front() {
                store.entries.remove(&front);
            }
        }
        while store.entries.len() > self.capacity {
            let Some(front) = store.order.pop_front() else {
                break;
            };
            store.entries.remove(&front);
        }
    }
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let mut store = self.store.lock().unwrap();
        match store.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                store.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), Error> {
        let mut store = self.store.lock().unwrap();
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        if store.entries.insert(key.to_string(), entry).is_none() {
            store.order.push_back(key.to_string());
        }
        self.evict(&mut store);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let mut store = self.store.lock().unwrap();
        store.entries.remove(key);
        Ok(())
    }

    async fn clear(&self, prefix: &str) -> Result<(), Error> {
        let mut store = self.store.lock().unwrap();
        store.entries.retain(|key, _| !key.starts_with(prefix));
        store.order.retain(|key| !key.starts_with(prefix));
        Ok(())
    }

    async fn touch(&self, key: &str, ttl: Duration) -> Result<bool, Error> {
        let mut store = self.store.lock().unwrap();
        let now = Instant::now();
        match store.entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
