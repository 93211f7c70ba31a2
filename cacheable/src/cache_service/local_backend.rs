use super::backend::CacheBackend;
use errors::CacheError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

struct Entry {
    value: Vec<u8>,
    deadline: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.deadline.map(|d| d <= now).unwrap_or(false)
    }
}

/// In-memory backend with real TTL semantics on the tokio clock. Under
/// `start_paused` tests, `tokio::time::advance` drives expiry and the
/// expired-key notifications exactly like a Redis deployment would.
pub struct LocalBackend {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    expired_subscribers: Arc<Mutex<Vec<mpsc::Sender<String>>>>,
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBackend {
    pub fn new() -> Self {
        let backend = Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            expired_subscribers: Arc::new(Mutex::new(Vec::new())),
        };
        backend.spawn_janitor();
        backend
    }

    fn spawn_janitor(&self) {
        let entries = Arc::clone(&self.entries);
        let subscribers = Arc::clone(&self.expired_subscribers);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(100));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let now = Instant::now();

                let dead: Vec<String> = {
                    let mut map = entries.lock().await;
                    let dead: Vec<String> = map
                        .iter()
                        .filter(|(_, e)| e.expired(now))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in &dead {
                        map.remove(key);
                    }
                    dead
                };

                if dead.is_empty() {
                    continue;
                }

                let mut subs = subscribers.lock().await;
                subs.retain(|tx| !tx.is_closed());
                for key in dead {
                    for tx in subs.iter() {
                        let _ = tx.try_send(key.clone());
                    }
                }
            }
        });
    }

    fn matches(pattern: &str, key: &str) -> bool {
        // Only the trailing-star form is ever used against the cache.
        if let Some(prefix) = pattern.strip_suffix('*') {
            key.starts_with(prefix)
        } else {
            key == pattern
        }
    }
}

#[async_trait::async_trait]
impl CacheBackend for LocalBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let map = self.entries.lock().await;
        match map.get(key) {
            Some(entry) if !entry.expired(Instant::now()) => Ok(Some(entry.value.clone())),
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut map = self.entries.lock().await;
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                deadline: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_keepttl(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        let mut map = self.entries.lock().await;
        let deadline = map.get(key).and_then(|e| e.deadline);
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                deadline,
            },
        );
        Ok(())
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        let mut map = self.entries.lock().await;
        let now = Instant::now();
        if map.get(key).map(|e| !e.expired(now)).unwrap_or(false) {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                deadline: ttl.map(|t| now + t),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        let mut map = self.entries.lock().await;
        map.remove(key);
        Ok(())
    }

    async fn del_batch(&self, keys: &[&str]) -> Result<u64, CacheError> {
        let mut map = self.entries.lock().await;
        let mut removed = 0;
        for key in keys {
            if map.remove(*key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        let map = self.entries.lock().await;
        let now = Instant::now();
        Ok(keys
            .iter()
            .map(|key| match map.get(*key) {
                Some(entry) if !entry.expired(now) => Some(entry.value.clone()),
                _ => None,
            })
            .collect())
    }

    async fn keys_with_limit(&self, pattern: &str, limit: usize) -> Result<Vec<String>, CacheError> {
        let map = self.entries.lock().await;
        let now = Instant::now();
        Ok(map
            .iter()
            .filter(|(k, e)| !e.expired(now) && Self::matches(pattern, k))
            .map(|(k, _)| k.clone())
            .take(limit)
            .collect())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        let map = self.entries.lock().await;
        let now = Instant::now();
        Ok(map.get(key).and_then(|e| {
            e.deadline
                .filter(|d| *d > now)
                .map(|d| d.duration_since(now))
        }))
    }

    async fn compare_swap(
        &self,
        key: &str,
        expected: &[u8],
        new: &[u8],
    ) -> Result<bool, CacheError> {
        let mut map = self.entries.lock().await;
        let now = Instant::now();
        match map.get_mut(key) {
            Some(entry) if !entry.expired(now) && entry.value == expected => {
                entry.value = new.to_vec();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expired_events(&self) -> Result<mpsc::Receiver<String>, CacheError> {
        let (tx, rx) = mpsc::channel(1024);
        self.expired_subscribers.lock().await.push(tx);
        Ok(rx)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
