use super::backend::CacheBackend;
use super::local_backend::LocalBackend;
use super::redis_backend::RedisBackend;
use deadpool_redis::Pool;
use errors::CacheError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Namespaced facade over a cache backend. All keys pass through
/// `namespaced()` so several deployments can share one Redis.
pub struct CacheService {
    backend: Arc<dyn CacheBackend>,
    namespace: String,
}

impl CacheService {
    pub fn new(
        pool: Option<Pool>,
        client: Option<deadpool_redis::redis::Client>,
        db: i64,
        namespace: String,
        compression_threshold: Option<usize>,
    ) -> Self {
        let threshold = compression_threshold.unwrap_or(1024);

        let backend: Arc<dyn CacheBackend> = match pool {
            Some(p) => Arc::new(RedisBackend::new(p, client, db, threshold)),
            None => Arc::new(LocalBackend::new()),
        };

        CacheService { backend, namespace }
    }

    pub fn with_backend(backend: Arc<dyn CacheBackend>, namespace: String) -> Self {
        CacheService { backend, namespace }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    /// Reverses `namespaced()` for keys coming back from notifications.
    pub fn strip_namespace<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.namespace)?.strip_prefix(':')
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.backend.get(&self.namespaced(key)).await
    }

    pub async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
        self.backend.set(&self.namespaced(key), value, ttl).await
    }

    pub async fn set_keepttl(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        self.backend.set_keepttl(&self.namespaced(key), value).await
    }

    pub async fn set_nx(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        self.backend.set_nx(&self.namespaced(key), value, ttl).await
    }

    pub async fn del(&self, key: &str) -> Result<(), CacheError> {
        self.backend.del(&self.namespaced(key)).await
    }

    pub async fn del_batch(&self, keys: &[&str]) -> Result<u64, CacheError> {
        let namespaced: Vec<String> = keys.iter().map(|k| self.namespaced(k)).collect();
        let refs: Vec<&str> = namespaced.iter().map(String::as_str).collect();
        self.backend.del_batch(&refs).await
    }

    pub async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        let namespaced: Vec<String> = keys.iter().map(|k| self.namespaced(k)).collect();
        let refs: Vec<&str> = namespaced.iter().map(String::as_str).collect();
        self.backend.mget(&refs).await
    }

    pub async fn keys_with_limit(
        &self,
        pattern: &str,
        limit: usize,
    ) -> Result<Vec<String>, CacheError> {
        let keys = self
            .backend
            .keys_with_limit(&self.namespaced(pattern), limit)
            .await?;
        Ok(keys
            .iter()
            .filter_map(|k| self.strip_namespace(k).map(str::to_string))
            .collect())
    }

    pub async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        self.backend.ttl(&self.namespaced(key)).await
    }

    pub async fn compare_swap(
        &self,
        key: &str,
        expected: &[u8],
        new: &[u8],
    ) -> Result<bool, CacheError> {
        self.backend
            .compare_swap(&self.namespaced(key), expected, new)
            .await
    }

    /// Expired keys within this namespace, namespace prefix already removed.
    pub async fn expired_events(&self) -> Result<mpsc::Receiver<String>, CacheError> {
        let mut raw = self.backend.expired_events().await?;
        let namespace = self.namespace.clone();
        let (tx, rx) = mpsc::channel(1024);

        tokio::spawn(async move {
            let prefix = format!("{namespace}:");
            while let Some(key) = raw.recv().await {
                if let Some(stripped) = key.strip_prefix(&prefix) {
                    if tx.send(stripped.to_string()).await.is_err() {
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        self.backend.ping().await
    }
}
