use errors::CacheError;
use std::time::Duration;
use tokio::sync::mpsc;

#[async_trait::async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError>;
    /// Overwrites the value while preserving the key's remaining TTL.
    async fn set_keepttl(&self, key: &str, value: &[u8]) -> Result<(), CacheError>;
    async fn set_nx(&self, key: &str, value: &[u8], ttl: Option<Duration>)
    -> Result<bool, CacheError>;
    async fn del(&self, key: &str) -> Result<(), CacheError>;
    async fn del_batch(&self, keys: &[&str]) -> Result<u64, CacheError>;
    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>, CacheError>;
    async fn keys_with_limit(&self, pattern: &str, limit: usize) -> Result<Vec<String>, CacheError>;
    /// Remaining TTL; `None` when the key has no expiry or does not exist.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError>;
    /// Atomic compare-and-swap on the raw value, preserving the TTL. Returns
    /// false on mismatch (caller re-reads and retries).
    async fn compare_swap(
        &self,
        key: &str,
        expected: &[u8],
        new: &[u8],
    ) -> Result<bool, CacheError>;
    /// Stream of expired key names. Backends that cannot deliver
    /// notifications return `CacheError::Notify`.
    async fn expired_events(&self) -> Result<mpsc::Receiver<String>, CacheError>;
    async fn ping(&self) -> Result<(), CacheError>;
}
