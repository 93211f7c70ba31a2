use super::backend::CacheBackend;
use deadpool_redis::Pool;
use deadpool_redis::redis::AsyncCommands;
use errors::CacheError;
use futures::StreamExt;
use log::{error, info, warn};
use std::time::Duration;
use tokio::sync::mpsc;

pub struct RedisBackend {
    pool: Pool,
    /// Bare client for pub/sub; pooled connections cannot subscribe.
    client: Option<deadpool_redis::redis::Client>,
    db: i64,
    compression_threshold: usize,
}

fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() > 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

fn is_zstd(bytes: &[u8]) -> bool {
    bytes.len() > 4 && bytes[0] == 0x28 && bytes[1] == 0xb5 && bytes[2] == 0x2f && bytes[3] == 0xfd
}

fn decode_compressed(bytes: Vec<u8>) -> Result<Vec<u8>, CacheError> {
    if is_gzip(&bytes) {
        use flate2::read::GzDecoder;
        use std::io::Read;
        let mut decoder = GzDecoder::new(bytes.as_slice());
        let mut decoded = Vec::new();
        decoder.read_to_end(&mut decoded)?;
        return Ok(decoded);
    }
    if is_zstd(&bytes) {
        let decoded = zstd::stream::decode_all(std::io::Cursor::new(bytes.as_slice()))?;
        return Ok(decoded);
    }
    Ok(bytes)
}

fn decode_compressed_best_effort(bytes: Vec<u8>) -> Vec<u8> {
    if is_gzip(&bytes) {
        use flate2::read::GzDecoder;
        use std::io::Read;
        let mut decoder = GzDecoder::new(bytes.as_slice());
        let mut decoded = Vec::new();
        if decoder.read_to_end(&mut decoded).is_ok() {
            return decoded;
        }
        return bytes;
    }
    if is_zstd(&bytes) {
        if let Ok(decoded) = zstd::stream::decode_all(std::io::Cursor::new(bytes.as_slice())) {
            return decoded;
        }
        return bytes;
    }
    bytes
}

impl RedisBackend {
    pub fn new(
        pool: Pool,
        client: Option<deadpool_redis::redis::Client>,
        db: i64,
        compression_threshold: usize,
    ) -> Self {
        Self {
            pool,
            client,
            db,
            compression_threshold,
        }
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, CacheError> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::Pool(e.to_string()))
    }

    async fn maybe_compress(&self, value: &[u8]) -> Result<Vec<u8>, CacheError> {
        if value.len() > self.compression_threshold {
            let val = value.to_vec();
            tokio::task::spawn_blocking(move || {
                zstd::stream::encode_all(std::io::Cursor::new(val), 3)
                    .map_err(|e| CacheError::Pool(e.to_string()))
            })
            .await
            .map_err(|e| CacheError::Pool(e.to_string()))?
        } else {
            Ok(value.to_vec())
        }
    }

    /// Best-effort enabling of expired-key events; deployments usually set
    /// this in redis.conf, so a DENIED here is only worth a warning.
    pub async fn enable_keyspace_notifications(&self) {
        match self.conn().await {
            Ok(mut conn) => {
                let result: Result<(), _> = deadpool_redis::redis::cmd("CONFIG")
                    .arg("SET")
                    .arg("notify-keyspace-events")
                    .arg("Ex")
                    .query_async(&mut conn)
                    .await;
                match result {
                    Ok(_) => info!("Enabled keyspace expiration notifications"),
                    Err(e) => warn!("Could not enable keyspace notifications: {}", e),
                }
            }
            Err(e) => warn!("No connection for keyspace notification setup: {}", e),
        }
    }
}

#[async_trait::async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn().await?;
        let result: Option<Vec<u8>> = conn.get(key).await.map_err(CacheError::Redis)?;

        if let Some(bytes) = result {
            if is_gzip(&bytes) || is_zstd(&bytes) {
                let decoded = tokio::task::spawn_blocking(move || decode_compressed(bytes))
                    .await
                    .map_err(|e| CacheError::Pool(e.to_string()))??;
                return Ok(Some(decoded));
            }
            return Ok(Some(bytes));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
        let final_value = self.maybe_compress(value).await?;
        let mut conn = self.conn().await?;
        if let Some(duration) = ttl {
            let _: () = conn
                .set_ex(key, final_value, duration.as_secs())
                .await
                .map_err(CacheError::Redis)?;
        } else {
            let _: () = conn.set(key, final_value).await.map_err(CacheError::Redis)?;
        }
        Ok(())
    }

    async fn set_keepttl(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        let final_value = self.maybe_compress(value).await?;
        let mut conn = self.conn().await?;
        let _: () = deadpool_redis::redis::cmd("SET")
            .arg(key)
            .arg(final_value)
            .arg("KEEPTTL")
            .query_async(&mut conn)
            .await
            .map_err(CacheError::Redis)?;
        Ok(())
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;

        let result: Option<String> = if let Some(ttl) = ttl {
            deadpool_redis::redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("EX")
                .arg(ttl.as_secs())
                .query_async(&mut conn)
                .await
                .map_err(CacheError::Redis)?
        } else {
            deadpool_redis::redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .query_async(&mut conn)
                .await
                .map_err(CacheError::Redis)?
        };
        Ok(result.is_some())
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        conn.del(key).await.map_err(CacheError::Redis)
    }

    async fn del_batch(&self, keys: &[&str]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;

        let mut pipe = deadpool_redis::redis::pipe();
        for key in keys {
            pipe.del(*key);
        }

        let results: Vec<i64> = pipe.query_async(&mut conn).await.map_err(CacheError::Redis)?;
        Ok(results.iter().sum::<i64>() as u64)
    }

    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;

        let values: Vec<Option<Vec<u8>>> = deadpool_redis::redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(CacheError::Redis)?;

        let has_compressed = values
            .iter()
            .any(|val| val.as_ref().is_some_and(|bytes| is_gzip(bytes) || is_zstd(bytes)));
        if !has_compressed {
            return Ok(values);
        }

        let decoded_values = tokio::task::spawn_blocking(move || {
            values
                .into_iter()
                .map(|val| val.map(decode_compressed_best_effort))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| CacheError::Pool(e.to_string()))?;

        Ok(decoded_values)
    }

    async fn keys_with_limit(&self, pattern: &str, limit: usize) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn().await?;

        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        let scan_count = std::cmp::min(limit, 1000);

        loop {
            let (new_cursor, batch): (u64, Vec<String>) = deadpool_redis::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(scan_count)
                .query_async(&mut conn)
                .await
                .map_err(CacheError::Redis)?;

            for key in batch {
                if keys.len() >= limit {
                    return Ok(keys);
                }
                keys.push(key);
            }

            cursor = new_cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        let mut conn = self.conn().await?;
        let ttl: i64 = deadpool_redis::redis::cmd("TTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(CacheError::Redis)?;
        // -1: no expiry, -2: no key.
        if ttl < 0 {
            Ok(None)
        } else {
            Ok(Some(Duration::from_secs(ttl as u64)))
        }
    }

    async fn compare_swap(
        &self,
        key: &str,
        expected: &[u8],
        new: &[u8],
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        let script = deadpool_redis::redis::Script::new(
            r"
            local cur = redis.call('GET', KEYS[1])
            if cur == ARGV[1] then
                redis.call('SET', KEYS[1], ARGV[2], 'KEEPTTL')
                return 1
            end
            return 0
        ",
        );

        let swapped: i32 = script
            .key(key)
            .arg(expected)
            .arg(new)
            .invoke_async(&mut conn)
            .await
            .map_err(CacheError::Redis)?;
        Ok(swapped == 1)
    }

    async fn expired_events(&self) -> Result<mpsc::Receiver<String>, CacheError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| CacheError::Notify("no pub/sub client configured".to_string()))?;

        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(CacheError::Redis)?;
        let channel = format!("__keyevent@{}__:expired", self.db);
        pubsub
            .psubscribe(&channel)
            .await
            .map_err(CacheError::Redis)?;

        let (tx, rx) = mpsc::channel(1024);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let key: String = match msg.get_payload() {
                    Ok(k) => k,
                    Err(e) => {
                        error!("Malformed expiration event: {}", e);
                        continue;
                    }
                };
                if tx.send(key).await.is_err() {
                    break;
                }
            }
            info!("Expired-key subscription closed");
        });

        Ok(rx)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let _: String = deadpool_redis::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(CacheError::Redis)?;
        Ok(())
    }
}
