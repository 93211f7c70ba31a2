use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per identifier within one window.
    pub max_requests: u32,
    pub window_size: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 3600,
            window_size: Duration::from_secs(3600),
        }
    }
}

impl RateLimitConfig {
    pub fn per_hour(max_requests: u32) -> Self {
        Self {
            max_requests,
            window_size: Duration::from_secs(3600),
        }
    }
}

/// Sliding-window rate limiter keyed by caller identity (typically client
/// IP). Endpoint patterns get individual configs; anything unmatched falls
/// back to the default. Read lock for verification, write lock only when
/// recording.
#[derive(Debug)]
pub struct SlidingWindowRateLimiter {
    default_config: Arc<RwLock<RateLimitConfig>>,
    key_configs: Arc<RwLock<HashMap<String, RateLimitConfig>>>,
    records: Arc<RwLock<HashMap<String, Vec<Instant>>>>,
}

impl Default for SlidingWindowRateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl SlidingWindowRateLimiter {
    pub fn new(default_config: RateLimitConfig) -> Self {
        Self {
            default_config: Arc::new(RwLock::new(default_config)),
            key_configs: Arc::new(RwLock::new(HashMap::new())),
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Builds a limiter from endpoint-pattern -> per-hour cap pairs.
    pub fn from_caps<'a>(caps: impl IntoIterator<Item = (&'a String, &'a u32)>) -> Self {
        let mut configs = HashMap::new();
        for (pattern, cap) in caps {
            configs.insert(pattern.clone(), RateLimitConfig::per_hour(*cap));
        }
        Self {
            default_config: Arc::new(RwLock::new(RateLimitConfig::default())),
            key_configs: Arc::new(RwLock::new(configs)),
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn set_key_config(&self, key: String, config: RateLimitConfig) {
        let mut configs = self.key_configs.write().await;
        configs.insert(key, config);
    }

    /// Resolves the config for a request path by longest matching configured
    /// prefix, falling back to the default.
    pub async fn config_for_path(&self, path: &str) -> (String, RateLimitConfig) {
        let configs = self.key_configs.read().await;
        let mut best: Option<(&String, &RateLimitConfig)> = None;
        for (pattern, config) in configs.iter() {
            if path.starts_with(pattern.as_str())
                && best.map(|(p, _)| pattern.len() > p.len()).unwrap_or(true)
            {
                best = Some((pattern, config));
            }
        }
        match best {
            Some((pattern, config)) => (pattern.clone(), config.clone()),
            None => ("*".to_string(), self.default_config.read().await.clone()),
        }
    }

    /// Verifies and records one request for `identifier` against the config
    /// of `path`. Returns the wait time in milliseconds when over the cap.
    pub async fn verify_and_record(&self, path: &str, identifier: &str) -> Result<(), u64> {
        let (pattern, config) = self.config_for_path(path).await;
        let key = format!("{pattern}:{identifier}");

        let mut records = self.records.write().await;
        self.opportunistic_cleanup(&mut records, &config);

        let entry = records.entry(key).or_default();
        let now = Instant::now();
        let cutoff = now - config.window_size;
        entry.retain(|&t| t > cutoff);

        if (entry.len() as u32) < config.max_requests {
            entry.push(now);
            Ok(())
        } else {
            // Oldest record leaving the window frees one slot.
            let oldest = entry.iter().min().copied().unwrap_or(now);
            let wait = config
                .window_size
                .saturating_sub(now.duration_since(oldest));
            Err(wait.as_millis() as u64 + 1)
        }
    }

    pub async fn current_count(&self, path: &str, identifier: &str) -> usize {
        let (pattern, config) = self.config_for_path(path).await;
        let key = format!("{pattern}:{identifier}");
        let records = self.records.read().await;
        let cutoff = Instant::now() - config.window_size;
        records
            .get(&key)
            .map(|entry| entry.iter().filter(|&&t| t > cutoff).count())
            .unwrap_or(0)
    }

    /// Bounded sweep of stale identifiers while the write lock is held, so
    /// long-idle keys do not accumulate forever.
    fn opportunistic_cleanup(
        &self,
        records: &mut HashMap<String, Vec<Instant>>,
        config: &RateLimitConfig,
    ) {
        let max_cleanup = std::cmp::min(5, (records.len() / 10).max(1));
        let cutoff = Instant::now() - config.window_size;

        let mut stale = Vec::new();
        for (checked, (key, entry)) in records.iter_mut().enumerate() {
            if checked >= max_cleanup {
                break;
            }
            entry.retain(|&t| t > cutoff);
            if entry.is_empty() {
                stale.push(key.clone());
            }
        }
        for key in stale {
            records.remove(&key);
        }
    }

    pub async fn reset(&self, identifier: &str) {
        let mut records = self.records.write().await;
        records.retain(|key, _| !key.ends_with(identifier));
    }
}

impl Clone for SlidingWindowRateLimiter {
    fn clone(&self) -> Self {
        Self {
            default_config: self.default_config.clone(),
            key_configs: Arc::clone(&self.key_configs),
            records: Arc::clone(&self.records),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cap_enforced_per_identifier() {
        let limiter = SlidingWindowRateLimiter::new(RateLimitConfig {
            max_requests: 2,
            window_size: Duration::from_secs(3600),
        });

        assert!(limiter.verify_and_record("/x", "10.0.0.1").await.is_ok());
        assert!(limiter.verify_and_record("/x", "10.0.0.1").await.is_ok());
        assert!(limiter.verify_and_record("/x", "10.0.0.1").await.is_err());
        // A different caller is unaffected.
        assert!(limiter.verify_and_record("/x", "10.0.0.2").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter = SlidingWindowRateLimiter::new(RateLimitConfig {
            max_requests: 1,
            window_size: Duration::from_secs(60),
        });

        assert!(limiter.verify_and_record("/x", "ip").await.is_ok());
        assert!(limiter.verify_and_record("/x", "ip").await.is_err());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.verify_and_record("/x", "ip").await.is_ok());
    }

    #[tokio::test]
    async fn test_pattern_resolution_prefers_longest_prefix() {
        let limiter = SlidingWindowRateLimiter::default();
        limiter
            .set_key_config("/api".to_string(), RateLimitConfig::per_hour(100))
            .await;
        limiter
            .set_key_config("/api/session".to_string(), RateLimitConfig::per_hour(5))
            .await;

        let (pattern, config) = limiter.config_for_path("/api/session/acquire").await;
        assert_eq!(pattern, "/api/session");
        assert_eq!(config.max_requests, 5);

        let (pattern, _) = limiter.config_for_path("/api/other").await;
        assert_eq!(pattern, "/api");
    }
}
