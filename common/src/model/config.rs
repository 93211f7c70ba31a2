use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Api {
    pub port: u16,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RedisConfig {
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_db: u16,
    pub redis_username: Option<String>,
    pub redis_password: Option<String>,
    pub pool_size: Option<usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PostgresConfig {
    pub database_host: String,
    pub database_port: u16,
    pub database_user: String,
    pub database_password: String,
    pub database_name: String,
    pub database_schema: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CacheConfig {
    pub redis: RedisConfig,
    /// Values larger than this many bytes are compressed before they hit Redis.
    pub compression_threshold: Option<usize>,
}

/// TTLs for the token hierarchy, in seconds.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TokenConfig {
    #[serde(default = "default_auth_ttl")]
    pub auth_token_ttl: u64,
    #[serde(default = "default_session_ttl")]
    pub session_token_ttl: u64,
    #[serde(default = "default_verification_ttl")]
    pub verification_token_ttl: u64,
    #[serde(default = "default_reset_ttl")]
    pub reset_token_ttl: u64,
    /// Expiration hooks fire this many seconds before the token itself dies,
    /// leaving the record readable while the cascade runs.
    #[serde(default = "default_hook_margin")]
    pub hook_margin: u64,
    /// Gates the project-context flush step of the cleanup cascade.
    #[serde(default = "default_true")]
    pub store_multi_file_context_durably: bool,
    /// Change-log entries kept per project before compaction into the base
    /// context map.
    #[serde(default = "default_changelog_cap")]
    pub context_changelog_cap: usize,
}

impl Default for TokenConfig {
    fn default() -> Self {
        TokenConfig {
            auth_token_ttl: default_auth_ttl(),
            session_token_ttl: default_session_ttl(),
            verification_token_ttl: default_verification_ttl(),
            reset_token_ttl: default_reset_ttl(),
            hook_margin: default_hook_margin(),
            store_multi_file_context_durably: true,
            context_changelog_cap: default_changelog_cap(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OrchestratorConfig {
    #[serde(default = "default_request_deadline_ms")]
    pub request_deadline_ms: u64,
    #[serde(default = "default_per_model_timeout_ms")]
    pub per_model_timeout_ms: u64,
    #[serde(default = "default_high_water")]
    pub inference_queue_high_water: usize,
    #[serde(default = "default_low_water")]
    pub inference_queue_low_water: usize,
    #[serde(default)]
    pub default_model_ids: Vec<i64>,
    /// Outbound frames buffered per connection before the registry drops it.
    #[serde(default = "default_sink_capacity")]
    pub connection_sink_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            request_deadline_ms: default_request_deadline_ms(),
            per_model_timeout_ms: default_per_model_timeout_ms(),
            inference_queue_high_water: default_high_water(),
            inference_queue_low_water: default_low_water(),
            default_model_ids: Vec::new(),
            connection_sink_capacity: default_sink_capacity(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_inference_concurrency")]
    pub inference_concurrency: usize,
    #[serde(default = "default_persistence_concurrency")]
    pub persistence_concurrency: usize,
    #[serde(default = "default_persistence_batch_size")]
    pub persistence_batch_size: usize,
    #[serde(default = "default_persistence_max_retries")]
    pub persistence_max_retries: u32,
    /// Beyond this many queued persist tasks the analytics sink starts
    /// sampling instead of enqueueing every envelope.
    #[serde(default = "default_persist_hard_cap")]
    pub persist_queue_hard_cap: usize,
    #[serde(default)]
    pub preload_models: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            inference_concurrency: default_inference_concurrency(),
            persistence_concurrency: default_persistence_concurrency(),
            persistence_batch_size: default_persistence_batch_size(),
            persistence_max_retries: default_persistence_max_retries(),
            persist_queue_hard_cap: default_persist_hard_cap(),
            preload_models: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChannelConfig {
    pub redis: Option<RedisConfig>,
    /// Stream retention window in hours; 0 disables trimming.
    #[serde(default)]
    pub minid_time: u64,
    #[serde(default = "default_channel_capacity")]
    pub capacity: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoggerConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub dir: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub name: String,
    pub db: PostgresConfig,
    pub cache: CacheConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    pub channel_config: ChannelConfig,
    pub api: Option<Api>,
    pub logger: Option<LoggerConfig>,
    /// Endpoint pattern -> allowed requests per IP per hour.
    #[serde(default)]
    pub rate_limits: BTreeMap<String, u32>,
    pub server_version_id: Option<i64>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self, String> {
        let config_str = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        let config: Config = toml::from_str(&config_str).map_err(|e| e.to_string())?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.tokens.session_token_ttl <= self.tokens.hook_margin {
            return Err("session_token_ttl must exceed hook_margin".to_string());
        }
        if self.tokens.auth_token_ttl <= self.tokens.hook_margin {
            return Err("auth_token_ttl must exceed hook_margin".to_string());
        }
        if self.orchestrator.per_model_timeout_ms >= self.orchestrator.request_deadline_ms {
            return Err("per_model_timeout_ms must be below request_deadline_ms".to_string());
        }
        if self.orchestrator.inference_queue_low_water > self.orchestrator.inference_queue_high_water
        {
            return Err("inference_queue_low_water above high water".to_string());
        }
        Ok(())
    }
}

fn default_auth_ttl() -> u64 {
    86_400
}
fn default_session_ttl() -> u64 {
    3_600
}
fn default_verification_ttl() -> u64 {
    86_400
}
fn default_reset_ttl() -> u64 {
    900
}
fn default_hook_margin() -> u64 {
    60
}
fn default_changelog_cap() -> usize {
    256
}
fn default_request_deadline_ms() -> u64 {
    10_000
}
fn default_per_model_timeout_ms() -> u64 {
    8_000
}
fn default_high_water() -> usize {
    256
}
fn default_low_water() -> usize {
    128
}
fn default_sink_capacity() -> usize {
    256
}
fn default_inference_concurrency() -> usize {
    4
}
fn default_persistence_concurrency() -> usize {
    8
}
fn default_persistence_batch_size() -> usize {
    64
}
fn default_persistence_max_retries() -> u32 {
    5
}
fn default_persist_hard_cap() -> usize {
    100_000
}
fn default_channel_capacity() -> usize {
    10_000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn sample_config() -> &'static str {
        r#"
            name = "tandem"

            [db]
            database_host = "localhost"
            database_port = 5432
            database_user = "tandem"
            database_password = "tandem"
            database_name = "tandem"
            database_schema = "public"

            [cache.redis]
            redis_host = "localhost"
            redis_port = 6379
            redis_db = 0

            [tokens]
            auth_token_ttl = 86400
            session_token_ttl = 3600
            reset_token_ttl = 900

            [orchestrator]
            request_deadline_ms = 10000
            per_model_timeout_ms = 8000
            default_model_ids = [1, 2]

            [workers]
            persistence_batch_size = 32
            preload_models = true

            [channel_config]
            minid_time = 0
            capacity = 1000

            [api]
            port = 8008

            [rate_limits]
            "/api/session" = 120
            "/ws" = 600
        "#
    }

    #[test]
    fn test_load_config_success() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", sample_config()).unwrap();

        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.name, "tandem");
        assert_eq!(config.tokens.auth_token_ttl, 86_400);
        assert_eq!(config.orchestrator.default_model_ids, vec![1, 2]);
        assert_eq!(config.workers.persistence_batch_size, 32);
        assert!(config.workers.preload_models);
        assert_eq!(config.rate_limits.get("/ws"), Some(&600));
    }

    #[test]
    fn test_load_config_not_found() {
        assert!(Config::load("non_existent_file.toml").is_err());
    }

    #[test]
    fn test_validation_rejects_inverted_watermarks() {
        let mut file = NamedTempFile::new().unwrap();
        let bad = sample_config().replace(
            "default_model_ids = [1, 2]",
            "default_model_ids = [1]\ninference_queue_high_water = 10\ninference_queue_low_water = 20",
        );
        write!(file, "{}", bad).unwrap();
        assert!(Config::load(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_validation_rejects_model_timeout_above_deadline() {
        let mut file = NamedTempFile::new().unwrap();
        let bad = sample_config().replace(
            "per_model_timeout_ms = 8000",
            "per_model_timeout_ms = 12000",
        );
        write!(file, "{}", bad).unwrap();
        assert!(Config::load(file.path().to_str().unwrap()).is_err());
    }
}
