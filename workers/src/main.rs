use cacheable::CacheService;
use common::Config;
use log::{error, info};
use queue::{QueueManager, RedisQueue, ReplyRouter};
use session::TokenStore;
use std::sync::Arc;
use std::time::Duration;
use store::SeaOrmGateway;
use tokio::sync::{broadcast, watch};
use workers::{InferenceWorkerPool, ModelRegistry, PersistWorkerPool, RegexSecretDetector, TemplateModel};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config {config_path}: {e}");
            std::process::exit(1);
        }
    };

    let logger = config.logger.clone().unwrap_or(common::model::config::LoggerConfig {
        level: "info".to_string(),
        dir: None,
    });
    utils::logger::init_logger(&logger.level, logger.dir.as_deref());
    info!("Starting tandem worker ({})", config.name);

    // Session cache, for task revalidation.
    let redis = &config.cache.redis;
    let pool = utils::connector::create_redis_pool(
        &redis.redis_host,
        redis.redis_port,
        redis.redis_db,
        &redis.redis_username,
        &redis.redis_password,
        redis.pool_size,
    )
    .expect("redis pool");
    let cache = Arc::new(CacheService::new(
        Some(pool.clone()),
        None,
        redis.redis_db as i64,
        config.name.clone(),
        config.cache.compression_threshold,
    ));
    let tokens = Arc::new(TokenStore::new(cache, config.tokens.clone()));

    // Broker over Redis streams plus the reply publisher.
    let channel_redis = config
        .channel_config
        .redis
        .clone()
        .unwrap_or_else(|| redis.clone());
    let backend = RedisQueue::new(
        &channel_redis,
        config.channel_config.minid_time,
        &config.name,
        64,
    )
    .expect("queue backend");
    let broker = Arc::new(QueueManager::new(
        Some(Arc::new(backend)),
        &config.name,
        config.channel_config.capacity,
    ));
    broker.subscribe();

    let reply_client = utils::connector::create_redis_client(
        &channel_redis.redis_host,
        channel_redis.redis_port,
        channel_redis.redis_db,
        &channel_redis.redis_username,
        &channel_redis.redis_password,
    )
    .expect("redis client");
    let replies = ReplyRouter::redis(pool, reply_client)
        .await
        .expect("reply router");

    // Durable store.
    let db = utils::connector::postgres_connection(
        &config.db.database_host,
        config.db.database_port,
        &config.db.database_name,
        &config.db.database_schema,
        &config.db.database_user,
        &config.db.database_password,
    )
    .await
    .expect("postgres connection");
    let gateway = Arc::new(SeaOrmGateway::new(db));

    // Model table. Real deployments register their serving backends here;
    // the template models keep a bare checkout usable end to end.
    let mut registry = ModelRegistry::new();
    for model_id in &config.orchestrator.default_model_ids {
        registry.register(Arc::new(TemplateModel::new(
            *model_id,
            &format!("template-{model_id}"),
            "return a + b",
            0.92,
            Duration::from_millis(40),
        )));
    }
    let registry = Arc::new(registry);

    if config.workers.preload_models {
        if let Err(e) = registry.warm_all().await {
            error!("Model warm-up failed: {}", e);
            std::process::exit(1);
        }
    }

    let (shutdown_tx, _) = broadcast::channel(4);
    let (_pause_tx, pause_rx) = watch::channel(false);

    let inference = InferenceWorkerPool::new(
        Arc::clone(&broker),
        replies,
        tokens,
        registry,
        Arc::new(RegexSecretDetector::new()),
        config.workers.inference_concurrency,
        config.orchestrator.per_model_timeout_ms,
    );
    inference.start(shutdown_tx.subscribe(), pause_rx.clone());

    let persist = PersistWorkerPool::new(
        Arc::clone(&broker),
        gateway,
        config.workers.persistence_concurrency,
        config.workers.persistence_max_retries,
        config.workers.persistence_batch_size,
    );
    persist.start(shutdown_tx.subscribe(), pause_rx);

    info!("Worker pools running; waiting for shutdown signal");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, draining"),
        Err(e) => error!("Signal handling failed: {}", e),
    }
    let _ = shutdown_tx.send(());
    // Give in-flight tasks a moment to settle their acks.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let _ = broker.clean_storage().await;
    info!("Worker stopped");
}
