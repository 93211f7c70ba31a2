use crate::analytics::AnalyticsSink;
use crate::api::{ApiState, router};
use crate::orchestrator::Orchestrator;
use crate::registry::ConnectionRegistry;
use cacheable::{CacheService, RedisBackend};
use common::Config;
use errors::Result;
use errors::error::ConfigError;
use log::{error, info};
use queue::{LocalQueue, QueueManager, RedisQueue, ReplyRouter};
use session::{AuthSessionManager, Reaper, TokenStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use store::SeaOrmGateway;
use tokio::sync::{broadcast, watch};
use workers::{
    InferenceWorkerPool, ModelRegistry, PersistWorkerPool, RegexSecretDetector, TemplateModel,
};

/// Backend process assembly: wires the cache, broker, registry, orchestrator
/// and HTTP surface together, runs until shutdown, and tears everything down
/// in reverse initialization order.
///
/// With `[channel_config.redis]` configured the broker spans processes and
/// dedicated worker binaries drain the queues; without it everything runs in
/// process, which is the single-node and development mode.
pub struct Engine {
    config: Config,
    state: ApiState,
    orchestrator: Arc<Orchestrator>,
    broker: Arc<QueueManager>,
    shutdown_tx: broadcast::Sender<()>,
    _pause_tx: watch::Sender<bool>,
}

impl Engine {
    pub async fn build(config: Config) -> Result<Engine> {
        let redis = &config.cache.redis;
        let pool = utils::connector::create_redis_pool(
            &redis.redis_host,
            redis.redis_port,
            redis.redis_db,
            &redis.redis_username,
            &redis.redis_password,
            redis.pool_size,
        )
        .ok_or_else(|| ConfigError::InvalidValue("cache.redis".into(), "unreachable".into()))?;

        let notify_client = utils::connector::create_redis_client(
            &redis.redis_host,
            redis.redis_port,
            redis.redis_db,
            &redis.redis_username,
            &redis.redis_password,
        )
        .ok_or_else(|| ConfigError::InvalidValue("cache.redis".into(), "bad client".into()))?;

        let backend = Arc::new(RedisBackend::new(
            pool.clone(),
            Some(notify_client),
            redis.redis_db as i64,
            config.cache.compression_threshold.unwrap_or(1024),
        ));
        backend.enable_keyspace_notifications().await;
        let cache = Arc::new(CacheService::with_backend(backend, config.name.clone()));
        cache.ping().await.map_err(errors::Error::from)?;

        let tokens = Arc::new(TokenStore::new(Arc::clone(&cache), config.tokens.clone()));

        let db = utils::connector::postgres_connection(
            &config.db.database_host,
            config.db.database_port,
            &config.db.database_name,
            &config.db.database_schema,
            &config.db.database_user,
            &config.db.database_password,
        )
        .await
        .ok_or_else(|| ConfigError::InvalidValue("db".into(), "unreachable".into()))?;
        let gateway = Arc::new(SeaOrmGateway::new(db));

        // Broker: distributed over Redis streams, or in-process channels.
        let distributed = config.channel_config.redis.is_some();
        let broker = if let Some(channel_redis) = &config.channel_config.redis {
            let backend = RedisQueue::new(
                channel_redis,
                config.channel_config.minid_time,
                &config.name,
                64,
            )?;
            Arc::new(QueueManager::new(
                Some(Arc::new(backend)),
                &config.name,
                config.channel_config.capacity,
            ))
        } else {
            let backend = LocalQueue::new(config.channel_config.capacity);
            Arc::new(QueueManager::new(
                Some(backend),
                &config.name,
                config.channel_config.capacity,
            ))
        };
        broker.subscribe();

        let replies = if distributed {
            let reply_client = utils::connector::create_redis_client(
                &redis.redis_host,
                redis.redis_port,
                redis.redis_db,
                &redis.redis_username,
                &redis.redis_password,
            )
            .ok_or_else(|| ConfigError::InvalidValue("cache.redis".into(), "bad client".into()))?;
            ReplyRouter::redis(pool.clone(), reply_client).await?
        } else {
            ReplyRouter::local()
        };

        let registry = Arc::new(ConnectionRegistry::new());
        let manager = Arc::new(AuthSessionManager::new(
            Arc::clone(&tokens),
            gateway.clone(),
            Arc::clone(&broker),
        ));
        manager.set_observer(registry.clone());

        let analytics = AnalyticsSink::new(
            Arc::clone(&broker),
            config.workers.persist_queue_hard_cap as u64,
        );
        let detector = Arc::new(RegexSecretDetector::new());

        let orchestrator = Orchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&manager),
            Arc::clone(&broker),
            Arc::clone(&replies),
            analytics,
            detector.clone(),
            config.orchestrator.clone(),
            config.server_version_id,
        );
        orchestrator.start();

        // The reaper's tasks keep their own handles; nothing to retain here.
        Arc::new(Reaper::new(Arc::clone(&cache), Arc::clone(&manager)))
            .start()
            .await?;

        let (shutdown_tx, _) = broadcast::channel(8);
        let (pause_tx, pause_rx) = watch::channel(false);

        // Single-node mode: drain the queues right here.
        if !distributed {
            let mut models = ModelRegistry::new();
            for model_id in &config.orchestrator.default_model_ids {
                models.register(Arc::new(TemplateModel::new(
                    *model_id,
                    &format!("template-{model_id}"),
                    "return a + b",
                    0.92,
                    Duration::from_millis(40),
                )));
            }
            let models = Arc::new(models);
            if config.workers.preload_models {
                models.warm_all().await?;
            }

            let inference = InferenceWorkerPool::new(
                Arc::clone(&broker),
                Arc::clone(&replies),
                Arc::clone(&tokens),
                models,
                detector,
                config.workers.inference_concurrency,
                config.orchestrator.per_model_timeout_ms,
            );
            inference.start(shutdown_tx.subscribe(), pause_rx.clone());

            let persist = PersistWorkerPool::new(
                Arc::clone(&broker),
                gateway.clone(),
                config.workers.persistence_concurrency,
                config.workers.persistence_max_retries,
                config.workers.persistence_batch_size,
            );
            persist.start(shutdown_tx.subscribe(), pause_rx.clone());
        }

        let state = ApiState {
            orchestrator: Arc::clone(&orchestrator),
            manager: Arc::clone(&manager),
            registry,
            broker: Arc::clone(&broker),
            limiter: Arc::new(utils::rate_limit::SlidingWindowRateLimiter::from_caps(
                config.rate_limits.iter(),
            )),
            orchestrator_config: config.orchestrator.clone(),
            session_ttl: config.tokens.session_token_ttl,
            auth_ttl: config.tokens.auth_token_ttl,
        };

        Ok(Engine {
            config,
            state,
            orchestrator,
            broker,
            shutdown_tx,
            _pause_tx: pause_tx,
        })
    }

    /// Serves until SIGINT, then drains: no new requests, outstanding ones
    /// run to their deadline, worker pools stop, broker storage is trimmed.
    pub async fn run(self) -> Result<()> {
        let port = self.config.api.as_ref().map(|api| api.port).unwrap_or(8008);
        let addr = format!("0.0.0.0:{port}");
        info!("Engine listening on {}", addr);

        let app = router(self.state.clone());
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        let shutdown_orchestrator = Arc::clone(&self.orchestrator);
        let serve = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => error!("Signal handling failed: {}", e),
            }
            shutdown_orchestrator.drain();
        });

        serve.await?;

        // Drain pending requests up to the configured deadline, then tear
        // down in reverse initialization order.
        let deadline = Duration::from_millis(self.config.orchestrator.request_deadline_ms);
        let drain_started = tokio::time::Instant::now();
        while self.orchestrator.pending_len() > 0 && drain_started.elapsed() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let _ = self.shutdown_tx.send(());
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = self.broker.clean_storage().await;
        info!("Engine stopped");
        Ok(())
    }
}
