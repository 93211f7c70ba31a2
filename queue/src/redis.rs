use crate::{AckAction, Message, MqBackend};
use async_trait::async_trait;
use common::model::config::RedisConfig;
use deadpool_redis::redis;
use deadpool_redis::redis::{AsyncCommands, FromRedisValue};
use errors::Result;
use errors::error::QueueError;
use log::{debug, error, info, warn};
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tokio::sync::mpsc;

struct StreamRouter {
    routes: HashMap<String, mpsc::Sender<Message>>,
}

/// Redis-streams queue backend. One consumer group per deployment namespace;
/// every process gets a unique consumer name. Unacked entries whose consumer
/// died are reclaimed by the shared claimer after `claim_min_idle`, which is
/// the broker's visibility timeout.
pub struct RedisQueue {
    pool: deadpool_redis::Pool,
    group_id: String,
    consumer_name: String,
    minid_time: u64,
    namespace: String,
    batch_size: usize,
    claim_min_idle: u64,
    claim_count: usize,
    claim_interval: u64,
    router: Arc<RwLock<StreamRouter>>,
    ack_tx: mpsc::Sender<(String, AckAction)>,
}

impl RedisQueue {
    pub fn new(
        redis_config: &RedisConfig,
        minid_time: u64,
        namespace: &str,
        batch_size: usize,
    ) -> Result<Self> {
        let pool = utils::connector::create_redis_pool(
            &redis_config.redis_host,
            redis_config.redis_port,
            redis_config.redis_db,
            &redis_config.redis_username,
            &redis_config.redis_password,
            redis_config.pool_size,
        )
        .ok_or(QueueError::ConnectionFailed)?;

        let consumer_name = uuid::Uuid::new_v4().to_string();
        let group_id = format!("{}:broker_group", namespace);

        let (ack_tx, ack_rx) = mpsc::channel::<(String, AckAction)>(10000);
        let router = Arc::new(RwLock::new(StreamRouter {
            routes: HashMap::new(),
        }));

        let queue = Self {
            pool: pool.clone(),
            group_id: group_id.clone(),
            consumer_name,
            minid_time,
            namespace: namespace.to_string(),
            batch_size,
            claim_min_idle: 60_000,
            claim_count: 100,
            claim_interval: 30_000,
            router,
            ack_tx,
        };

        queue.spawn_ack_processor(pool, group_id, ack_rx);
        queue.spawn_claimer();
        queue.spawn_lag_monitor();
        queue.spawn_listener();

        Ok(queue)
    }

    fn topic_key(&self, topic: &str) -> String {
        format!("{}:{}", self.namespace, topic)
    }

    fn spawn_listener(&self) {
        let pool = self.pool.clone();
        let group_id = self.group_id.clone();
        let consumer_name = self.consumer_name.clone();
        let router = self.router.clone();
        let batch_size = self.batch_size;
        let ack_tx = self.ack_tx.clone();

        tokio::spawn(async move {
            info!(
                "Starting queue listener (group: {}, consumer: {})",
                group_id, consumer_name
            );
            let mut conn: Option<deadpool_redis::Connection> = None;

            loop {
                let routes = {
                    let r = router.read().await;
                    r.routes.clone()
                };

                let keys: Vec<String> = routes.keys().cloned().collect();
                if keys.is_empty() {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
                let ids: Vec<&str> = vec![">"; keys.len()];

                if conn.is_none() {
                    match pool.get().await {
                        Ok(c) => conn = Some(c),
                        Err(e) => {
                            error!("Listener failed to get connection: {}. Retrying...", e);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    }
                }
                let active_conn = match conn.as_mut() {
                    Some(c) => c,
                    None => continue,
                };

                let opts = redis::streams::StreamReadOptions::default()
                    .group(&group_id, &consumer_name)
                    .block(2000)
                    .count(batch_size);

                let result: redis::RedisResult<redis::streams::StreamReadReply> =
                    active_conn.xread_options(&keys, &ids, &opts).await;

                match result {
                    Ok(reply) => {
                        for stream_key in reply.keys {
                            let s_key = stream_key.key;
                            if let Some(sender) = routes.get(&s_key) {
                                for stream_id in stream_key.ids {
                                    let id = stream_id.id.clone();
                                    if let Some(val) = stream_id.map.get("payload")
                                        && let Ok(data) =
                                            Vec::<u8>::from_redis_value(val)
                                    {
                                        let msg = Message::new(
                                            Arc::new(data),
                                            format!("{}@{}", s_key, id),
                                            ack_tx.clone(),
                                        );

                                        counter!("queue_consume_total", "topic" => s_key.clone())
                                            .increment(1);

                                        if sender.send(msg).await.is_err() {
                                            warn!("Subscriber for {} dropped", s_key);
                                        }
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Queue listener read failed: {}. Retrying...", e);
                        conn = None;
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
    }

    fn spawn_ack_processor(
        &self,
        pool: deadpool_redis::Pool,
        group_id: String,
        mut ack_rx: mpsc::Receiver<(String, AckAction)>,
    ) {
        tokio::spawn(async move {
            let mut batches: HashMap<String, Vec<String>> = HashMap::new();
            let mut pending_count: usize = 0;
            let mut interval = tokio::time::interval(Duration::from_millis(100));

            loop {
                tokio::select! {
                    Some((id, action)) = ack_rx.recv() => {
                        let (stream_key, real_id) = match id.split_once('@') {
                            Some((k, i)) => (k.to_string(), i.to_string()),
                            None => {
                                error!("Invalid ID format in ACK: {}", id);
                                continue;
                            }
                        };

                        match action {
                            AckAction::Ack => {
                                batches.entry(stream_key).or_default().push(real_id);
                                pending_count += 1;
                            }
                            AckAction::Nack(reason, payload) => {
                                if let Ok(mut ack_conn) = pool.get().await {
                                    let dlq_key = format!("{}:dlq", stream_key);
                                    // Dead-letter and acknowledge atomically so a
                                    // crash between the two cannot lose the payload.
                                    let script = redis::Script::new(r"
                                        redis.call('XADD', KEYS[3], '*', 'payload', ARGV[1], 'reason', ARGV[2], 'original_id', ARGV[3])
                                        return redis.call('XACK', KEYS[1], KEYS[2], ARGV[3])
                                    ");

                                    let _: () = script
                                        .key(&stream_key)
                                        .key(&group_id)
                                        .key(&dlq_key)
                                        .arg(payload.as_slice())
                                        .arg(&reason)
                                        .arg(&real_id)
                                        .invoke_async(&mut ack_conn)
                                        .await
                                        .map_err(|e| error!("Failed to atomic NACK: {}", e))
                                        .unwrap_or(());

                                    counter!("queue_dlq_total", "topic" => stream_key.clone()).increment(1);
                                }
                            }
                        }

                        if pending_count >= 50
                            && Self::flush_acks(&pool, &group_id, &mut batches).await {
                            pending_count = 0;
                        }
                    }
                    _ = interval.tick() => {
                        if !batches.is_empty()
                            && Self::flush_acks(&pool, &group_id, &mut batches).await {
                            pending_count = 0;
                        }
                    }
                    else => break,
                }
            }
        });
    }

    async fn flush_acks(
        pool: &deadpool_redis::Pool,
        group_id: &str,
        batches: &mut HashMap<String, Vec<String>>,
    ) -> bool {
        if batches.is_empty() {
            return true;
        }

        match pool.get().await {
            Ok(mut ack_conn) => {
                let mut pipeline = redis::pipe();
                let mut count_map = HashMap::new();

                for (s_key, ids) in batches.iter() {
                    if ids.is_empty() {
                        continue;
                    }
                    pipeline.xack(s_key, group_id, ids).ignore();
                    count_map.insert(s_key.clone(), ids.len());
                }

                let result: redis::RedisResult<()> = pipeline.query_async(&mut ack_conn).await;

                match result {
                    Ok(_) => {
                        for (k, v) in count_map {
                            counter!("queue_ack_total", "topic" => k).increment(v as u64);
                        }
                        batches.clear();
                        true
                    }
                    Err(e) => {
                        error!("Failed to flush ACKs: {}", e);
                        // Keep batches, retry next tick.
                        false
                    }
                }
            }
            Err(e) => {
                error!("No Redis connection for ACK flush: {}. Retrying next tick.", e);
                false
            }
        }
    }

    /// Reclaims entries whose consumer went away. Safe to rerun: downstream
    /// consumers deduplicate on their own identity keys.
    fn spawn_claimer(&self) {
        let pool = self.pool.clone();
        let router = self.router.clone();
        let group_id = self.group_id.clone();
        let consumer_name = format!("{}-claimer", self.consumer_name);
        let ack_tx = self.ack_tx.clone();
        let claim_min_idle = self.claim_min_idle;
        let claim_count = self.claim_count;
        let claim_interval = self.claim_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(claim_interval));

            loop {
                interval.tick().await;

                let routes: Vec<(String, mpsc::Sender<Message>)> = {
                    let r = router.read().await;
                    r.routes
                        .iter()
                        .map(|(k, s)| (k.clone(), s.clone()))
                        .collect()
                };

                if routes.is_empty() {
                    continue;
                }

                let mut conn = match pool.get().await {
                    Ok(c) => c,
                    Err(e) => {
                        error!("Claimer connection failed: {}", e);
                        continue;
                    }
                };

                for (topic_key, sender) in routes {
                    loop {
                        let result: redis::RedisResult<(
                            String,
                            Vec<(String, Vec<Vec<u8>>)>,
                            Vec<String>,
                        )> = redis::cmd("XAUTOCLAIM")
                            .arg(topic_key.as_str())
                            .arg(&group_id)
                            .arg(&consumer_name)
                            .arg(claim_min_idle)
                            .arg("0-0")
                            .arg("COUNT")
                            .arg(claim_count)
                            .query_async(&mut conn)
                            .await;

                        match result {
                            Ok((cursor, messages, _deleted)) => {
                                let is_empty = messages.is_empty();
                                if !is_empty {
                                    info!(
                                        "Claimed {} stuck messages from {}",
                                        messages.len(),
                                        topic_key
                                    );
                                    counter!("queue_claim_total", "topic" => topic_key.clone())
                                        .increment(messages.len() as u64);
                                    for (id, fields) in messages {
                                        if let Some(msg) =
                                            Self::parse_message(&topic_key, id, fields, ack_tx.clone())
                                        {
                                            if let Err(e) = sender.send(msg).await {
                                                warn!("Failed to send claimed message: {}", e);
                                            }
                                        }
                                    }
                                }

                                if cursor == "0-0" || is_empty {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("XAUTOCLAIM check failed for {}: {}", topic_key, e);
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    fn spawn_lag_monitor(&self) {
        let pool = self.pool.clone();
        let router = self.router.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(15));
            loop {
                interval.tick().await;

                let topic_keys: Vec<String> = {
                    let r = router.read().await;
                    r.routes.keys().cloned().collect()
                };

                if topic_keys.is_empty() {
                    continue;
                }

                if let Ok(mut conn) = pool.get().await {
                    for t_key in &topic_keys {
                        let len: u64 = redis::cmd("XLEN")
                            .arg(t_key)
                            .query_async(&mut conn)
                            .await
                            .unwrap_or(0);
                        gauge!("queue_len", "topic" => t_key.clone()).set(len as f64);
                        if len > 1000 {
                            warn!("High queue depth for {}: {}", t_key, len);
                        } else if len > 0 {
                            debug!("Queue depth for {}: {}", t_key, len);
                        }
                    }
                }
            }
        });
    }

    fn parse_message(
        topic_key: &str,
        id: String,
        fields: Vec<Vec<u8>>,
        ack_tx: mpsc::Sender<(String, AckAction)>,
    ) -> Option<Message> {
        let mut found_payload = None;

        let mut iter = fields.into_iter();
        while let Some(key) = iter.next() {
            if let Some(val) = iter.next()
                && key == b"payload"
            {
                found_payload = Some(val);
            }
        }

        found_payload.map(|payload| {
            Message::new(
                Arc::new(payload),
                format!("{}@{}", topic_key, id),
                ack_tx,
            )
        })
    }

    fn get_minid_threshold(&self) -> Option<String> {
        if self.minid_time > 0 {
            let retention_ms = (self.minid_time as u128) * 60 * 60 * 1000;
            let now_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_millis();
            let threshold = now_ms.saturating_sub(retention_ms);
            Some(threshold.to_string())
        } else {
            None
        }
    }

    async fn get_connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|_| QueueError::ConnectionFailed.into())
    }
}

#[async_trait]
impl MqBackend for RedisQueue {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let topic_key = self.topic_key(topic);

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&topic_key);

        if let Some(threshold) = self.get_minid_threshold() {
            cmd.arg("MINID").arg("~").arg(threshold);
        }

        cmd.arg("*").arg("payload").arg(payload);

        let _: String = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::PushFailed(Box::new(e)))?;

        counter!("queue_publish_total", "topic" => topic.to_string(), "status" => "success")
            .increment(1);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, sender: mpsc::Sender<Message>) -> Result<()> {
        let topic_key = self.topic_key(topic);
        let group_id = self.group_id.clone();

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|_e| QueueError::ConnectionFailed)?;
        let mut router = self.router.write().await;

        router.routes.insert(topic_key.clone(), sender);

        match conn
            .xgroup_create_mkstream::<&str, &str, &str, ()>(&topic_key, &group_id, "$")
            .await
        {
            Ok(_) => info!("Created consumer group {} for topic {}", group_id, topic_key),
            Err(e) => {
                if e.code() == Some("BUSYGROUP") {
                    // Group already exists, which is fine.
                } else {
                    error!("Failed to create consumer group for {}: {}", topic_key, e);
                }
            }
        }

        Ok(())
    }

    async fn queue_len(&self, topic: &str) -> Result<u64> {
        let mut conn = self.get_connection().await?;
        let len: u64 = redis::cmd("XLEN")
            .arg(self.topic_key(topic))
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::OperationFailed(Box::new(e)))?;
        Ok(len)
    }

    async fn send_to_dlq(&self, topic: &str, id: &str, payload: &[u8], reason: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let dlq_key = format!("{}:dlq", self.topic_key(topic));

        let _: () = redis::cmd("XADD")
            .arg(&dlq_key)
            .arg("*")
            .arg("payload")
            .arg(payload)
            .arg("reason")
            .arg(reason)
            .arg("original_id")
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::PushFailed(Box::new(e)))?;

        counter!("queue_dlq_total", "topic" => topic.to_string()).increment(1);
        Ok(())
    }

    async fn read_dlq(
        &self,
        topic: &str,
        count: usize,
    ) -> Result<Vec<(String, Vec<u8>, String, String)>> {
        let mut conn = self.get_connection().await?;
        let dlq_key = format!("{}:dlq", self.topic_key(topic));

        let result: redis::RedisResult<Vec<(String, HashMap<String, Vec<u8>>)>> =
            redis::cmd("XREVRANGE")
                .arg(&dlq_key)
                .arg("+")
                .arg("-")
                .arg("COUNT")
                .arg(count)
                .query_async(&mut conn)
                .await;

        match result {
            Ok(messages) => {
                let mut output = Vec::new();
                for (id, map) in messages {
                    let payload = map.get("payload").cloned().unwrap_or_default();
                    let reason = String::from_utf8(map.get("reason").cloned().unwrap_or_default())
                        .unwrap_or_else(|_| "Invalid UTF-8".to_string());
                    let original_id =
                        String::from_utf8(map.get("original_id").cloned().unwrap_or_default())
                            .unwrap_or_default();

                    output.push((id, payload, reason, original_id));
                }
                Ok(output)
            }
            Err(e) => {
                warn!("Error reading DLQ {}: {}", dlq_key, e);
                Ok(Vec::new())
            }
        }
    }

    async fn clean_storage(&self) -> Result<()> {
        if self.minid_time == 0 {
            return Ok(());
        }

        let mut conn = self.get_connection().await?;
        let retention_period = self.minid_time as u128 * 60 * 60 * 1000;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis();
        let min_id = now.saturating_sub(retention_period);

        info!(
            "Starting Redis storage cleanup for namespace {}, min_id: {}",
            self.namespace, min_id
        );

        let pattern = format!("{}:*", self.namespace);
        let mut keys: Vec<String> = Vec::new();

        {
            let mut cursor = 0;
            loop {
                let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .cursor_arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(100)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| QueueError::OperationFailed(Box::new(e)))?;

                keys.extend(batch);
                cursor = next_cursor;

                if cursor == 0 {
                    break;
                }
            }
        }

        if keys.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.cmd("TYPE").arg(key);
        }
        let types: Vec<String> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::OperationFailed(Box::new(e)))?;

        let mut trim_pipe = redis::pipe();
        let mut has_trim = false;

        for (key, key_type) in keys.iter().zip(types.iter()) {
            if key_type == "stream" {
                trim_pipe
                    .cmd("XTRIM")
                    .arg(key)
                    .arg("MINID")
                    .arg("~")
                    .arg(min_id.to_string())
                    .ignore();
                has_trim = true;
            }
        }

        if has_trim {
            let _: () = trim_pipe
                .query_async(&mut conn)
                .await
                .map_err(|e| QueueError::OperationFailed(Box::new(e)))?;
        }

        Ok(())
    }
}
