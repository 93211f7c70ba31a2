use common::model::task::ReplyEnvelope;
use dashmap::DashMap;
use errors::Result;
use errors::error::QueueError;
use futures::StreamExt;
use log::{debug, error, info, warn};
use metrics::counter;
use std::sync::Arc;
use tokio::sync::mpsc;

enum ReplyControl {
    Subscribe(String),
    Unsubscribe(String),
}

enum Mode {
    Local,
    Redis {
        pool: deadpool_redis::Pool,
        control: mpsc::Sender<ReplyControl>,
    },
}

/// Routes reply envelopes to the connection that owns them. Channels are
/// named `conn:<connection-id>`; a process subscribes only to channels for
/// connections it registered, so replies have natural affinity. Envelopes for
/// channels nobody owns locally are dropped, never retried.
pub struct ReplyRouter {
    routes: Arc<DashMap<String, mpsc::Sender<ReplyEnvelope>>>,
    mode: Mode,
}

impl ReplyRouter {
    /// Single-process router: publish goes straight to the local route table.
    pub fn local() -> Arc<Self> {
        Arc::new(Self {
            routes: Arc::new(DashMap::new()),
            mode: Mode::Local,
        })
    }

    /// Cross-process router over Redis pub/sub. `client` holds the dedicated
    /// subscriber connection; `pool` serves the publish side.
    pub async fn redis(
        pool: deadpool_redis::Pool,
        client: deadpool_redis::redis::Client,
    ) -> Result<Arc<Self>> {
        let routes: Arc<DashMap<String, mpsc::Sender<ReplyEnvelope>>> = Arc::new(DashMap::new());
        let (control_tx, mut control_rx) = mpsc::channel::<ReplyControl>(1024);

        let pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| QueueError::OperationFailed(Box::new(e)))?;
        let (mut sink, mut stream) = pubsub.split();

        let task_routes = Arc::clone(&routes);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(ctrl) = control_rx.recv() => {
                        let result = match &ctrl {
                            ReplyControl::Subscribe(channel) => sink.subscribe(channel).await,
                            ReplyControl::Unsubscribe(channel) => sink.unsubscribe(channel).await,
                        };
                        if let Err(e) = result {
                            error!("Reply channel subscription change failed: {}", e);
                        }
                    }
                    msg = stream.next() => {
                        let Some(msg) = msg else {
                            info!("Reply subscription stream closed");
                            break;
                        };
                        let channel = msg.get_channel_name().to_string();
                        let payload: Vec<u8> = match msg.get_payload() {
                            Ok(p) => p,
                            Err(e) => {
                                error!("Malformed reply payload on {}: {}", channel, e);
                                continue;
                            }
                        };
                        Self::dispatch(&task_routes, &channel, &payload);
                    }
                    else => break,
                }
            }
        });

        Ok(Arc::new(Self {
            routes,
            mode: Mode::Redis {
                pool,
                control: control_tx,
            },
        }))
    }

    fn dispatch(
        routes: &DashMap<String, mpsc::Sender<ReplyEnvelope>>,
        channel: &str,
        payload: &[u8],
    ) {
        let envelope: ReplyEnvelope = match serde_json::from_slice(payload) {
            Ok(e) => e,
            Err(e) => {
                error!("Undecodable reply envelope on {}: {}", channel, e);
                return;
            }
        };

        match routes.get(channel) {
            Some(sender) => {
                if sender.try_send(envelope).is_err() {
                    warn!("Reply listener for {} saturated, dropping envelope", channel);
                    counter!("reply_dropped_total", "cause" => "saturated").increment(1);
                }
            }
            None => {
                // Not one of ours; another process owns this connection.
                debug!("Dropping reply for unowned channel {}", channel);
                counter!("reply_dropped_total", "cause" => "unowned").increment(1);
            }
        }
    }

    /// Claims a reply channel for a locally owned connection.
    pub async fn register(&self, channel: &str) -> mpsc::Receiver<ReplyEnvelope> {
        let (tx, rx) = mpsc::channel(256);
        self.routes.insert(channel.to_string(), tx);

        if let Mode::Redis { control, .. } = &self.mode {
            if control
                .send(ReplyControl::Subscribe(channel.to_string()))
                .await
                .is_err()
            {
                error!("Reply control channel closed; {} not subscribed", channel);
            }
        }

        rx
    }

    pub async fn unregister(&self, channel: &str) {
        self.routes.remove(channel);

        if let Mode::Redis { control, .. } = &self.mode {
            if control
                .send(ReplyControl::Unsubscribe(channel.to_string()))
                .await
                .is_err()
            {
                error!("Reply control channel closed during unsubscribe");
            }
        }
    }

    /// Publishes one envelope to a reply channel. Used by workers; in local
    /// mode this is a direct route-table delivery.
    pub async fn publish(&self, channel: &str, envelope: &ReplyEnvelope) -> Result<()> {
        counter!("reply_publish_total").increment(1);
        match &self.mode {
            Mode::Local => {
                let payload = serde_json::to_vec(envelope)?;
                Self::dispatch(&self.routes, channel, &payload);
                Ok(())
            }
            Mode::Redis { pool, .. } => {
                let payload = serde_json::to_vec(envelope)?;
                let mut conn = pool
                    .get()
                    .await
                    .map_err(|_| QueueError::ConnectionFailed)?;
                let _: () = deadpool_redis::redis::cmd("PUBLISH")
                    .arg(channel)
                    .arg(payload)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| QueueError::PushFailed(Box::new(e)))?;
                Ok(())
            }
        }
    }
}
