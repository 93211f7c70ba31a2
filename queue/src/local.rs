use crate::{AckAction, Message, MqBackend};
use async_trait::async_trait;
use errors::Result;
use errors::error::QueueError;
use log::warn;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};

struct TopicState {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Option<mpsc::Receiver<Vec<u8>>>,
    depth: Arc<AtomicU64>,
}

/// In-process queue backend. Single-node deployments and tests run against
/// this; semantics mirror the Redis backend minus cross-process visibility
/// (an unacked message dies with the process, which is fine locally).
pub struct LocalQueue {
    topics: Mutex<HashMap<String, TopicState>>,
    dlq: Mutex<HashMap<String, Vec<(String, Vec<u8>, String, String)>>>,
    capacity: usize,
    ack_tx: mpsc::Sender<(String, AckAction)>,
}

impl LocalQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (ack_tx, ack_rx) = mpsc::channel::<(String, AckAction)>(10_000);
        let queue = Arc::new(Self {
            topics: Mutex::new(HashMap::new()),
            dlq: Mutex::new(HashMap::new()),
            capacity,
            ack_tx,
        });
        queue.clone().spawn_ack_drain(ack_rx);
        queue
    }

    fn spawn_ack_drain(self: Arc<Self>, mut ack_rx: mpsc::Receiver<(String, AckAction)>) {
        tokio::spawn(async move {
            while let Some((id, action)) = ack_rx.recv().await {
                if let AckAction::Nack(reason, payload) = action {
                    let topic = id.split_once('@').map(|(t, _)| t).unwrap_or("unknown");
                    let mut dlq = self.dlq.lock().await;
                    dlq.entry(topic.to_string())
                        .or_default()
                        .push((id.clone(), payload, reason, id));
                }
            }
        });
    }

    async fn state_tx(&self, topic: &str) -> (mpsc::Sender<Vec<u8>>, Arc<AtomicU64>) {
        let mut topics = self.topics.lock().await;
        let state = topics.entry(topic.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(self.capacity);
            TopicState {
                tx,
                rx: Some(rx),
                depth: Arc::new(AtomicU64::new(0)),
            }
        });
        (state.tx.clone(), state.depth.clone())
    }
}

#[async_trait]
impl MqBackend for LocalQueue {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let (tx, depth) = self.state_tx(topic).await;
        tx.send(payload.to_vec())
            .await
            .map_err(|e| QueueError::PushFailed(Box::new(e)))?;
        depth.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, sender: mpsc::Sender<Message>) -> Result<()> {
        let (rx, depth) = {
            let mut topics = self.topics.lock().await;
            let state = topics.entry(topic.to_string()).or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.capacity);
                TopicState {
                    tx,
                    rx: Some(rx),
                    depth: Arc::new(AtomicU64::new(0)),
                }
            });
            (
                state.rx.take().ok_or_else(|| {
                    QueueError::OperationFailed(
                        format!("topic {topic} already has a subscriber").into(),
                    )
                })?,
                state.depth.clone(),
            )
        };

        let topic = topic.to_string();
        let ack_tx = self.ack_tx.clone();
        tokio::spawn(async move {
            let mut rx = rx;
            let mut seq: u64 = 0;
            while let Some(payload) = rx.recv().await {
                depth.fetch_sub(1, Ordering::Relaxed);
                seq += 1;
                let msg = Message::new(
                    Arc::new(payload),
                    format!("{}@{}", topic, seq),
                    ack_tx.clone(),
                );
                if sender.send(msg).await.is_err() {
                    warn!("Subscriber for {} dropped", topic);
                    break;
                }
            }
        });

        Ok(())
    }

    async fn queue_len(&self, topic: &str) -> Result<u64> {
        let topics = self.topics.lock().await;
        Ok(topics
            .get(topic)
            .map(|s| s.depth.load(Ordering::Relaxed))
            .unwrap_or(0))
    }

    async fn send_to_dlq(&self, topic: &str, id: &str, payload: &[u8], reason: &str) -> Result<()> {
        let mut dlq = self.dlq.lock().await;
        dlq.entry(topic.to_string()).or_default().push((
            id.to_string(),
            payload.to_vec(),
            reason.to_string(),
            id.to_string(),
        ));
        Ok(())
    }

    async fn read_dlq(
        &self,
        topic: &str,
        count: usize,
    ) -> Result<Vec<(String, Vec<u8>, String, String)>> {
        let dlq = self.dlq.lock().await;
        Ok(dlq
            .get(topic)
            .map(|entries| entries.iter().rev().take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn clean_storage(&self) -> Result<()> {
        Ok(())
    }
}
