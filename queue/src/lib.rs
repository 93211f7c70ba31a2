pub mod channel;
pub mod local;
pub mod manager;
pub mod redis;
pub mod reply;

#[cfg(test)]
mod tests;

pub use crate::channel::{Channel, QueuedItem};
pub use crate::local::LocalQueue;
pub use crate::manager::QueueManager;
pub use crate::redis::RedisQueue;
pub use crate::reply::ReplyRouter;

use async_trait::async_trait;
use common::model::task::{InferenceTask, PersistTask};
use errors::Result;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Acknowledgement outcome reported back to the backend once a consumer is
/// done with a message.
#[derive(Debug, Clone)]
pub enum AckAction {
    Ack,
    /// Dead-letters the payload with a reason.
    Nack(String, Vec<u8>),
}

/// A message claimed from a queue. The consumer MUST settle it with `ack()`
/// or `nack()`; an unsettled message is redelivered to another consumer once
/// its visibility window lapses.
#[derive(Clone)]
pub struct Message {
    pub payload: Arc<Vec<u8>>,
    pub id: String,
    ack_tx: mpsc::Sender<(String, AckAction)>,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message").field("id", &self.id).finish()
    }
}

impl Message {
    pub fn new(
        payload: Arc<Vec<u8>>,
        id: String,
        ack_tx: mpsc::Sender<(String, AckAction)>,
    ) -> Self {
        Message {
            payload,
            id,
            ack_tx,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.ack_tx
            .send((self.id.clone(), AckAction::Ack))
            .await
            .map_err(|_| {
                errors::QueueError::OperationFailed("failed to send ACK signal".into()).into()
            })
    }

    pub async fn nack(&self, reason: &str) -> Result<()> {
        self.ack_tx
            .send((
                self.id.clone(),
                AckAction::Nack(reason.to_string(), self.payload.as_ref().clone()),
            ))
            .await
            .map_err(|_| {
                errors::QueueError::OperationFailed("failed to send NACK signal".into()).into()
            })
    }
}

/// Queue backend seam. Two implementations: Redis streams with consumer
/// groups (multi-process) and an in-process channel variant (tests, single
/// node).
#[async_trait]
pub trait MqBackend: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;
    async fn subscribe(&self, topic: &str, sender: mpsc::Sender<Message>) -> Result<()>;
    /// Current number of entries on the topic, best effort.
    async fn queue_len(&self, topic: &str) -> Result<u64>;
    async fn send_to_dlq(&self, topic: &str, id: &str, payload: &[u8], reason: &str) -> Result<()>;
    /// Most recent dead-lettered entries: (entry id, payload, reason,
    /// original id).
    async fn read_dlq(
        &self,
        topic: &str,
        count: usize,
    ) -> Result<Vec<(String, Vec<u8>, String, String)>>;
    async fn clean_storage(&self) -> Result<()>;
}

/// Anything the queues can log and correlate by id.
pub trait Identifiable {
    fn get_id(&self) -> String;
}

impl Identifiable for InferenceTask {
    fn get_id(&self) -> String {
        self.id.to_string()
    }
}

impl Identifiable for PersistTask {
    fn get_id(&self) -> String {
        self.task_id()
    }
}
