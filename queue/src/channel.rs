use crate::Message;
use common::model::task::{InferenceTask, PersistTask};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::sync::mpsc::{Receiver, Sender, channel};

/// Work item flowing through a local queue, optionally carrying the broker
/// message it came from. Consumers settle the broker message only after the
/// item is fully processed so the visibility window can redeliver on crash.
pub struct QueuedItem<T> {
    pub item: T,
    message: Option<Message>,
}

impl<T: crate::Identifiable> crate::Identifiable for QueuedItem<T> {
    fn get_id(&self) -> String {
        self.item.get_id()
    }
}

impl<T> QueuedItem<T> {
    pub fn new(item: T) -> Self {
        QueuedItem {
            item,
            message: None,
        }
    }

    pub fn from_message(item: T, message: Message) -> Self {
        QueuedItem {
            item,
            message: Some(message),
        }
    }

    pub async fn ack(&self) {
        if let Some(message) = &self.message {
            if let Err(e) = message.ack().await {
                log::warn!("Failed to ack {}: {}", message.id, e);
            }
        }
    }

    pub async fn nack(&self, reason: &str) {
        if let Some(message) = &self.message {
            if let Err(e) = message.nack(reason).await {
                log::warn!("Failed to nack {}: {}", message.id, e);
            }
        }
    }
}

/// The broker's two work queues as in-process channels.
///
/// Flow:
/// 1. Inference: orchestrator -> inference worker pool.
/// 2. Persist: orchestrator and inference workers -> persistence pool.
///
/// When a distributed backend is configured, the senders feed the backend and
/// the receivers are fed from backend subscriptions; without one, the
/// channels short-circuit in process.
pub struct Channel {
    pub inference_sender: Sender<QueuedItem<InferenceTask>>,
    pub inference_receiver: Arc<Mutex<Receiver<QueuedItem<InferenceTask>>>>,

    pub persist_sender: Sender<QueuedItem<PersistTask>>,
    pub persist_receiver: Arc<Mutex<Receiver<QueuedItem<PersistTask>>>>,

    capacity: usize,
}

impl Channel {
    pub fn new(capacity: usize) -> Self {
        let effective_capacity = capacity.max(1024);

        let (inference_sender, inference_receiver) = channel(effective_capacity);
        let (persist_sender, persist_receiver) = channel(effective_capacity);

        Channel {
            inference_sender,
            inference_receiver: Arc::new(Mutex::new(inference_receiver)),
            persist_sender,
            persist_receiver: Arc::new(Mutex::new(persist_receiver)),
            capacity: effective_capacity,
        }
    }

    /// Entries currently buffered on the inference channel.
    pub fn inference_depth(&self) -> usize {
        self.capacity - self.inference_sender.capacity()
    }

    pub fn persist_depth(&self) -> usize {
        self.capacity - self.persist_sender.capacity()
    }
}

impl Clone for Channel {
    fn clone(&self) -> Self {
        Channel {
            inference_sender: self.inference_sender.clone(),
            inference_receiver: self.inference_receiver.clone(),
            persist_sender: self.persist_sender.clone(),
            persist_receiver: self.persist_receiver.clone(),
            capacity: self.capacity,
        }
    }
}
