use crate::channel::{Channel, QueuedItem};
use crate::{Identifiable, MqBackend};
use common::model::task::{InferenceTask, PersistTask, TopicType};
use errors::Result;
use log::{debug, error};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::sync::mpsc::{Receiver, Sender};

/// Typed facade over the two work queues. Producers call the `enqueue_*`
/// verbs; the worker pools drain the matching receivers. With a backend
/// configured, enqueues publish to the backend and subscriptions feed the
/// local channels; otherwise everything stays in process.
pub struct QueueManager {
    pub channel: Arc<Channel>,
    pub backend: Option<Arc<dyn MqBackend>>,
    name: String,
}

impl QueueManager {
    pub fn new(backend: Option<Arc<dyn MqBackend>>, name: &str, capacity: usize) -> Self {
        QueueManager {
            channel: Arc::new(Channel::new(capacity)),
            backend,
            name: name.to_string(),
        }
    }

    fn topic(&self, topic_type: TopicType) -> String {
        topic_type.get_name(&self.name)
    }

    /// Wires backend subscriptions into the local channels. Call once at
    /// startup on processes that consume tasks.
    pub fn subscribe(&self) {
        if let Some(backend) = &self.backend {
            let backend = backend.clone();
            let channel = self.channel.clone();
            let inference_topic = self.topic(TopicType::Inference);
            let persist_topic = self.topic(TopicType::Persist);

            tokio::spawn(async move {
                Self::subscribe_topic::<InferenceTask>(
                    &inference_topic,
                    channel.inference_sender.clone(),
                    backend.clone(),
                )
                .await;
                Self::subscribe_topic::<PersistTask>(
                    &persist_topic,
                    channel.persist_sender.clone(),
                    backend.clone(),
                )
                .await;
            });
        }
    }

    async fn subscribe_topic<T>(topic: &str, sender: Sender<QueuedItem<T>>, backend: Arc<dyn MqBackend>)
    where
        T: DeserializeOwned + Send + 'static + Identifiable,
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel(1024);
        if let Err(e) = backend.subscribe(topic, tx).await {
            error!("Failed to subscribe to topic {}: {}", topic, e);
            return;
        }

        let topic = topic.to_string();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match serde_json::from_slice::<T>(&msg.payload) {
                    Ok(item) => {
                        debug!(
                            "[QueueManager] received: topic={} id={}",
                            topic,
                            item.get_id()
                        );
                        // The consumer settles the message after processing;
                        // a crash before that leaves it for the claimer.
                        let queued = QueuedItem::from_message(item, msg);
                        if sender.send(queued).await.is_err() {
                            error!("Local channel for {} closed", topic);
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Failed to deserialize message from topic {}: {}", topic, e);
                        let _ = msg.nack("deserialize failure").await;
                    }
                }
            }
            log::warn!("Topic {} subscription closed", topic);
        });
    }

    async fn enqueue<T>(&self, topic_type: TopicType, sender: &Sender<QueuedItem<T>>, item: T) -> Result<()>
    where
        T: Serialize + Identifiable + Send + 'static,
    {
        match &self.backend {
            Some(backend) => {
                let payload = serde_json::to_vec(&item)?;
                backend.publish(&self.topic(topic_type), &payload).await
            }
            None => sender
                .send(QueuedItem::new(item))
                .await
                .map_err(|e| errors::QueueError::PushFailed(e.to_string().into()).into()),
        }
    }

    pub async fn enqueue_inference(&self, task: InferenceTask) -> Result<()> {
        debug!("[QueueManager] enqueue inference id={}", task.get_id());
        self.enqueue(TopicType::Inference, &self.channel.inference_sender, task)
            .await
    }

    pub async fn enqueue_persist(&self, task: PersistTask) -> Result<()> {
        debug!("[QueueManager] enqueue persist id={}", task.get_id());
        self.enqueue(TopicType::Persist, &self.channel.persist_sender, task)
            .await
    }

    pub fn inference_receiver(&self) -> Arc<Mutex<Receiver<QueuedItem<InferenceTask>>>> {
        Arc::clone(&self.channel.inference_receiver)
    }

    pub fn persist_receiver(&self) -> Arc<Mutex<Receiver<QueuedItem<PersistTask>>>> {
        Arc::clone(&self.channel.persist_receiver)
    }

    pub async fn inference_depth(&self) -> u64 {
        match &self.backend {
            Some(backend) => backend
                .queue_len(&self.topic(TopicType::Inference))
                .await
                .unwrap_or(0),
            None => self.channel.inference_depth() as u64,
        }
    }

    pub async fn persist_depth(&self) -> u64 {
        match &self.backend {
            Some(backend) => backend
                .queue_len(&self.topic(TopicType::Persist))
                .await
                .unwrap_or(0),
            None => self.channel.persist_depth() as u64,
        }
    }

    pub async fn read_persist_dlq(
        &self,
        count: usize,
    ) -> Result<Vec<(String, Vec<u8>, String, String)>> {
        match &self.backend {
            Some(backend) => backend.read_dlq(&self.topic(TopicType::Persist), count).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn clean_storage(&self) -> Result<()> {
        if let Some(backend) = &self.backend {
            backend.clean_storage().await?;
        }
        Ok(())
    }
}
