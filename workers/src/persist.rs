use crate::runner::ProcessorRunner;
use common::interface::PersistenceGateway;
use common::model::frame::{BehavioralTelemetry, ContextualTelemetry};
use common::model::task::PersistTask;
use errors::error::PersistError;
use errors::Result;
use log::{error, info, warn};
use metrics::counter;
use queue::channel::QueuedItem;
use queue::QueueManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use utils::batch_buffer::BatchBuffer;
use uuid::Uuid;

type TelemetryItem = (Uuid, Option<ContextualTelemetry>, Option<BehavioralTelemetry>);

/// Drains the persist queue into the gateway. Write order inside one task is
/// fixed (query, then generations, then ground truth); transient failures
/// back off and retry up to the configured budget, permanent failures
/// dead-letter with the payload preserved. Standalone telemetry envelopes are
/// coalesced through a batch buffer instead of hitting the store one by one.
pub struct PersistWorkerPool {
    broker: Arc<QueueManager>,
    gateway: Arc<dyn PersistenceGateway>,
    telemetry_batch: BatchBuffer<TelemetryItem>,
    concurrency: usize,
    max_retries: u32,
}

impl PersistWorkerPool {
    pub fn new(
        broker: Arc<QueueManager>,
        gateway: Arc<dyn PersistenceGateway>,
        concurrency: usize,
        max_retries: u32,
        batch_size: usize,
    ) -> Arc<Self> {
        let batch_gateway = Arc::clone(&gateway);
        let telemetry_batch = BatchBuffer::new(
            batch_size.max(1) * 4,
            batch_size.max(1),
            Duration::from_millis(500),
            move |items: Vec<TelemetryItem>| {
                let gateway = Arc::clone(&batch_gateway);
                async move {
                    for (request_id, contextual, behavioral) in items {
                        if let Err(e) = gateway
                            .upsert_telemetry(request_id, contextual.as_ref(), behavioral.as_ref())
                            .await
                        {
                            // Analytics rows are droppable by contract.
                            warn!("Telemetry batch write failed for {}: {}", request_id, e);
                            counter!("persist_telemetry_dropped_total").increment(1);
                        }
                    }
                }
            },
        );

        Arc::new(Self {
            broker,
            gateway,
            telemetry_batch,
            concurrency,
            max_retries,
        })
    }

    pub fn start(
        self: Arc<Self>,
        shutdown_rx: broadcast::Receiver<()>,
        pause_rx: watch::Receiver<bool>,
    ) {
        let runner = ProcessorRunner::new("Persist", shutdown_rx, pause_rx, self.concurrency);
        let receiver = self.broker.persist_receiver();
        let pool = Arc::clone(&self);

        tokio::spawn(async move {
            runner
                .run(receiver, move |queued: QueuedItem<PersistTask>| {
                    let pool = Arc::clone(&pool);
                    async move {
                        pool.handle(queued).await;
                    }
                })
                .await;
        });
    }

    pub async fn handle(&self, queued: QueuedItem<PersistTask>) {
        let task_id = queued.item.task_id();

        // Telemetry envelopes go through the batch buffer and are settled on
        // hand-off; the fire-and-forget contract tolerates a lost batch.
        if let PersistTask::Telemetry {
            request_id,
            contextual,
            behavioral,
            ..
        } = &queued.item
        {
            let _ = self
                .telemetry_batch
                .add((*request_id, contextual.clone(), behavioral.clone()))
                .await;
            queued.ack().await;
            return;
        }

        for attempt in 0..=self.max_retries {
            match self.write(&queued.item).await {
                Ok(()) => {
                    counter!("persist_task_total", "outcome" => "ok").increment(1);
                    queued.ack().await;
                    return;
                }
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    warn!(
                        "Transient persist failure for {} (attempt {}): {}",
                        task_id,
                        attempt + 1,
                        e
                    );
                    let backoff = Duration::from_millis(100 * (1u64 << attempt.min(6)));
                    tokio::time::sleep(backoff).await;
                }
                Err(e) if e.is_transient() => {
                    error!(
                        "Persist retries exhausted for {}: {}",
                        task_id,
                        PersistError::RetriesExhausted(self.max_retries)
                    );
                    counter!("persist_task_total", "outcome" => "exhausted").increment(1);
                    queued.nack(&format!("retries exhausted: {e}")).await;
                    return;
                }
                Err(e) => {
                    // Schema or referential failure: no retry will fix it.
                    error!("Fatal persist failure for {}: {}", task_id, e);
                    counter!("persist_task_total", "outcome" => "fatal").increment(1);
                    queued.nack(&e.to_string()).await;
                    return;
                }
            }
        }
    }

    /// One task's writes in causal order. Every gateway verb is idempotent on
    /// its identity key, so redelivery after a partial write is safe.
    async fn write(&self, task: &PersistTask) -> Result<()> {
        match task {
            PersistTask::Query { meta, generations } => {
                self.gateway.create_meta_query(meta).await?;
                for generation in generations {
                    let inserted = self.gateway.create_generation(generation).await?;
                    if !inserted {
                        info!(
                            "Generation ({}, {}) already persisted, skipping",
                            generation.request_id, generation.model_id
                        );
                        counter!("persist_generation_dedup_total").increment(1);
                    }
                }
                Ok(())
            }
            PersistTask::FeedbackUpdate {
                request_id,
                model_id,
                user_id,
                was_accepted,
                shown_at,
                ground_truth,
            } => {
                // Feedback is accepted on user match even when the original
                // connection is long gone; a mismatch is dropped, not an
                // error, so a stray client cannot poison the queue.
                if let Some(owner) = self.gateway.query_owner(*request_id).await? {
                    if owner != *user_id {
                        warn!(
                            "Feedback for {} rejected: submitter is not the owner",
                            request_id
                        );
                        counter!("persist_feedback_rejected_total").increment(1);
                        return Ok(());
                    }
                }

                let updated = self
                    .gateway
                    .update_generation_acceptance(*request_id, *model_id, *was_accepted, shown_at)
                    .await?;
                if !updated {
                    // The query task may still be in flight; retry until the
                    // row exists or the budget runs out.
                    return Err(PersistError::Transient(
                        format!("generation ({request_id}, {model_id}) not yet present").into(),
                    )
                    .into());
                }

                if let Some(truth) = ground_truth {
                    let inserted = self.gateway.append_ground_truth(truth).await?;
                    if !inserted {
                        counter!("persist_ground_truth_dedup_total").increment(1);
                    }
                }
                Ok(())
            }
            PersistTask::Telemetry {
                request_id,
                contextual,
                behavioral,
                ..
            } => {
                self.gateway
                    .upsert_telemetry(*request_id, contextual.as_ref(), behavioral.as_ref())
                    .await
            }
            PersistTask::ContextFlush(record) => {
                let applied = self.gateway.flush_project_context(record).await?;
                if !applied {
                    info!(
                        "Context flush for project {} already landed",
                        record.project_id
                    );
                }
                Ok(())
            }
            PersistTask::SessionClose {
                session_id,
                end_time,
            } => self.gateway.close_session(*session_id, end_time).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::model::record::*;
    use common::model::{BehavioralTelemetry, ContextData, ContextualTelemetry};
    use store::MemoryGateway;
    use uuid::Uuid;

    fn pool_with(gateway: Arc<MemoryGateway>, max_retries: u32) -> Arc<PersistWorkerPool> {
        let broker = Arc::new(QueueManager::new(None, "test", 64));
        PersistWorkerPool::new(broker, gateway, 2, max_retries, 1)
    }

    fn meta(request_id: Uuid, user_id: Uuid) -> MetaQueryRecord {
        MetaQueryRecord {
            request_id,
            kind: QueryKind::Completion,
            user_id,
            session_id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            chat_id: None,
            context: Some(ContextData::default()),
            contextual_telemetry: Some(ContextualTelemetry::default()),
            behavioral_telemetry: Some(BehavioralTelemetry::default()),
            context_change_index: None,
            total_serving_time_ms: 42,
            server_version_id: Some(1),
            deadline_fired: false,
            orphaned: false,
        }
    }

    fn generation(request_id: Uuid, model_id: i64) -> GenerationRecord {
        GenerationRecord {
            request_id,
            model_id,
            completion: "return a + b".to_string(),
            generation_time_ms: 120,
            confidence: 0.92,
            logprobs: vec![-0.05],
            shown_at: vec!["2026-08-02T00:00:00Z".to_string()],
            was_accepted: false,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_query_task_persists_in_order() {
        let gateway = Arc::new(MemoryGateway::new());
        let pool = pool_with(Arc::clone(&gateway), 3);

        let request_id = Uuid::now_v7();
        let task = PersistTask::Query {
            meta: meta(request_id, Uuid::new_v4()),
            generations: vec![generation(request_id, 1)],
        };

        pool.handle(QueuedItem::new(task)).await;

        assert_eq!(gateway.meta_query_count().await, 1);
        assert_eq!(gateway.generation_count().await, 1);
        assert!(gateway.generation(request_id, 1).await.is_some());
    }

    #[tokio::test]
    async fn test_redelivery_does_not_duplicate_generations() {
        let gateway = Arc::new(MemoryGateway::new());
        let pool = pool_with(Arc::clone(&gateway), 3);

        let request_id = Uuid::now_v7();
        let make_task = || PersistTask::Query {
            meta: meta(request_id, Uuid::new_v4()),
            generations: vec![generation(request_id, 1), generation(request_id, 2)],
        };

        pool.handle(QueuedItem::new(make_task())).await;
        // Simulated visibility-timeout redelivery of the same task.
        pool.handle(QueuedItem::new(make_task())).await;

        assert_eq!(gateway.generation_count().await, 2);
        assert_eq!(gateway.meta_query_count().await, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_until_success() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.fail_next(2);
        let pool = pool_with(Arc::clone(&gateway), 5);

        let request_id = Uuid::now_v7();
        let task = PersistTask::Query {
            meta: meta(request_id, Uuid::new_v4()),
            generations: vec![generation(request_id, 1)],
        };

        pool.handle(QueuedItem::new(task)).await;
        assert_eq!(gateway.generation_count().await, 1);
    }

    #[tokio::test]
    async fn test_feedback_replay_is_noop() {
        let gateway = Arc::new(MemoryGateway::new());
        let pool = pool_with(Arc::clone(&gateway), 3);

        let request_id = Uuid::now_v7();
        let user_id = Uuid::new_v4();
        pool.handle(QueuedItem::new(PersistTask::Query {
            meta: meta(request_id, user_id),
            generations: vec![generation(request_id, 1)],
        }))
        .await;

        let feedback = || PersistTask::FeedbackUpdate {
            request_id,
            model_id: 1,
            user_id,
            was_accepted: true,
            shown_at: vec!["2026-08-02T00:00:01Z".to_string()],
            ground_truth: Some(GroundTruthRecord {
                request_id,
                truth_timestamp: "2026-08-02T00:00:01Z".to_string(),
                ground_truth: "return a + b".to_string(),
            }),
        };

        pool.handle(QueuedItem::new(feedback())).await;
        pool.handle(QueuedItem::new(feedback())).await;

        let row = gateway.generation(request_id, 1).await.unwrap();
        assert!(row.was_accepted);
        assert_eq!(row.shown_at.len(), 2);
        assert_eq!(gateway.ground_truth_count().await, 1);
    }

    #[tokio::test]
    async fn test_feedback_from_wrong_user_is_dropped() {
        let gateway = Arc::new(MemoryGateway::new());
        let pool = pool_with(Arc::clone(&gateway), 3);

        let request_id = Uuid::now_v7();
        let owner = Uuid::new_v4();
        pool.handle(QueuedItem::new(PersistTask::Query {
            meta: meta(request_id, owner),
            generations: vec![generation(request_id, 1)],
        }))
        .await;

        pool.handle(QueuedItem::new(PersistTask::FeedbackUpdate {
            request_id,
            model_id: 1,
            user_id: Uuid::new_v4(),
            was_accepted: true,
            shown_at: vec![],
            ground_truth: None,
        }))
        .await;

        let row = gateway.generation(request_id, 1).await.unwrap();
        assert!(!row.was_accepted, "foreign feedback must not apply");
    }

    #[tokio::test]
    async fn test_context_flush_idempotent_per_index() {
        let gateway = Arc::new(MemoryGateway::new());
        let pool = pool_with(Arc::clone(&gateway), 3);

        let project_id = Uuid::new_v4();
        let flush = || {
            PersistTask::ContextFlush(ContextFlushRecord {
                project_id,
                context: Default::default(),
                changes: vec![],
                last_index: Some(7),
            })
        };

        pool.handle(QueuedItem::new(flush())).await;
        pool.handle(QueuedItem::new(flush())).await;
        assert_eq!(gateway.flush_count().await, 1);
    }
}
