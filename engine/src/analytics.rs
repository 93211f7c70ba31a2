use common::model::frame::{BehavioralTelemetry, ContextualTelemetry};
use common::model::task::PersistTask;
use log::warn;
use metrics::counter;
use queue::QueueManager;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Fire-and-forget telemetry emission: the persist queue viewed through a
/// telemetry envelope. Off the hot path by construction; when the queue
/// grows past the hard cap the sink degrades to sampling instead of adding
/// more load.
pub struct AnalyticsSink {
    broker: Arc<QueueManager>,
    hard_cap: u64,
    sample_counter: AtomicU64,
}

const SAMPLE_KEEP_ONE_IN: u64 = 10;

impl AnalyticsSink {
    pub fn new(broker: Arc<QueueManager>, hard_cap: u64) -> Arc<Self> {
        Arc::new(Self {
            broker,
            hard_cap,
            sample_counter: AtomicU64::new(0),
        })
    }

    /// Emits one telemetry envelope. Never returns an error to the caller;
    /// analytics loss is tolerated, request handling is not.
    pub async fn emit(
        &self,
        user_id: Uuid,
        request_id: Uuid,
        contextual: Option<ContextualTelemetry>,
        behavioral: Option<BehavioralTelemetry>,
    ) {
        if self.broker.persist_depth().await > self.hard_cap {
            let n = self.sample_counter.fetch_add(1, Ordering::Relaxed);
            if n % SAMPLE_KEEP_ONE_IN != 0 {
                counter!("analytics_sampled_out_total").increment(1);
                return;
            }
        }

        let task = PersistTask::Telemetry {
            user_id,
            request_id,
            contextual,
            behavioral,
        };
        if let Err(e) = self.broker.enqueue_persist(task).await {
            warn!("Telemetry enqueue failed: {}", e);
            counter!("analytics_dropped_total").increment(1);
        } else {
            counter!("analytics_emit_total").increment(1);
        }
    }
}
