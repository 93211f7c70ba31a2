use crate::model::record::{
    ContextFlushRecord, GenerationRecord, GroundTruthRecord, MetaQueryRecord, UserRow,
};
use async_trait::async_trait;
use errors::Result;
use uuid::Uuid;

/// Narrow interface over the durable store. The hot path only ever reads
/// (user lookup, config load); all writes go through the persistence workers.
///
/// Row identity: generations by (request_id, model_id), context flushes by
/// (project_id, last_index), ground truth by (request_id, truth_timestamp).
/// Implementations must make the `create_*` verbs idempotent on those keys so
/// task redelivery cannot duplicate rows.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<UserRow>>;

    async fn load_config(&self, config_id: i64) -> Result<Option<String>>;

    async fn upsert_user(&self, user: &UserRow) -> Result<()>;

    /// Inserts the meta-query row and its kind-specific child row. Dispatches
    /// on `record.kind` to the completion or chat table set.
    async fn create_meta_query(&self, record: &MetaQueryRecord) -> Result<()>;

    /// Returns false when the (request_id, model_id) row already exists.
    async fn create_generation(&self, row: &GenerationRecord) -> Result<bool>;

    /// Returns false when no matching generation row exists.
    async fn update_generation_acceptance(
        &self,
        request_id: Uuid,
        model_id: i64,
        was_accepted: bool,
        shown_at: &[String],
    ) -> Result<bool>;

    /// Returns false when the (request_id, truth_timestamp) row already
    /// exists.
    async fn append_ground_truth(&self, row: &GroundTruthRecord) -> Result<bool>;

    async fn upsert_telemetry(
        &self,
        request_id: Uuid,
        contextual: Option<&crate::model::frame::ContextualTelemetry>,
        behavioral: Option<&crate::model::frame::BehavioralTelemetry>,
    ) -> Result<()>;

    /// Returns false when this (project_id, last_index) flush already landed.
    async fn flush_project_context(&self, record: &ContextFlushRecord) -> Result<bool>;

    async fn close_session(&self, session_id: Uuid, end_time: &str) -> Result<()>;

    /// Owner of a recorded request, used to validate feedback ownership after
    /// the in-memory record is gone.
    async fn query_owner(&self, request_id: Uuid) -> Result<Option<Uuid>>;
}
