use super::frame::{
    BehavioralTelemetry, ChatMessage, ContextData, ContextualTelemetry, ModelReply,
};
use super::record::{GenerationRecord, GroundTruthRecord, MetaQueryRecord};
use super::token::UserPreferences;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// The broker's two work queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicType {
    Inference,
    Persist,
}

impl TopicType {
    pub(crate) fn suffix(&self) -> &'static str {
        match self {
            TopicType::Inference => "inference",
            TopicType::Persist => "persist",
        }
    }

    pub fn get_name(&self, name: &str) -> String {
        format!("tandem-{}-{}", name, self.suffix())
    }
}

/// Reply channels are addressed by the connection that owns them.
pub fn reply_channel(connection_id: &Uuid) -> String {
    format!("conn:{connection_id}")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InferenceTaskKind {
    Completion,
    Chat,
}

/// Work item handed to the inference pool. Everything a worker needs is
/// inlined so it can run without touching the orchestrator's state: tokens
/// for revalidation, the context, the multi-file snapshot, and the reply
/// channel to publish results on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceTask {
    pub id: Uuid,
    pub kind: InferenceTaskKind,
    pub request_id: Uuid,
    pub user_id: Uuid,
    pub session_token: Uuid,
    pub project_token: Uuid,
    pub model_ids: Vec<i64>,
    pub context: ContextData,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<Uuid>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    /// Multi-file context snapshot at the change indices the request named.
    #[serde(default)]
    pub multi_file_context: BTreeMap<String, String>,
    pub contextual_telemetry: ContextualTelemetry,
    pub behavioral_telemetry: BehavioralTelemetry,
    pub preferences: UserPreferences,
    pub reply_channel: String,
    pub enqueued_at_ms: u64,
}

/// Envelope published on a reply channel. One per model result, one per chat
/// delta, and a final completion marker per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub request_id: Uuid,
    pub payload: ReplyPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ReplyPayload {
    /// Per-model result (success or error) as it becomes available.
    Model(ModelReply),
    /// Incremental chat output forwarded without waiting for completion.
    ChatDelta { model_id: i64, delta: String },
    /// Worker-side synchronization barrier: the task finished invoking every
    /// model it was going to.
    InferenceComplete {},
}

/// Work item drained by the persistence pool. Self-describing; write order
/// within one task is fixed (query, then generations, then telemetry, then
/// ground truth).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PersistTask {
    Query {
        meta: MetaQueryRecord,
        generations: Vec<GenerationRecord>,
    },
    FeedbackUpdate {
        request_id: Uuid,
        model_id: i64,
        user_id: Uuid,
        was_accepted: bool,
        #[serde(default)]
        shown_at: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ground_truth: Option<GroundTruthRecord>,
    },
    /// Behavioral/contextual telemetry emitted outside a query record.
    Telemetry {
        user_id: Uuid,
        request_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        contextual: Option<ContextualTelemetry>,
        #[serde(skip_serializing_if = "Option::is_none")]
        behavioral: Option<BehavioralTelemetry>,
    },
    ContextFlush(super::record::ContextFlushRecord),
    SessionClose {
        session_id: Uuid,
        end_time: String,
    },
}

impl PersistTask {
    /// Stable id for logging and dedup bookkeeping.
    pub fn task_id(&self) -> String {
        match self {
            PersistTask::Query { meta, .. } => format!("query:{}", meta.request_id),
            PersistTask::FeedbackUpdate {
                request_id,
                model_id,
                ..
            } => format!("feedback:{request_id}:{model_id}"),
            PersistTask::Telemetry { request_id, .. } => format!("telemetry:{request_id}"),
            PersistTask::ContextFlush(record) => format!(
                "context-flush:{}:{}",
                record.project_id,
                record.last_index.unwrap_or(0)
            ),
            PersistTask::SessionClose { session_id, .. } => format!("session-close:{session_id}"),
        }
    }
}
