use super::frame::{BehavioralTelemetry, ContextData, ContextualTelemetry};
use super::token::{ContextChangeEntry, UserPreferences};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Narrow view of a user row as the hot path needs it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserRow {
    pub user_id: Uuid,
    pub email: String,
    pub name: String,
    pub verified: bool,
    pub preferences: UserPreferences,
    pub config_id: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    Completion,
    Chat,
}

/// One client request as the durable store sees it. The gateway dispatches on
/// `kind` to the completion or chat table set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetaQueryRecord {
    /// Client request id; doubles as the meta-query primary key.
    pub request_id: Uuid,
    pub kind: QueryKind,
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub project_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<Uuid>,
    /// Redacted context; the raw caller input never reaches the store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contextual_telemetry: Option<ContextualTelemetry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub behavioral_telemetry: Option<BehavioralTelemetry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_change_index: Option<u64>,
    pub total_serving_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version_id: Option<i64>,
    /// The request deadline fired before every model reported.
    #[serde(default)]
    pub deadline_fired: bool,
    /// The originating connection was gone by the time the request closed.
    #[serde(default)]
    pub orphaned: bool,
}

/// One generation row, identity (request_id, model_id).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationRecord {
    pub request_id: Uuid,
    pub model_id: i64,
    pub completion: String,
    pub generation_time_ms: u64,
    pub confidence: f64,
    pub logprobs: Vec<f64>,
    pub shown_at: Vec<String>,
    pub was_accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Append-only ground truth, identity (request_id, truth_timestamp).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroundTruthRecord {
    pub request_id: Uuid,
    pub truth_timestamp: String,
    pub ground_truth: String,
}

/// Final project context written out when the last parent session dies,
/// identity (project_id, last_index).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextFlushRecord {
    pub project_id: Uuid,
    pub context: BTreeMap<String, String>,
    pub changes: Vec<ContextChangeEntry>,
    pub last_index: Option<u64>,
}
