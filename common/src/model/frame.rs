use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Code context around the caret, as submitted by the plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContextData {
    pub prefix: String,
    pub suffix: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_text: Option<String>,
    /// File paths whose multi-file context may be folded into the prompt.
    /// `["*"]` means all files the project knows about.
    #[serde(default)]
    pub context_files: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContextualTelemetry {
    pub version_id: i64,
    pub trigger_type_id: i64,
    pub language_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caret_line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_char_length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relative_document_position: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BehavioralTelemetry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_since_last_shown: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_since_last_accepted: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typing_speed: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompletionRequest {
    pub model_ids: Vec<i64>,
    pub context: ContextData,
    pub contextual_telemetry: ContextualTelemetry,
    pub behavioral_telemetry: BehavioralTelemetry,
    /// Per-file change-log indices the caller wants folded into the prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_indices: Option<Vec<u64>>,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

/// Per-model result payload, echoed verbatim on the reply channel and on the
/// client wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelReply {
    pub model_id: i64,
    pub completion: String,
    pub confidence: f64,
    pub logprobs: Vec<f64>,
    pub generation_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ModelReply {
    pub fn failure(model_id: i64, message: impl Into<String>) -> Self {
        ModelReply {
            model_id,
            completion: String::new(),
            confidence: 0.0,
            logprobs: Vec::new(),
            generation_time_ms: 0,
            error: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Error kinds that may cross the client boundary. Internal classification
/// maps onto these at the wire edge; nothing else leaks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ClientErrorKind {
    Unauthenticated,
    Forbidden,
    RateLimited,
    InvalidRequest,
    Busy,
    Timeout,
    Internal,
}

/// Bidirectional message frames. `request_id` is chosen by the client on
/// requests and echoed on every reply belonging to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "completion.request")]
    CompletionRequest {
        request_id: Uuid,
        #[serde(flatten)]
        body: CompletionRequest,
    },
    #[serde(rename = "completion.partial")]
    CompletionPartial {
        request_id: Uuid,
        #[serde(flatten)]
        reply: ModelReply,
    },
    #[serde(rename = "completion.final")]
    CompletionFinal {
        request_id: Uuid,
        /// Model ids that produced a reply frame before the request closed.
        received: Vec<i64>,
        /// Model ids still outstanding when the deadline fired.
        timed_out: Vec<i64>,
        serving_time_ms: u64,
    },
    #[serde(rename = "completion.feedback")]
    CompletionFeedback {
        request_id: Uuid,
        model_id: i64,
        accepted: bool,
        #[serde(default)]
        shown_at: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ground_truth: Option<String>,
    },
    #[serde(rename = "chat.request")]
    ChatRequest {
        request_id: Uuid,
        chat_id: Uuid,
        model_ids: Vec<i64>,
        messages: Vec<ChatMessage>,
        context: ContextData,
        contextual_telemetry: ContextualTelemetry,
        behavioral_telemetry: BehavioralTelemetry,
    },
    #[serde(rename = "chat.partial")]
    ChatPartial {
        request_id: Uuid,
        model_id: i64,
        delta: String,
    },
    #[serde(rename = "chat.final")]
    ChatFinal {
        request_id: Uuid,
        #[serde(flatten)]
        reply: ModelReply,
    },
    #[serde(rename = "context.update")]
    ContextUpdate {
        request_id: Uuid,
        file_path: String,
        change: super::token::ContextChange,
    },
    #[serde(rename = "context.broadcast")]
    ContextBroadcast {
        project_token: Uuid,
        change_index: u64,
        file_path: String,
        digest: String,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<Uuid>,
        kind: ClientErrorKind,
        message: String,
    },
    #[serde(rename = "ping")]
    Ping {},
    #[serde(rename = "pong")]
    Pong {},
}

impl Frame {
    pub fn error(request_id: Option<Uuid>, kind: ClientErrorKind, message: impl Into<String>) -> Self {
        Frame::Error {
            request_id,
            kind,
            message: message.into(),
        }
    }

    /// The request id this frame belongs to, if it carries one.
    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            Frame::CompletionRequest { request_id, .. }
            | Frame::CompletionPartial { request_id, .. }
            | Frame::CompletionFinal { request_id, .. }
            | Frame::CompletionFeedback { request_id, .. }
            | Frame::ChatRequest { request_id, .. }
            | Frame::ChatPartial { request_id, .. }
            | Frame::ChatFinal { request_id, .. }
            | Frame::ContextUpdate { request_id, .. } => Some(*request_id),
            Frame::Error { request_id, .. } => *request_id,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_tags() {
        let frame = Frame::Ping {};
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "ping");

        let frame = Frame::CompletionFinal {
            request_id: Uuid::nil(),
            received: vec![1],
            timed_out: vec![2],
            serving_time_ms: 1500,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "completion.final");
        assert_eq!(json["timed_out"][0], 2);
    }

    #[test]
    fn test_completion_request_roundtrip() {
        let raw = serde_json::json!({
            "type": "completion.request",
            "request_id": "018f7b33-7a39-7d2a-b7c8-111111111111",
            "model_ids": [1],
            "context": {"prefix": "def add(a, b):\n  ", "suffix": ""},
            "contextual_telemetry": {
                "version_id": 3, "trigger_type_id": 1, "language_id": 7
            },
            "behavioral_telemetry": {"typing_speed": 310}
        });
        let frame: Frame = serde_json::from_value(raw).unwrap();
        match frame {
            Frame::CompletionRequest { body, .. } => {
                assert_eq!(body.model_ids, vec![1]);
                assert_eq!(body.context.prefix, "def add(a, b):\n  ");
                assert_eq!(body.behavioral_telemetry.typing_speed, Some(310));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_error_kind_wire_names() {
        let json = serde_json::to_string(&ClientErrorKind::RateLimited).unwrap();
        assert_eq!(json, "\"rate-limited\"");
        let json = serde_json::to_string(&ClientErrorKind::InvalidRequest).unwrap();
        assert_eq!(json, "\"invalid-request\"");
    }

    #[test]
    fn test_model_reply_failure() {
        let reply = ModelReply::failure(4, "timeout");
        assert!(!reply.is_success());
        assert_eq!(reply.model_id, 4);
    }
}
