pub mod config;
pub mod frame;
pub mod record;
pub mod task;
pub mod token;

pub use frame::{
    BehavioralTelemetry, ChatMessage, ChatRole, ClientErrorKind, CompletionRequest, ContextData,
    ContextualTelemetry, Frame, ModelReply,
};
pub use record::{
    ContextFlushRecord, GenerationRecord, GroundTruthRecord, MetaQueryRecord, QueryKind, UserRow,
};
pub use task::{InferenceTask, InferenceTaskKind, PersistTask, ReplyEnvelope, ReplyPayload, TopicType};
pub use token::{
    AuthRecord, ContextChange, ContextChangeEntry, ContextChangeType, ProjectRecord, SessionRecord,
    TokenKind, UserPreferences,
};
