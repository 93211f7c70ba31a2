use crate::model::frame::ChatMessage;
use async_trait::async_trait;
use errors::Result;
use tokio::sync::mpsc;

/// Prompt handed to a completion model after redaction and multi-file
/// context assembly.
#[derive(Debug, Clone, Default)]
pub struct CompletionPrompt {
    pub prefix: String,
    pub suffix: String,
    pub stop_sequences: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub completion: String,
    pub confidence: f64,
    pub logprobs: Vec<f64>,
    pub generation_time_ms: u64,
}

/// Opaque inference callable. Model loading, tokenization, and generation
/// internals live behind this trait; the core only schedules invocations and
/// moves their outputs.
#[async_trait]
pub trait InferenceModel: Send + Sync {
    fn model_id(&self) -> i64;

    fn model_name(&self) -> &str;

    async fn complete(&self, prompt: CompletionPrompt) -> Result<ModelOutput>;

    /// Chat generation. Implementations may stream partial output through
    /// `deltas`; the aggregate result is still returned at the end.
    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        deltas: mpsc::Sender<String>,
    ) -> Result<ModelOutput>;

    /// Warm start hook, invoked at worker boot when preloading is enabled.
    async fn warm(&self) -> Result<()> {
        Ok(())
    }
}

/// Pluggable secret detector. The redacted form is what models see and what
/// gets persisted; raw input never leaves the worker.
pub trait SecretDetector: Send + Sync {
    fn redact(&self, text: &str) -> String;
}
