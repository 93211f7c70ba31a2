use common::interface::{CompletionPrompt, InferenceModel, ModelOutput};
use common::model::frame::ChatMessage;
use errors::Result;
use errors::error::InferenceError;
use log::info;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Process-wide table of available inference callables, keyed by model id.
pub struct ModelRegistry {
    models: HashMap<i64, Arc<dyn InferenceModel>>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            models: HashMap::new(),
        }
    }

    pub fn register(&mut self, model: Arc<dyn InferenceModel>) {
        self.models.insert(model.model_id(), model);
    }

    pub fn get(&self, model_id: i64) -> Result<Arc<dyn InferenceModel>> {
        self.models
            .get(&model_id)
            .cloned()
            .ok_or_else(|| InferenceError::ModelNotFound(model_id).into())
    }

    pub fn ids(&self) -> Vec<i64> {
        self.models.keys().copied().collect()
    }

    /// Warm start at worker boot; failures are surfaced so the operator sees
    /// a broken model before traffic does.
    pub async fn warm_all(&self) -> Result<()> {
        for model in self.models.values() {
            info!("Warming model {} ({})", model.model_id(), model.model_name());
            model
                .warm()
                .await
                .map_err(|e| InferenceError::WarmupFailed(Box::new(e)))?;
        }
        Ok(())
    }
}

/// Deterministic template-backed model for tests and local development:
/// answers after a fixed latency with a canned completion. Stands in for the
/// real GPU-backed callables behind the same trait.
pub struct TemplateModel {
    id: i64,
    name: String,
    completion: String,
    confidence: f64,
    latency: Duration,
}

impl TemplateModel {
    pub fn new(id: i64, name: &str, completion: &str, confidence: f64, latency: Duration) -> Self {
        Self {
            id,
            name: name.to_string(),
            completion: completion.to_string(),
            confidence,
            latency,
        }
    }
}

#[async_trait::async_trait]
impl InferenceModel for TemplateModel {
    fn model_id(&self) -> i64 {
        self.id
    }

    fn model_name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, _prompt: CompletionPrompt) -> Result<ModelOutput> {
        let started = tokio::time::Instant::now();
        tokio::time::sleep(self.latency).await;
        Ok(ModelOutput {
            completion: self.completion.clone(),
            confidence: self.confidence,
            logprobs: vec![-0.05; self.completion.split_whitespace().count().max(1)],
            generation_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn chat(
        &self,
        _messages: Vec<ChatMessage>,
        deltas: mpsc::Sender<String>,
    ) -> Result<ModelOutput> {
        let started = tokio::time::Instant::now();
        // Stream word by word the way a real generation loop would emit
        // decoded tokens.
        for word in self.completion.split_inclusive(' ') {
            tokio::time::sleep(self.latency / 4).await;
            if deltas.send(word.to_string()).await.is_err() {
                break;
            }
        }
        Ok(ModelOutput {
            completion: self.completion.clone(),
            confidence: self.confidence,
            logprobs: vec![-0.05; self.completion.split_whitespace().count().max(1)],
            generation_time_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_lookup() {
        let mut registry = ModelRegistry::new();
        registry.register(Arc::new(TemplateModel::new(
            1,
            "template-fast",
            "return a + b",
            0.92,
            Duration::from_millis(1),
        )));

        assert!(registry.get(1).is_ok());
        assert!(registry.get(99).is_err());
        assert_eq!(registry.ids(), vec![1]);
    }

    #[tokio::test]
    async fn test_template_model_completes() {
        let model = TemplateModel::new(1, "t", "return a + b", 0.92, Duration::from_millis(1));
        let output = model.complete(CompletionPrompt::default()).await.unwrap();
        assert_eq!(output.completion, "return a + b");
        assert!((output.confidence - 0.92).abs() < f64::EPSILON);
        assert_eq!(output.logprobs.len(), 4);
    }

    #[tokio::test]
    async fn test_template_model_streams_chat() {
        let model = TemplateModel::new(1, "t", "hello brave world", 0.5, Duration::from_millis(4));
        let (tx, mut rx) = mpsc::channel(16);
        let output = model.chat(Vec::new(), tx).await.unwrap();

        let mut streamed = String::new();
        while let Ok(delta) = rx.try_recv() {
            streamed.push_str(&delta);
        }
        assert_eq!(streamed, output.completion);
    }
}
