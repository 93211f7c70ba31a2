use crate::models::ModelRegistry;
use crate::runner::ProcessorRunner;
use common::interface::{CompletionPrompt, SecretDetector};
use common::model::frame::ModelReply;
use common::model::task::{InferenceTask, InferenceTaskKind, ReplyEnvelope, ReplyPayload};
use log::{info, warn};
use metrics::{counter, histogram};
use queue::channel::QueuedItem;
use queue::{QueueManager, ReplyRouter};
use session::TokenStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast, mpsc, watch};

/// Drains the inference queue: revalidates tokens, redacts the context,
/// invokes every requested model in parallel under a per-worker cap, and
/// publishes per-model results on the task's reply channel as they land.
/// Aggregation happens on the orchestrator side, never here.
pub struct InferenceWorkerPool {
    broker: Arc<QueueManager>,
    replies: Arc<ReplyRouter>,
    tokens: Arc<TokenStore>,
    models: Arc<ModelRegistry>,
    detector: Arc<dyn SecretDetector>,
    concurrency: usize,
    per_model_timeout: Duration,
}

impl InferenceWorkerPool {
    pub fn new(
        broker: Arc<QueueManager>,
        replies: Arc<ReplyRouter>,
        tokens: Arc<TokenStore>,
        models: Arc<ModelRegistry>,
        detector: Arc<dyn SecretDetector>,
        concurrency: usize,
        per_model_timeout_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            replies,
            tokens,
            models,
            detector,
            concurrency,
            per_model_timeout: Duration::from_millis(per_model_timeout_ms),
        })
    }

    pub fn start(
        self: Arc<Self>,
        shutdown_rx: broadcast::Receiver<()>,
        pause_rx: watch::Receiver<bool>,
    ) {
        let runner = ProcessorRunner::new("Inference", shutdown_rx, pause_rx, self.concurrency);
        let receiver = self.broker.inference_receiver();
        let pool = Arc::clone(&self);

        tokio::spawn(async move {
            runner
                .run(receiver, move |queued: QueuedItem<InferenceTask>| {
                    let pool = Arc::clone(&pool);
                    async move {
                        pool.process(&queued.item).await;
                        // Settled only after the complete envelope went out;
                        // a crash before this point redelivers the task.
                        queued.ack().await;
                    }
                })
                .await;
        });
    }

    /// Runs one task end to end. Publishing failures are logged and dropped:
    /// the orchestrator's deadline owns the client-facing outcome.
    pub async fn process(&self, task: &InferenceTask) {
        let queued_for = now_ms().saturating_sub(task.enqueued_at_ms);
        histogram!("inference_task_queue_delay_ms").record(queued_for as f64);

        if !self.revalidate(task).await {
            counter!("inference_task_total", "outcome" => "unauthenticated").increment(1);
            let model_id = task.model_ids.first().copied().unwrap_or_default();
            self.publish(
                task,
                ReplyPayload::Model(ModelReply::failure(model_id, "session no longer valid")),
            )
            .await;
            self.publish(task, ReplyPayload::InferenceComplete {}).await;
            return;
        }

        let prompt = self.build_prompt(task);

        match task.kind {
            InferenceTaskKind::Completion => self.run_completion(task, prompt).await,
            InferenceTaskKind::Chat => self.run_chat(task).await,
        }

        self.publish(task, ReplyPayload::InferenceComplete {}).await;
        counter!("inference_task_total", "outcome" => "done").increment(1);
    }

    /// Tokens may have died while the task sat on the queue; check all three
    /// levels before spending GPU time.
    async fn revalidate(&self, task: &InferenceTask) -> bool {
        let session = match self.tokens.get_session(&task.session_token).await {
            Ok(Some(session)) => session,
            _ => return false,
        };
        match self.tokens.get_auth(&session.auth_token).await {
            Ok(Some(_)) => {}
            _ => return false,
        }
        matches!(self.tokens.get_project(&task.project_token).await, Ok(Some(_)))
    }

    /// Redacts the caret context and folds the multi-file snapshot into the
    /// prefix, scoped to the files the request asked for.
    fn build_prompt(&self, task: &InferenceTask) -> CompletionPrompt {
        let mut prefix = self.detector.redact(&task.context.prefix);
        let suffix = self.detector.redact(&task.context.suffix);

        let wanted = &task.context.context_files;
        let all_files = wanted.iter().any(|f| f == "*");

        let mut other_files = Vec::new();
        for (file_name, content) in &task.multi_file_context {
            if Some(file_name) == task.context.file_name.as_ref() {
                continue;
            }
            if !all_files && !wanted.contains(file_name) {
                continue;
            }
            let content = self.detector.redact(content.trim());
            other_files.push(format!("#{file_name}\n{content}"));
        }

        if !other_files.is_empty() {
            prefix = format!(
                "Other files context:\n{}\n\n{}",
                other_files.join("\n"),
                prefix
            );
        }

        CompletionPrompt {
            prefix,
            suffix,
            stop_sequences: task.stop_sequences.clone(),
        }
    }

    async fn run_completion(&self, task: &InferenceTask, prompt: CompletionPrompt) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::new();

        for model_id in task.model_ids.clone() {
            let model = match self.models.get(model_id) {
                Ok(model) => model,
                Err(e) => {
                    warn!("Model {} unavailable: {}", model_id, e);
                    self.publish(
                        task,
                        ReplyPayload::Model(ModelReply::failure(model_id, "model not found")),
                    )
                    .await;
                    continue;
                }
            };

            let semaphore = Arc::clone(&semaphore);
            let prompt = prompt.clone();
            let timeout = self.per_model_timeout;

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let reply = match tokio::time::timeout(timeout, model.complete(prompt)).await {
                    Ok(Ok(output)) => ModelReply {
                        model_id,
                        completion: output.completion,
                        confidence: output.confidence,
                        logprobs: output.logprobs,
                        generation_time_ms: output.generation_time_ms,
                        error: None,
                    },
                    Ok(Err(e)) => {
                        counter!("inference_model_total", "outcome" => "error").increment(1);
                        ModelReply::failure(model_id, e.to_string())
                    }
                    Err(_) => {
                        counter!("inference_model_total", "outcome" => "timeout").increment(1);
                        ModelReply::failure(model_id, "timeout")
                    }
                };
                reply
            }));
        }

        // Publish in completion order, not submission order.
        for handle in handles {
            match handle.await {
                Ok(reply) => {
                    if reply.is_success() {
                        counter!("inference_model_total", "outcome" => "ok").increment(1);
                        histogram!("inference_model_time_ms").record(reply.generation_time_ms as f64);
                    }
                    self.publish(task, ReplyPayload::Model(reply)).await;
                }
                Err(e) => warn!("Model invocation task panicked: {}", e),
            }
        }
    }

    /// Chat runs single-model and streams partial output; each delta is
    /// forwarded immediately so the client renders tokens as they decode.
    async fn run_chat(&self, task: &InferenceTask) {
        let Some(model_id) = task.model_ids.first().copied() else {
            self.publish(
                task,
                ReplyPayload::Model(ModelReply::failure(0, "no model requested")),
            )
            .await;
            return;
        };

        let model = match self.models.get(model_id) {
            Ok(model) => model,
            Err(_) => {
                self.publish(
                    task,
                    ReplyPayload::Model(ModelReply::failure(model_id, "model not found")),
                )
                .await;
                return;
            }
        };

        let (delta_tx, mut delta_rx) = mpsc::channel::<String>(64);
        let messages = task.messages.clone();
        let timeout = self.per_model_timeout;

        let generation =
            tokio::spawn(
                async move { tokio::time::timeout(timeout, model.chat(messages, delta_tx)).await },
            );

        while let Some(delta) = delta_rx.recv().await {
            self.publish(task, ReplyPayload::ChatDelta { model_id, delta }).await;
        }

        let reply = match generation.await {
            Ok(Ok(Ok(output))) => ModelReply {
                model_id,
                completion: output.completion,
                confidence: output.confidence,
                logprobs: output.logprobs,
                generation_time_ms: output.generation_time_ms,
                error: None,
            },
            Ok(Ok(Err(e))) => ModelReply::failure(model_id, e.to_string()),
            Ok(Err(_)) => ModelReply::failure(model_id, "timeout"),
            Err(e) => ModelReply::failure(model_id, format!("chat task failed: {e}")),
        };
        self.publish(task, ReplyPayload::Model(reply)).await;
    }

    async fn publish(&self, task: &InferenceTask, payload: ReplyPayload) {
        let envelope = ReplyEnvelope {
            request_id: task.request_id,
            payload,
        };
        if let Err(e) = self.replies.publish(&task.reply_channel, &envelope).await {
            // The connection may simply be gone; its orchestrator drops
            // stale replies anyway.
            info!("Reply publish to {} failed: {}", task.reply_channel, e);
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TemplateModel;
    use crate::redact::RegexSecretDetector;
    use cacheable::{CacheService, LocalBackend};
    use common::model::config::TokenConfig;
    use common::model::task::reply_channel;
    use common::model::token::UserPreferences;
    use common::model::{BehavioralTelemetry, ContextData, ContextualTelemetry};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    struct Ctx {
        pool: Arc<InferenceWorkerPool>,
        tokens: Arc<TokenStore>,
        replies: Arc<ReplyRouter>,
    }

    async fn setup(per_model_timeout_ms: u64) -> Ctx {
        let cache = Arc::new(CacheService::with_backend(
            Arc::new(LocalBackend::new()),
            "test".to_string(),
        ));
        let tokens = Arc::new(TokenStore::new(cache, TokenConfig::default()));
        let replies = ReplyRouter::local();
        let broker = Arc::new(QueueManager::new(None, "test", 64));

        let mut registry = ModelRegistry::new();
        registry.register(Arc::new(TemplateModel::new(
            1,
            "fast",
            "return a + b",
            0.92,
            Duration::from_millis(5),
        )));
        registry.register(Arc::new(TemplateModel::new(
            2,
            "slow",
            "return sum((a, b))",
            0.48,
            Duration::from_millis(500),
        )));

        let pool = InferenceWorkerPool::new(
            broker,
            Arc::clone(&replies),
            Arc::clone(&tokens),
            Arc::new(registry),
            Arc::new(RegexSecretDetector::new()),
            4,
            per_model_timeout_ms,
        );

        Ctx {
            pool,
            tokens,
            replies,
        }
    }

    async fn valid_task(ctx: &Ctx, model_ids: Vec<i64>) -> (InferenceTask, Uuid) {
        let auth = ctx.tokens.issue_auth(Uuid::new_v4()).await.unwrap();
        let session = ctx
            .tokens
            .issue_session(&auth, UserPreferences::default())
            .await
            .unwrap();
        let project = ctx
            .tokens
            .attach_project(&session, Uuid::new_v4())
            .await
            .unwrap();
        let connection_id = Uuid::new_v4();

        let task = InferenceTask {
            id: Uuid::now_v7(),
            kind: InferenceTaskKind::Completion,
            request_id: Uuid::now_v7(),
            user_id: Uuid::new_v4(),
            session_token: session,
            project_token: project,
            model_ids,
            context: ContextData {
                prefix: "def add(a, b):\n  ".to_string(),
                suffix: String::new(),
                ..ContextData::default()
            },
            stop_sequences: vec![],
            chat_id: None,
            messages: vec![],
            multi_file_context: BTreeMap::new(),
            contextual_telemetry: ContextualTelemetry::default(),
            behavioral_telemetry: BehavioralTelemetry::default(),
            preferences: UserPreferences::default(),
            reply_channel: reply_channel(&connection_id),
            enqueued_at_ms: now_ms(),
        };
        (task, connection_id)
    }

    async fn collect_replies(
        rx: &mut tokio::sync::mpsc::Receiver<ReplyEnvelope>,
    ) -> Vec<ReplyPayload> {
        let mut payloads = Vec::new();
        loop {
            let envelope = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("reply timeout")
                .expect("channel closed");
            let done = matches!(envelope.payload, ReplyPayload::InferenceComplete {});
            payloads.push(envelope.payload);
            if done {
                break;
            }
        }
        payloads
    }

    #[tokio::test]
    async fn test_single_model_success() {
        let ctx = setup(1000).await;
        let (task, _) = valid_task(&ctx, vec![1]).await;
        let mut rx = ctx.replies.register(&task.reply_channel).await;

        ctx.pool.process(&task).await;

        let payloads = collect_replies(&mut rx).await;
        assert_eq!(payloads.len(), 2);
        match &payloads[0] {
            ReplyPayload::Model(reply) => {
                assert_eq!(reply.model_id, 1);
                assert_eq!(reply.completion, "return a + b");
                assert!((reply.confidence - 0.92).abs() < 1e-9);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_per_model_timeout_counts_as_error_reply() {
        let ctx = setup(50).await;
        let (task, _) = valid_task(&ctx, vec![1, 2]).await;
        let mut rx = ctx.replies.register(&task.reply_channel).await;

        ctx.pool.process(&task).await;

        let payloads = collect_replies(&mut rx).await;
        // Two model replies plus the completion barrier.
        assert_eq!(payloads.len(), 3);

        let replies: Vec<&ModelReply> = payloads
            .iter()
            .filter_map(|p| match p {
                ReplyPayload::Model(reply) => Some(reply),
                _ => None,
            })
            .collect();
        let fast = replies.iter().find(|r| r.model_id == 1).unwrap();
        let slow = replies.iter().find(|r| r.model_id == 2).unwrap();
        assert!(fast.is_success());
        assert_eq!(slow.error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_invalid_tokens_skip_models() {
        let ctx = setup(1000).await;
        let (mut task, _) = valid_task(&ctx, vec![1]).await;
        task.session_token = Uuid::new_v4();
        let mut rx = ctx.replies.register(&task.reply_channel).await;

        ctx.pool.process(&task).await;

        let payloads = collect_replies(&mut rx).await;
        assert_eq!(payloads.len(), 2);
        match &payloads[0] {
            ReplyPayload::Model(reply) => {
                assert_eq!(reply.error.as_deref(), Some("session no longer valid"));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_prompt_folds_multi_file_context_and_redacts() {
        let ctx = setup(1000).await;
        let (mut task, _) = valid_task(&ctx, vec![1]).await;
        task.context.file_name = Some("main.py".to_string());
        task.context.context_files = vec!["*".to_string()];
        task.context.prefix = "API_KEY=sk_live_abcdef1234567890\ndef handler():".to_string();
        task.multi_file_context
            .insert("util.py".to_string(), "def util():\n    pass".to_string());
        task.multi_file_context
            .insert("main.py".to_string(), "ignored, current file".to_string());

        let prompt = ctx.pool.build_prompt(&task);
        assert!(prompt.prefix.starts_with("Other files context:\n#util.py"));
        assert!(!prompt.prefix.contains("ignored, current file"));
        assert!(!prompt.prefix.contains("sk_live_abcdef1234567890"));
    }

    #[tokio::test]
    async fn test_chat_streams_partials_before_final() {
        let ctx = setup(1000).await;
        let (mut task, _) = valid_task(&ctx, vec![1]).await;
        task.kind = InferenceTaskKind::Chat;
        task.chat_id = Some(Uuid::new_v4());
        let mut rx = ctx.replies.register(&task.reply_channel).await;

        ctx.pool.process(&task).await;

        let payloads = collect_replies(&mut rx).await;
        let deltas: String = payloads
            .iter()
            .filter_map(|p| match p {
                ReplyPayload::ChatDelta { delta, .. } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, "return a + b");

        let final_reply = payloads
            .iter()
            .find_map(|p| match p {
                ReplyPayload::Model(reply) => Some(reply),
                _ => None,
            })
            .unwrap();
        assert_eq!(final_reply.completion, "return a + b");
    }
}
