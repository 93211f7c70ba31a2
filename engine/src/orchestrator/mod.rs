#[cfg(test)]
mod tests;

use crate::analytics::AnalyticsSink;
use crate::registry::ConnectionRegistry;
use common::interface::SecretDetector;
use common::model::config::OrchestratorConfig;
use common::model::frame::{
    BehavioralTelemetry, ChatMessage, ClientErrorKind, CompletionRequest, ContextData,
    ContextualTelemetry, Frame, ModelReply,
};
use common::model::record::{GenerationRecord, GroundTruthRecord, MetaQueryRecord, QueryKind};
use common::model::task::{
    InferenceTask, InferenceTaskKind, PersistTask, ReplyEnvelope, ReplyPayload, reply_channel,
};
use common::model::token::{ContextChange, UserPreferences};
use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info, warn};
use metrics::{counter, histogram};
use queue::{QueueManager, ReplyRouter};
use session::AuthSessionManager;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// In-memory record of one outstanding client request: which models are
/// expected, which have reported, and when the deadline seals it regardless.
pub struct PendingRequest {
    pub request_id: Uuid,
    pub connection_id: Uuid,
    pub kind: QueryKind,
    pub user_id: Uuid,
    pub session_token: Uuid,
    pub project_token: Uuid,
    pub chat_id: Option<Uuid>,
    pub expected: Vec<i64>,
    pub received: Vec<ModelReply>,
    pub context: ContextData,
    pub contextual_telemetry: ContextualTelemetry,
    pub behavioral_telemetry: BehavioralTelemetry,
    pub change_index: Option<u64>,
    pub preferences: UserPreferences,
    pub enqueued_at: Instant,
    pub deadline: Instant,
}

/// Accepts framed messages from connections, authorizes them against the
/// token hierarchy, fans work out to the broker, and correlates per-model
/// replies back to the originating connection.
///
/// Single owner of the pending-request table; reply channels are routed by
/// connection ownership, so no cross-process coordination is ever needed
/// here.
pub struct Orchestrator {
    registry: Arc<ConnectionRegistry>,
    manager: Arc<AuthSessionManager>,
    broker: Arc<QueueManager>,
    replies: Arc<ReplyRouter>,
    analytics: Arc<AnalyticsSink>,
    detector: Arc<dyn SecretDetector>,
    pending: DashMap<Uuid, PendingRequest>,
    pumps: DashMap<Uuid, JoinHandle<()>>,
    inflight: AtomicUsize,
    busy: AtomicBool,
    draining: AtomicBool,
    config: OrchestratorConfig,
    server_version_id: Option<i64>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        manager: Arc<AuthSessionManager>,
        broker: Arc<QueueManager>,
        replies: Arc<ReplyRouter>,
        analytics: Arc<AnalyticsSink>,
        detector: Arc<dyn SecretDetector>,
        config: OrchestratorConfig,
        server_version_id: Option<i64>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            manager,
            broker,
            replies,
            analytics,
            detector,
            pending: DashMap::new(),
            pumps: DashMap::new(),
            inflight: AtomicUsize::new(0),
            busy: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            config,
            server_version_id,
        })
    }

    /// Spawns the deadline sweeper. Deadlines only seal requests; in-flight
    /// inference is never cancelled, its late replies are simply dropped.
    pub fn start(self: &Arc<Self>) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(100));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                orchestrator.sweep_deadlines().await;
            }
        });
    }

    /// Stops admitting new requests; outstanding ones run to their deadline.
    pub fn drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
        info!("Orchestrator draining: new requests refused");
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Claims the connection's reply channel and starts pumping envelopes
    /// from it into the correlation logic.
    pub async fn attach_connection(self: &Arc<Self>, connection_id: Uuid) {
        let channel = reply_channel(&connection_id);
        let mut rx = self.replies.register(&channel).await;
        let orchestrator = Arc::clone(self);
        let pump = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                orchestrator.handle_reply(envelope).await;
            }
        });
        self.pumps.insert(connection_id, pump);
    }

    /// Tears the connection down. Pending requests survive: their results
    /// are discarded at delivery, but the query is still persisted (as
    /// orphaned) when it closes.
    pub async fn detach_connection(&self, connection_id: &Uuid) {
        self.replies.unregister(&reply_channel(connection_id)).await;
        if let Some((_, pump)) = self.pumps.remove(connection_id) {
            pump.abort();
        }
        self.registry.unregister(connection_id);
    }

    // ------------------------------------------------------------------
    // Inbound frames
    // ------------------------------------------------------------------

    pub async fn handle_frame(&self, connection_id: Uuid, frame: Frame) {
        match frame {
            Frame::CompletionRequest { request_id, body } => {
                self.handle_completion(connection_id, request_id, body).await;
            }
            Frame::ChatRequest {
                request_id,
                chat_id,
                model_ids,
                messages,
                context,
                contextual_telemetry,
                behavioral_telemetry,
            } => {
                self.handle_chat(
                    connection_id,
                    request_id,
                    chat_id,
                    model_ids,
                    messages,
                    context,
                    contextual_telemetry,
                    behavioral_telemetry,
                )
                .await;
            }
            Frame::CompletionFeedback {
                request_id,
                model_id,
                accepted,
                shown_at,
                ground_truth,
            } => {
                self.handle_feedback(
                    connection_id,
                    request_id,
                    model_id,
                    accepted,
                    shown_at,
                    ground_truth,
                )
                .await;
            }
            Frame::ContextUpdate {
                request_id,
                file_path,
                change,
            } => {
                self.handle_context_update(connection_id, request_id, file_path, change)
                    .await;
            }
            Frame::Ping {} => {
                self.send(&connection_id, Frame::Pong {});
            }
            other => {
                debug!("Client sent a server-only frame: {other:?}");
                self.send(
                    &connection_id,
                    Frame::error(
                        other.request_id(),
                        ClientErrorKind::InvalidRequest,
                        "unexpected frame type",
                    ),
                );
            }
        }
    }

    async fn handle_completion(
        &self,
        connection_id: Uuid,
        request_id: Uuid,
        body: CompletionRequest,
    ) {
        if self.draining.load(Ordering::SeqCst) {
            self.send(
                &connection_id,
                Frame::error(Some(request_id), ClientErrorKind::Internal, "shutting down"),
            );
            return;
        }
        if !self.admit() {
            counter!("orchestrator_rejected_total", "cause" => "busy").increment(1);
            self.send(
                &connection_id,
                Frame::error(
                    Some(request_id),
                    ClientErrorKind::Busy,
                    "inference queue saturated, retry shortly",
                ),
            );
            return;
        }

        let Some(authz) = self.authorize(&connection_id, Some(request_id)).await else {
            return;
        };

        let mut model_ids = dedupe(body.model_ids);
        if model_ids.is_empty() {
            model_ids = self.config.default_model_ids.clone();
        }
        if model_ids.is_empty() {
            self.send(
                &connection_id,
                Frame::error(
                    Some(request_id),
                    ClientErrorKind::InvalidRequest,
                    "no models requested",
                ),
            );
            return;
        }

        self.analytics
            .emit(
                authz.user_id,
                request_id,
                Some(body.contextual_telemetry.clone()),
                Some(body.behavioral_telemetry.clone()),
            )
            .await;

        self.dispatch(
            connection_id,
            request_id,
            QueryKind::Completion,
            authz,
            model_ids,
            body.context,
            body.stop_sequences,
            None,
            Vec::new(),
            body.contextual_telemetry,
            body.behavioral_telemetry,
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_chat(
        &self,
        connection_id: Uuid,
        request_id: Uuid,
        chat_id: Uuid,
        model_ids: Vec<i64>,
        messages: Vec<ChatMessage>,
        context: ContextData,
        contextual_telemetry: ContextualTelemetry,
        behavioral_telemetry: BehavioralTelemetry,
    ) {
        if self.draining.load(Ordering::SeqCst) {
            self.send(
                &connection_id,
                Frame::error(Some(request_id), ClientErrorKind::Internal, "shutting down"),
            );
            return;
        }
        if !self.admit() {
            self.send(
                &connection_id,
                Frame::error(
                    Some(request_id),
                    ClientErrorKind::Busy,
                    "inference queue saturated, retry shortly",
                ),
            );
            return;
        }

        let Some(authz) = self.authorize(&connection_id, Some(request_id)).await else {
            return;
        };

        // Chat is single-model; extra ids are dropped silently like
        // duplicate ids elsewhere.
        let model_ids: Vec<i64> = dedupe(model_ids).into_iter().take(1).collect();
        if model_ids.is_empty() {
            self.send(
                &connection_id,
                Frame::error(
                    Some(request_id),
                    ClientErrorKind::InvalidRequest,
                    "no models requested",
                ),
            );
            return;
        }

        self.analytics
            .emit(
                authz.user_id,
                request_id,
                Some(contextual_telemetry.clone()),
                Some(behavioral_telemetry.clone()),
            )
            .await;

        self.dispatch(
            connection_id,
            request_id,
            QueryKind::Chat,
            authz,
            model_ids,
            context,
            Vec::new(),
            Some(chat_id),
            messages,
            contextual_telemetry,
            behavioral_telemetry,
        )
        .await;
    }

    /// Materializes the pending record and enqueues the inference task.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        connection_id: Uuid,
        request_id: Uuid,
        kind: QueryKind,
        authz: ConnectionAuthz,
        model_ids: Vec<i64>,
        context: ContextData,
        stop_sequences: Vec<String>,
        chat_id: Option<Uuid>,
        messages: Vec<ChatMessage>,
        contextual_telemetry: ContextualTelemetry,
        behavioral_telemetry: BehavioralTelemetry,
    ) {
        // Multi-file context snapshot at the newest change index.
        let (multi_file_context, change_index) = match self
            .manager
            .tokens()
            .get_project(&authz.project_token)
            .await
        {
            Ok(Some(project)) => (project.snapshot(), project.last_index()),
            _ => (Default::default(), None),
        };

        let now = Instant::now();
        let pending = PendingRequest {
            request_id,
            connection_id,
            kind,
            user_id: authz.user_id,
            session_token: authz.session_token,
            project_token: authz.project_token,
            chat_id,
            expected: model_ids.clone(),
            received: Vec::new(),
            context: context.clone(),
            contextual_telemetry: contextual_telemetry.clone(),
            behavioral_telemetry: behavioral_telemetry.clone(),
            change_index,
            preferences: authz.preferences.clone(),
            enqueued_at: now,
            deadline: now + Duration::from_millis(self.config.request_deadline_ms),
        };

        if self.pending.insert(request_id, pending).is_some() {
            // Client reused an open request id; the old record is replaced
            // and its late replies will be dropped.
            warn!("Request id {} reused while still pending", request_id);
        } else {
            self.inflight.fetch_add(1, Ordering::SeqCst);
        }

        let task = InferenceTask {
            id: Uuid::now_v7(),
            kind: match kind {
                QueryKind::Completion => InferenceTaskKind::Completion,
                QueryKind::Chat => InferenceTaskKind::Chat,
            },
            request_id,
            user_id: authz.user_id,
            session_token: authz.session_token,
            project_token: authz.project_token,
            model_ids,
            context,
            stop_sequences,
            chat_id,
            messages,
            multi_file_context,
            contextual_telemetry,
            behavioral_telemetry,
            preferences: authz.preferences,
            reply_channel: reply_channel(&connection_id),
            enqueued_at_ms: Utc::now().timestamp_millis() as u64,
        };

        if let Err(e) = self.broker.enqueue_inference(task).await {
            warn!("Inference enqueue failed for {}: {}", request_id, e);
            if self.pending.remove(&request_id).is_some() {
                self.inflight.fetch_sub(1, Ordering::SeqCst);
            }
            self.send(
                &connection_id,
                Frame::error(Some(request_id), ClientErrorKind::Internal, "dispatch failed"),
            );
            return;
        }

        counter!("orchestrator_dispatch_total", "kind" => match kind {
            QueryKind::Completion => "completion",
            QueryKind::Chat => "chat",
        })
        .increment(1);
    }

    async fn handle_feedback(
        &self,
        connection_id: Uuid,
        request_id: Uuid,
        model_id: i64,
        accepted: bool,
        shown_at: Vec<String>,
        ground_truth: Option<String>,
    ) {
        let Some(authz) = self.authorize(&connection_id, Some(request_id)).await else {
            return;
        };

        // Fast ownership check against the in-memory record when it still
        // exists; the persistence worker re-checks against the durable row.
        if let Some(pending) = self.pending.get(&request_id)
            && pending.user_id != authz.user_id
        {
            self.send(
                &connection_id,
                Frame::error(
                    Some(request_id),
                    ClientErrorKind::Forbidden,
                    "not the owner of this request",
                ),
            );
            return;
        }

        let ground_truth = ground_truth.map(|text| GroundTruthRecord {
            request_id,
            truth_timestamp: Utc::now().to_rfc3339(),
            ground_truth: text,
        });

        let task = PersistTask::FeedbackUpdate {
            request_id,
            model_id,
            user_id: authz.user_id,
            was_accepted: accepted,
            shown_at,
            ground_truth,
        };

        // Fire and forget from the client's perspective: acceptance for
        // persistence is the whole contract, no reply frame is streamed.
        if let Err(e) = self.broker.enqueue_persist(task).await {
            warn!("Feedback enqueue failed for {}: {}", request_id, e);
        } else {
            counter!("orchestrator_feedback_total").increment(1);
        }
    }

    async fn handle_context_update(
        &self,
        connection_id: Uuid,
        request_id: Uuid,
        file_path: String,
        change: ContextChange,
    ) {
        let Some(authz) = self.authorize(&connection_id, Some(request_id)).await else {
            return;
        };

        let (change_index, record) = match self
            .manager
            .tokens()
            .update_context(&authz.project_token, &file_path, change)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!("Context update failed: {}", e);
                self.send(
                    &connection_id,
                    Frame::error(
                        Some(request_id),
                        ClientErrorKind::Internal,
                        "context update failed",
                    ),
                );
                return;
            }
        };

        let digest = content_digest(record.context.get(&file_path).map(String::as_str));
        let frame = Frame::ContextBroadcast {
            project_token: authz.project_token,
            change_index,
            file_path,
            digest,
        };

        // Ack to the originator, broadcast to every collaborator on the
        // project except it.
        self.send(&connection_id, frame.clone());
        self.registry
            .broadcast(&authz.project_token, &frame, Some(&connection_id));
        counter!("orchestrator_context_update_total").increment(1);
    }

    // ------------------------------------------------------------------
    // Replies
    // ------------------------------------------------------------------

    /// Correlates one reply envelope with its pending request. Replies for
    /// unknown (sealed or foreign) requests are dropped; redelivered model
    /// results are deduplicated on model id.
    pub async fn handle_reply(&self, envelope: ReplyEnvelope) {
        let request_id = envelope.request_id;
        let mut complete = false;

        {
            let Some(mut pending) = self.pending.get_mut(&request_id) else {
                debug!("Dropping reply for unknown request {}", request_id);
                counter!("orchestrator_reply_dropped_total").increment(1);
                return;
            };

            match envelope.payload {
                ReplyPayload::Model(reply) => {
                    if !pending.expected.contains(&reply.model_id)
                        || pending.received.iter().any(|r| r.model_id == reply.model_id)
                    {
                        debug!(
                            "Duplicate or unexpected reply for ({}, {})",
                            request_id, reply.model_id
                        );
                        return;
                    }

                    let frame = match pending.kind {
                        QueryKind::Completion => Frame::CompletionPartial {
                            request_id,
                            reply: reply.clone(),
                        },
                        QueryKind::Chat => Frame::ChatFinal {
                            request_id,
                            reply: reply.clone(),
                        },
                    };
                    pending.received.push(reply);
                    let connection_id = pending.connection_id;
                    complete = pending.received.len() == pending.expected.len();
                    drop(pending);

                    // Results for a dead connection are discarded here.
                    let _ = self.registry.deliver(&connection_id, frame);
                }
                ReplyPayload::ChatDelta { model_id, delta } => {
                    let connection_id = pending.connection_id;
                    drop(pending);
                    let _ = self.registry.deliver(
                        &connection_id,
                        Frame::ChatPartial {
                            request_id,
                            model_id,
                            delta,
                        },
                    );
                }
                ReplyPayload::InferenceComplete {} => {
                    // Worker barrier: nothing further will arrive for this
                    // request, whatever the counts say.
                    complete = true;
                }
            }
        }

        if complete {
            self.seal(request_id, false).await;
        }
    }

    async fn sweep_deadlines(&self) {
        let now = Instant::now();
        let expired: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| entry.request_id)
            .collect();

        for request_id in expired {
            debug!("Deadline fired for request {}", request_id);
            counter!("orchestrator_deadline_total").increment(1);
            self.seal(request_id, true).await;
        }
    }

    /// Closes a pending request: emits the final frame and enqueues the
    /// persist task. Runs strictly after every forwarded reply, which is the
    /// ordering contract the analytics pipeline depends on.
    async fn seal(&self, request_id: Uuid, deadline_fired: bool) {
        let Some((_, pending)) = self.pending.remove(&request_id) else {
            return;
        };
        self.inflight.fetch_sub(1, Ordering::SeqCst);

        let received_ids: Vec<i64> = pending.received.iter().map(|r| r.model_id).collect();
        let timed_out: Vec<i64> = pending
            .expected
            .iter()
            .copied()
            .filter(|id| !received_ids.contains(id))
            .collect();
        let serving_time_ms = pending.enqueued_at.elapsed().as_millis() as u64;
        histogram!("orchestrator_serving_time_ms").record(serving_time_ms as f64);

        let final_frame = match pending.kind {
            QueryKind::Completion => Some(Frame::CompletionFinal {
                request_id,
                received: received_ids,
                timed_out: timed_out.clone(),
                serving_time_ms,
            }),
            // The model reply already went out as chat.final; only a fully
            // silent chat still owes the client a terminal frame.
            QueryKind::Chat if pending.received.is_empty() => {
                let model_id = pending.expected.first().copied().unwrap_or_default();
                Some(Frame::ChatFinal {
                    request_id,
                    reply: ModelReply::failure(model_id, "timeout"),
                })
            }
            QueryKind::Chat => None,
        };
        let orphaned = !self.registry.is_alive(&pending.connection_id);
        if let Some(frame) = final_frame {
            let _ = self.registry.deliver(&pending.connection_id, frame);
        }

        // Even a zero-result request is persisted so failures stay
        // observable in analytics.
        let now_stamp = Utc::now().to_rfc3339();
        let generations: Vec<GenerationRecord> = pending
            .received
            .iter()
            .map(|reply| GenerationRecord {
                request_id,
                model_id: reply.model_id,
                completion: reply.completion.clone(),
                generation_time_ms: reply.generation_time_ms,
                confidence: reply.confidence,
                logprobs: reply.logprobs.clone(),
                shown_at: vec![now_stamp.clone()],
                was_accepted: false,
                error: reply.error.clone(),
            })
            .collect();

        let prefs = &pending.preferences;
        let meta = MetaQueryRecord {
            request_id,
            kind: pending.kind,
            user_id: pending.user_id,
            session_id: pending.session_token,
            project_id: pending.project_token,
            chat_id: pending.chat_id,
            context: prefs.store_context.then(|| self.redacted(&pending.context)),
            contextual_telemetry: prefs
                .store_contextual_telemetry
                .then(|| pending.contextual_telemetry.clone()),
            behavioral_telemetry: prefs
                .store_behavioral_telemetry
                .then(|| pending.behavioral_telemetry.clone()),
            context_change_index: pending.change_index,
            total_serving_time_ms: serving_time_ms,
            server_version_id: self.server_version_id,
            deadline_fired,
            orphaned,
        };

        if let Err(e) = self
            .broker
            .enqueue_persist(PersistTask::Query { meta, generations })
            .await
        {
            warn!("Persist enqueue failed for {}: {}", request_id, e);
        }
    }

    // ------------------------------------------------------------------
    // Authorization and admission
    // ------------------------------------------------------------------

    /// Constant-time revalidation of the connection's bound tokens. Emits
    /// the error frame itself; the connection is closed only when the cache
    /// reports its tokens evicted (or the cache itself is down).
    async fn authorize(
        &self,
        connection_id: &Uuid,
        request_id: Option<Uuid>,
    ) -> Option<ConnectionAuthz> {
        let Some((session_token, project_token)) = self.registry.binding(connection_id) else {
            return None;
        };

        match self
            .manager
            .authenticate_session(Some(session_token), Some(project_token))
            .await
        {
            Ok(authz) => {
                // Activity renews the session lease; reads never do.
                let _ = self.manager.tokens().renew_session(&session_token).await;
                Some(ConnectionAuthz {
                    user_id: authz.user_id,
                    session_token,
                    project_token,
                    preferences: authz.preferences,
                })
            }
            Err(e) if e.is_cache() => {
                warn!("Session cache unreachable during authorization: {}", e);
                self.send(
                    connection_id,
                    Frame::error(request_id, ClientErrorKind::Internal, "internal error"),
                );
                self.registry.close(connection_id, "internal");
                None
            }
            Err(e) => {
                let evicted = e.is_token();
                self.send(
                    connection_id,
                    Frame::error(
                        request_id,
                        ClientErrorKind::Unauthenticated,
                        "invalid or expired session",
                    ),
                );
                if evicted {
                    self.registry.close(connection_id, "session-expired");
                }
                debug!("Authorization failed for {}: {}", connection_id, e);
                None
            }
        }
    }

    /// Admission gate with hysteresis: refuse above the high-water mark,
    /// admit again only after draining below the low-water mark.
    fn admit(&self) -> bool {
        let inflight = self.inflight.load(Ordering::SeqCst);
        if self.busy.load(Ordering::SeqCst) {
            if inflight <= self.config.inference_queue_low_water {
                self.busy.store(false, Ordering::SeqCst);
                info!("Inference backlog drained; admitting requests again");
                true
            } else {
                false
            }
        } else if inflight >= self.config.inference_queue_high_water {
            self.busy.store(true, Ordering::SeqCst);
            warn!(
                "Inference backlog at {}; refusing new requests",
                inflight
            );
            false
        } else {
            true
        }
    }

    fn send(&self, connection_id: &Uuid, frame: Frame) {
        let _ = self.registry.deliver(connection_id, frame);
    }

    fn redacted(&self, context: &ContextData) -> ContextData {
        ContextData {
            prefix: self.detector.redact(&context.prefix),
            suffix: self.detector.redact(&context.suffix),
            file_name: context.file_name.clone(),
            selected_text: context
                .selected_text
                .as_ref()
                .map(|text| self.detector.redact(text)),
            context_files: context.context_files.clone(),
        }
    }
}

struct ConnectionAuthz {
    user_id: Uuid,
    session_token: Uuid,
    project_token: Uuid,
    preferences: UserPreferences,
}

fn dedupe(model_ids: Vec<i64>) -> Vec<i64> {
    let mut seen = Vec::new();
    for id in model_ids {
        if !seen.contains(&id) {
            seen.push(id);
        }
    }
    seen
}

fn content_digest(content: Option<&str>) -> String {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(content.unwrap_or_default().as_bytes());
    format!("{:08x}", hasher.finalize())
}
