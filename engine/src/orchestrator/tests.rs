use super::*;
use crate::analytics::AnalyticsSink;
use crate::registry::ConnectionRegistry;
use common::model::token::{ContextChangeType, UserPreferences};
use session::{AuthSessionManager, TokenStore};
use store::MemoryGateway;
use tokio::sync::{broadcast, mpsc, watch};
use workers::{
    InferenceWorkerPool, ModelRegistry, PersistWorkerPool, RegexSecretDetector, TemplateModel,
};

struct World {
    registry: Arc<ConnectionRegistry>,
    orchestrator: Arc<Orchestrator>,
    manager: Arc<AuthSessionManager>,
    tokens: Arc<TokenStore>,
    gateway: Arc<MemoryGateway>,
    _shutdown: broadcast::Sender<()>,
    _pause: watch::Sender<bool>,
}

async fn world(config: OrchestratorConfig) -> World {
    let cache = Arc::new(cacheable::CacheService::with_backend(
        Arc::new(cacheable::LocalBackend::new()),
        "test".to_string(),
    ));
    let tokens = Arc::new(TokenStore::new(
        Arc::clone(&cache),
        common::model::config::TokenConfig::default(),
    ));
    let gateway = Arc::new(MemoryGateway::new());
    let broker = Arc::new(QueueManager::new(None, "test", 256));
    let replies = ReplyRouter::local();
    let registry = Arc::new(ConnectionRegistry::new());
    let manager = Arc::new(AuthSessionManager::new(
        Arc::clone(&tokens),
        gateway.clone(),
        Arc::clone(&broker),
    ));
    manager.set_observer(registry.clone());

    let analytics = AnalyticsSink::new(Arc::clone(&broker), 100_000);
    let detector = Arc::new(RegexSecretDetector::new());

    let orchestrator = Orchestrator::new(
        Arc::clone(&registry),
        Arc::clone(&manager),
        Arc::clone(&broker),
        Arc::clone(&replies),
        analytics,
        detector.clone(),
        config.clone(),
        Some(7),
    );
    orchestrator.start();

    let mut models = ModelRegistry::new();
    models.register(Arc::new(TemplateModel::new(
        1,
        "template-fast",
        "return a + b",
        0.92,
        Duration::from_millis(5),
    )));
    models.register(Arc::new(TemplateModel::new(
        2,
        "template-slow",
        "return sum((a, b))",
        0.48,
        Duration::from_millis(2_000),
    )));

    let (shutdown_tx, _) = broadcast::channel(4);
    let (pause_tx, pause_rx) = watch::channel(false);

    let inference = InferenceWorkerPool::new(
        Arc::clone(&broker),
        replies,
        Arc::clone(&tokens),
        Arc::new(models),
        detector,
        4,
        config.per_model_timeout_ms,
    );
    inference.start(shutdown_tx.subscribe(), pause_rx.clone());

    let persist = PersistWorkerPool::new(Arc::clone(&broker), gateway.clone(), 2, 3, 1);
    persist.start(shutdown_tx.subscribe(), pause_rx);

    World {
        registry,
        orchestrator,
        manager,
        tokens,
        gateway,
        _shutdown: shutdown_tx,
        _pause: pause_tx,
    }
}

fn quick_config() -> OrchestratorConfig {
    OrchestratorConfig {
        request_deadline_ms: 5_000,
        per_model_timeout_ms: 4_000,
        ..OrchestratorConfig::default()
    }
}

struct Client {
    connection_id: Uuid,
    sink_rx: mpsc::Receiver<Frame>,
    closer_rx: mpsc::Receiver<String>,
    session_token: Uuid,
    project_token: Uuid,
    user_id: Uuid,
}

async fn connect(world: &World) -> Client {
    let user_id = Uuid::new_v4();
    let auth = world.tokens.issue_auth(user_id).await.unwrap();
    let session_token = world
        .tokens
        .issue_session(&auth, UserPreferences::default())
        .await
        .unwrap();
    let project_token = world
        .manager
        .activate_project(&session_token, Uuid::new_v4())
        .await
        .unwrap();
    connect_bound(world, user_id, session_token, project_token).await
}

async fn connect_bound(
    world: &World,
    user_id: Uuid,
    session_token: Uuid,
    project_token: Uuid,
) -> Client {
    let connection_id = Uuid::now_v7();
    let (sink_tx, sink_rx) = mpsc::channel(64);
    let (closer_tx, closer_rx) = mpsc::channel(1);
    world
        .registry
        .register(connection_id, sink_tx, closer_tx, session_token, project_token);
    world.orchestrator.attach_connection(connection_id).await;

    Client {
        connection_id,
        sink_rx,
        closer_rx,
        session_token,
        project_token,
        user_id,
    }
}

async fn recv_frame(client: &mut Client) -> Frame {
    tokio::time::timeout(Duration::from_secs(5), client.sink_rx.recv())
        .await
        .expect("frame timeout")
        .expect("sink closed")
}

fn completion_request(request_id: Uuid, model_ids: Vec<i64>) -> Frame {
    Frame::CompletionRequest {
        request_id,
        body: CompletionRequest {
            model_ids,
            context: ContextData {
                prefix: "def add(a, b):\n  ".to_string(),
                suffix: String::new(),
                ..ContextData::default()
            },
            contextual_telemetry: ContextualTelemetry {
                version_id: 3,
                trigger_type_id: 1,
                language_id: 7,
                ..ContextualTelemetry::default()
            },
            behavioral_telemetry: BehavioralTelemetry {
                typing_speed: Some(310),
                ..BehavioralTelemetry::default()
            },
            change_indices: None,
            stop_sequences: vec![],
        },
    }
}

async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_model_completion_roundtrip() {
    let world = world(quick_config()).await;
    let mut client = connect(&world).await;

    let request_id = Uuid::now_v7();
    world
        .orchestrator
        .handle_frame(client.connection_id, completion_request(request_id, vec![1]))
        .await;

    match recv_frame(&mut client).await {
        Frame::CompletionPartial { request_id: rid, reply } => {
            assert_eq!(rid, request_id);
            assert_eq!(reply.model_id, 1);
            assert_eq!(reply.completion, "return a + b");
            assert!((reply.confidence - 0.92).abs() < 1e-9);
        }
        other => panic!("expected partial, got {other:?}"),
    }
    match recv_frame(&mut client).await {
        Frame::CompletionFinal {
            request_id: rid,
            received,
            timed_out,
            ..
        } => {
            assert_eq!(rid, request_id);
            assert_eq!(received, vec![1]);
            assert!(timed_out.is_empty());
        }
        other => panic!("expected final, got {other:?}"),
    }

    // Exactly one generation row keyed (request, model 1), one meta-query
    // row, and the telemetry envelope.
    let gateway = world.gateway.clone();
    wait_for(|| {
        let gateway = gateway.clone();
        async move { gateway.generation_count().await == 1 }
    })
    .await;
    let generation = world.gateway.generation(request_id, 1).await.unwrap();
    assert_eq!(generation.completion, "return a + b");
    let meta = world.gateway.meta_query(request_id).await.unwrap();
    assert_eq!(meta.user_id, client.user_id);
    assert!(!meta.deadline_fired);
    assert!(!meta.orphaned);

    let gateway = world.gateway.clone();
    wait_for(|| {
        let gateway = gateway.clone();
        async move { gateway.telemetry_count().await >= 1 }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_model_race_with_deadline() {
    let config = OrchestratorConfig {
        request_deadline_ms: 600,
        per_model_timeout_ms: 500,
        ..OrchestratorConfig::default()
    };
    let world = world(config).await;
    let mut client = connect(&world).await;

    let request_id = Uuid::now_v7();
    world
        .orchestrator
        .handle_frame(client.connection_id, completion_request(request_id, vec![1, 2]))
        .await;

    // Model 1 answers quickly.
    match recv_frame(&mut client).await {
        Frame::CompletionPartial { reply, .. } => assert_eq!(reply.model_id, 1),
        other => panic!("expected partial, got {other:?}"),
    }

    // Model 2 is still running when the worker timeout fires; its slot comes
    // back as an error partial, and the final frame follows.
    let mut timed_out_models = Vec::new();
    loop {
        match recv_frame(&mut client).await {
            Frame::CompletionPartial { reply, .. } => {
                assert_eq!(reply.model_id, 2);
                assert_eq!(reply.error.as_deref(), Some("timeout"));
            }
            Frame::CompletionFinal { received, timed_out, .. } => {
                assert!(received.contains(&1));
                timed_out_models = timed_out;
                break;
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    let gateway = world.gateway.clone();
    wait_for(|| {
        let gateway = gateway.clone();
        async move { gateway.meta_query_count().await == 1 }
    })
    .await;

    // Persisted generations never include a model that produced nothing.
    let slow = world.gateway.generation(request_id, 2).await;
    match slow {
        None => assert_eq!(timed_out_models, vec![2]),
        Some(row) => assert!(row.error.is_some()),
    }
    let fast = world.gateway.generation(request_id, 1).await.unwrap();
    assert!(fast.error.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_revocation_mid_stream() {
    let config = OrchestratorConfig {
        request_deadline_ms: 1_000,
        per_model_timeout_ms: 900,
        ..OrchestratorConfig::default()
    };
    let world = world(config).await;
    let mut client = connect(&world).await;

    let request_id = Uuid::now_v7();
    world
        .orchestrator
        .handle_frame(client.connection_id, completion_request(request_id, vec![2]))
        .await;

    // Revoke while the slow model is still generating.
    world
        .manager
        .deactivate_session(&client.session_token)
        .await
        .unwrap();

    // Connection closed with the session-expired reason.
    let reason = tokio::time::timeout(Duration::from_secs(2), client.closer_rx.recv())
        .await
        .expect("close timeout")
        .expect("closer dropped");
    assert_eq!(reason, "session-expired");
    assert!(!world.registry.is_alive(&client.connection_id));

    // The query is still persisted, marked orphaned, with the user id.
    let gateway = world.gateway.clone();
    wait_for(|| {
        let gateway = gateway.clone();
        async move { gateway.meta_query(request_id).await.is_some() }
    })
    .await;
    let meta = world.gateway.meta_query(request_id).await.unwrap();
    assert!(meta.orphaned);
    assert_eq!(meta.user_id, client.user_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_project_broadcast_reaches_collaborators_only() {
    let world = world(quick_config()).await;
    let mut a = connect(&world).await;
    let mut b =
        connect_bound(&world, a.user_id, a.session_token, a.project_token).await;
    let mut other = connect(&world).await;

    let request_id = Uuid::now_v7();
    world
        .orchestrator
        .handle_frame(
            a.connection_id,
            Frame::ContextUpdate {
                request_id,
                file_path: "src/foo.py".to_string(),
                change: ContextChange {
                    change_type: ContextChangeType::Insert,
                    start_line: 0,
                    end_line: 0,
                    new_lines: vec!["x = 1".to_string()],
                },
            },
        )
        .await;

    let ack = recv_frame(&mut a).await;
    let broadcast = recv_frame(&mut b).await;
    match (&ack, &broadcast) {
        (
            Frame::ContextBroadcast {
                change_index: ack_index,
                file_path,
                ..
            },
            Frame::ContextBroadcast {
                change_index: b_index,
                ..
            },
        ) => {
            assert_eq!(ack_index, b_index);
            assert_eq!(file_path, "src/foo.py");
        }
        other => panic!("unexpected frames {other:?}"),
    }

    // An unrelated project sees nothing.
    assert!(other.sink_rx.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_feedback_replay_is_idempotent() {
    let world = world(quick_config()).await;
    let mut client = connect(&world).await;

    let request_id = Uuid::now_v7();
    world
        .orchestrator
        .handle_frame(client.connection_id, completion_request(request_id, vec![1]))
        .await;
    recv_frame(&mut client).await;
    recv_frame(&mut client).await;

    let gateway = world.gateway.clone();
    wait_for(|| {
        let gateway = gateway.clone();
        async move { gateway.generation_count().await == 1 }
    })
    .await;

    let feedback = || Frame::CompletionFeedback {
        request_id,
        model_id: 1,
        accepted: true,
        shown_at: vec!["2026-08-02T10:00:00Z".to_string()],
        ground_truth: None,
    };
    world
        .orchestrator
        .handle_frame(client.connection_id, feedback())
        .await;
    world
        .orchestrator
        .handle_frame(client.connection_id, feedback())
        .await;

    let gateway = world.gateway.clone();
    wait_for(|| {
        let gateway = gateway.clone();
        async move {
            gateway
                .generation(request_id, 1)
                .await
                .map(|g| g.was_accepted)
                .unwrap_or(false)
        }
    })
    .await;

    let row = world.gateway.generation(request_id, 1).await.unwrap();
    assert!(row.was_accepted);
    // One original shown-at stamp plus the single deduplicated feedback one.
    assert_eq!(row.shown_at.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_model_ids_collapse() {
    let world = world(quick_config()).await;
    let mut client = connect(&world).await;

    let request_id = Uuid::now_v7();
    world
        .orchestrator
        .handle_frame(
            client.connection_id,
            completion_request(request_id, vec![1, 1, 1]),
        )
        .await;

    match recv_frame(&mut client).await {
        Frame::CompletionPartial { reply, .. } => assert_eq!(reply.model_id, 1),
        other => panic!("unexpected {other:?}"),
    }
    match recv_frame(&mut client).await {
        Frame::CompletionFinal { received, .. } => assert_eq!(received, vec![1]),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_busy_gate_hysteresis() {
    let config = OrchestratorConfig {
        request_deadline_ms: 2_000,
        per_model_timeout_ms: 1_900,
        inference_queue_high_water: 1,
        inference_queue_low_water: 0,
        ..OrchestratorConfig::default()
    };
    let world = world(config).await;
    let mut client = connect(&world).await;

    // First request occupies the only slot (slow model keeps it pending).
    world
        .orchestrator
        .handle_frame(client.connection_id, completion_request(Uuid::now_v7(), vec![2]))
        .await;

    // Second is refused with `busy`.
    let second = Uuid::now_v7();
    world
        .orchestrator
        .handle_frame(client.connection_id, completion_request(second, vec![1]))
        .await;

    match recv_frame(&mut client).await {
        Frame::Error { request_id, kind, .. } => {
            assert_eq!(kind, ClientErrorKind::Busy);
            assert_eq!(request_id, Some(second));
        }
        other => panic!("expected busy error, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_chat_streams_partials_then_final() {
    let world = world(quick_config()).await;
    let mut client = connect(&world).await;

    let request_id = Uuid::now_v7();
    world
        .orchestrator
        .handle_frame(
            client.connection_id,
            Frame::ChatRequest {
                request_id,
                chat_id: Uuid::new_v4(),
                model_ids: vec![1],
                messages: vec![ChatMessage {
                    role: common::model::ChatRole::User,
                    content: "finish this function".to_string(),
                }],
                context: ContextData::default(),
                contextual_telemetry: ContextualTelemetry::default(),
                behavioral_telemetry: BehavioralTelemetry::default(),
            },
        )
        .await;

    let mut streamed = String::new();
    loop {
        match recv_frame(&mut client).await {
            Frame::ChatPartial { delta, .. } => streamed.push_str(&delta),
            Frame::ChatFinal { reply, .. } => {
                assert_eq!(reply.completion, "return a + b");
                break;
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
    assert_eq!(streamed, "return a + b");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_expired_session_rejected_and_closed() {
    let world = world(quick_config()).await;
    let mut client = connect(&world).await;

    // Kill the hierarchy out from under the connection.
    world
        .manager
        .deactivate_session(&client.session_token)
        .await
        .unwrap();
    // The cascade already closed the connection; reconnect a raw one bound
    // to the now-dead tokens to exercise per-request revalidation.
    let mut stale =
        connect_bound(&world, client.user_id, client.session_token, client.project_token).await;

    world
        .orchestrator
        .handle_frame(stale.connection_id, completion_request(Uuid::now_v7(), vec![1]))
        .await;

    match recv_frame(&mut stale).await {
        Frame::Error { kind, .. } => assert_eq!(kind, ClientErrorKind::Unauthenticated),
        other => panic!("expected error, got {other:?}"),
    }
    let reason = stale.closer_rx.recv().await.unwrap();
    assert_eq!(reason, "session-expired");
    assert!(client.closer_rx.recv().await.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ping_pong() {
    let world = world(quick_config()).await;
    let mut client = connect(&world).await;

    world
        .orchestrator
        .handle_frame(client.connection_id, Frame::Ping {})
        .await;
    assert!(matches!(recv_frame(&mut client).await, Frame::Pong {}));
}
