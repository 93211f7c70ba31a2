use crate::local::LocalQueue;
use crate::manager::QueueManager;
use crate::reply::ReplyRouter;
use crate::{Identifiable, MqBackend};
use common::model::frame::ModelReply;
use common::model::task::{
    InferenceTask, InferenceTaskKind, PersistTask, ReplyEnvelope, ReplyPayload, reply_channel,
};
use common::model::{BehavioralTelemetry, ContextualTelemetry};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

fn sample_task() -> InferenceTask {
    InferenceTask {
        id: Uuid::now_v7(),
        kind: InferenceTaskKind::Completion,
        request_id: Uuid::now_v7(),
        user_id: Uuid::new_v4(),
        session_token: Uuid::new_v4(),
        project_token: Uuid::new_v4(),
        model_ids: vec![1, 2],
        context: Default::default(),
        stop_sequences: vec![],
        chat_id: None,
        messages: vec![],
        multi_file_context: BTreeMap::new(),
        contextual_telemetry: ContextualTelemetry::default(),
        behavioral_telemetry: BehavioralTelemetry::default(),
        preferences: Default::default(),
        reply_channel: reply_channel(&Uuid::new_v4()),
        enqueued_at_ms: 0,
    }
}

#[tokio::test]
async fn test_local_backend_roundtrip() {
    let backend = LocalQueue::new(100);
    let manager = QueueManager::new(Some(backend), "test", 100);
    manager.subscribe();

    let task = sample_task();
    let task_id = task.get_id();
    manager.enqueue_inference(task).await.unwrap();

    let receiver = manager.inference_receiver();
    let mut rx = receiver.lock().await;
    let queued = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed");

    assert_eq!(queued.item.get_id(), task_id);
    queued.ack().await;
}

#[tokio::test]
async fn test_local_backend_nack_dead_letters() {
    let backend = LocalQueue::new(100);
    backend.publish("t", b"{not json").await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    backend.subscribe("t", tx).await.unwrap();

    let msg = rx.recv().await.unwrap();
    msg.nack("unparseable").await.unwrap();

    // The drain task settles asynchronously.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let dlq = backend.read_dlq("t", 10).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].2, "unparseable");
}

#[tokio::test]
async fn test_manager_depth_tracking() {
    let backend = LocalQueue::new(100);
    let manager = QueueManager::new(Some(backend), "depth", 100);

    manager.enqueue_persist(PersistTask::SessionClose {
        session_id: Uuid::new_v4(),
        end_time: "2026-01-01T00:00:00Z".to_string(),
    })
    .await
    .unwrap();

    assert_eq!(manager.persist_depth().await, 1);
}

#[tokio::test]
async fn test_reply_router_local_affinity() {
    let router = ReplyRouter::local();
    let conn_a = Uuid::new_v4();
    let conn_b = Uuid::new_v4();

    let mut rx_a = router.register(&reply_channel(&conn_a)).await;
    let mut rx_b = router.register(&reply_channel(&conn_b)).await;

    let envelope = ReplyEnvelope {
        request_id: Uuid::now_v7(),
        payload: ReplyPayload::Model(ModelReply {
            model_id: 1,
            completion: "return a + b".to_string(),
            confidence: 0.92,
            logprobs: vec![-0.05],
            generation_time_ms: 120,
            error: None,
        }),
    };

    router
        .publish(&reply_channel(&conn_a), &envelope)
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_millis(200), rx_a.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.request_id, envelope.request_id);

    // The other connection sees nothing.
    assert!(
        tokio::time::timeout(Duration::from_millis(100), rx_b.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_reply_router_drops_unowned() {
    let router = ReplyRouter::local();
    let envelope = ReplyEnvelope {
        request_id: Uuid::now_v7(),
        payload: ReplyPayload::InferenceComplete {},
    };
    // No registration: publish must be a silent no-op.
    router
        .publish(&reply_channel(&Uuid::new_v4()), &envelope)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unregister_stops_delivery() {
    let router = ReplyRouter::local();
    let conn = Uuid::new_v4();
    let channel = reply_channel(&conn);

    let mut rx = router.register(&channel).await;
    router.unregister(&channel).await;

    let envelope = ReplyEnvelope {
        request_id: Uuid::now_v7(),
        payload: ReplyPayload::InferenceComplete {},
    };
    router.publish(&channel, &envelope).await.unwrap();

    assert!(rx.recv().await.is_none());
}
