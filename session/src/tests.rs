use crate::manager::{AuthSessionManager, CascadeObserver};
use crate::reaper::Reaper;
use crate::store::TokenStore;
use async_trait::async_trait;
use cacheable::{CacheService, LocalBackend};
use common::interface::PersistenceGateway;
use common::model::config::TokenConfig;
use common::model::record::*;
use common::model::task::PersistTask;
use common::model::token::{ContextChange, ContextChangeType, TokenKind, UserPreferences};
use errors::Result;
use queue::QueueManager;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

struct StubGateway;

#[async_trait]
impl PersistenceGateway for StubGateway {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<UserRow>> {
        Ok(Some(UserRow {
            user_id,
            email: "dev@example.com".to_string(),
            name: "Dev".to_string(),
            verified: true,
            preferences: UserPreferences::default(),
            config_id: 1,
        }))
    }
    async fn load_config(&self, _config_id: i64) -> Result<Option<String>> {
        Ok(None)
    }
    async fn upsert_user(&self, _user: &UserRow) -> Result<()> {
        Ok(())
    }
    async fn create_meta_query(&self, _record: &MetaQueryRecord) -> Result<()> {
        Ok(())
    }
    async fn create_generation(&self, _row: &GenerationRecord) -> Result<bool> {
        Ok(true)
    }
    async fn update_generation_acceptance(
        &self,
        _request_id: Uuid,
        _model_id: i64,
        _was_accepted: bool,
        _shown_at: &[String],
    ) -> Result<bool> {
        Ok(true)
    }
    async fn append_ground_truth(&self, _row: &GroundTruthRecord) -> Result<bool> {
        Ok(true)
    }
    async fn upsert_telemetry(
        &self,
        _request_id: Uuid,
        _contextual: Option<&common::model::ContextualTelemetry>,
        _behavioral: Option<&common::model::BehavioralTelemetry>,
    ) -> Result<()> {
        Ok(())
    }
    async fn flush_project_context(&self, _record: &ContextFlushRecord) -> Result<bool> {
        Ok(true)
    }
    async fn close_session(&self, _session_id: Uuid, _end_time: &str) -> Result<()> {
        Ok(())
    }
    async fn query_owner(&self, _request_id: Uuid) -> Result<Option<Uuid>> {
        Ok(None)
    }
}

struct CountingObserver {
    session_closes: AtomicUsize,
    project_closes: AtomicUsize,
}

#[async_trait]
impl CascadeObserver for CountingObserver {
    async fn close_session_connections(&self, _session_token: &Uuid, _reason: &str) {
        self.session_closes.fetch_add(1, Ordering::SeqCst);
    }
    async fn close_project_connections(&self, _project_token: &Uuid, _reason: &str) {
        self.project_closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    store: Arc<TokenStore>,
    manager: Arc<AuthSessionManager>,
    broker: Arc<QueueManager>,
    observer: Arc<CountingObserver>,
    cache: Arc<CacheService>,
}

fn harness_with(config: TokenConfig) -> Harness {
    let cache = Arc::new(CacheService::with_backend(
        Arc::new(LocalBackend::new()),
        "test".to_string(),
    ));
    let store = Arc::new(TokenStore::new(Arc::clone(&cache), config));
    let broker = Arc::new(QueueManager::new(None, "test", 100));
    let manager = Arc::new(AuthSessionManager::new(
        Arc::clone(&store),
        Arc::new(StubGateway),
        Arc::clone(&broker),
    ));
    let observer = Arc::new(CountingObserver {
        session_closes: AtomicUsize::new(0),
        project_closes: AtomicUsize::new(0),
    });
    manager.set_observer(observer.clone());
    Harness {
        store,
        manager,
        broker,
        observer,
        cache,
    }
}

fn harness() -> Harness {
    harness_with(TokenConfig::default())
}

/// Hierarchy invariants: every session's auth exists, every project has a
/// non-empty parent set of live sessions.
async fn assert_invariants(store: &TokenStore) {
    for session_token in store.all_sessions().await.unwrap() {
        let session = store.get_session(&session_token).await.unwrap().unwrap();
        assert!(
            store.get_auth(&session.auth_token).await.unwrap().is_some(),
            "session {session_token} has dead parent auth"
        );
        for project_token in &session.project_tokens {
            let project = store.get_project(project_token).await.unwrap().unwrap();
            assert!(!project.session_tokens.is_empty());
        }
    }
}

async fn drain_persist(broker: &QueueManager) -> Vec<PersistTask> {
    let receiver = broker.persist_receiver();
    let mut rx = receiver.lock().await;
    let mut tasks = Vec::new();
    while let Ok(item) = rx.try_recv() {
        tasks.push(item.item);
    }
    tasks
}

fn sample_change(lines: &[&str]) -> ContextChange {
    ContextChange {
        change_type: ContextChangeType::Insert,
        start_line: 0,
        end_line: 0,
        new_lines: lines.iter().map(|s| s.to_string()).collect(),
    }
}

#[tokio::test]
async fn test_hierarchy_issue_and_authenticate() {
    let h = harness();
    let user = Uuid::new_v4();

    let auth = h.store.issue_auth(user).await.unwrap();
    let session = h
        .store
        .issue_session(&auth, UserPreferences::default())
        .await
        .unwrap();
    let project = h
        .manager
        .activate_project(&session, Uuid::new_v4())
        .await
        .unwrap();

    let authz = h
        .manager
        .authenticate_session(Some(session), Some(project))
        .await
        .unwrap();
    assert_eq!(authz.user_id, user);
    assert_eq!(authz.project_tokens, vec![project]);

    assert_invariants(&h.store).await;
}

#[tokio::test]
async fn test_authenticate_rejections_are_distinguished() {
    let h = harness();
    let user = Uuid::new_v4();
    let auth = h.store.issue_auth(user).await.unwrap();
    let session = h
        .store
        .issue_session(&auth, UserPreferences::default())
        .await
        .unwrap();

    // Missing.
    let err = h.manager.authenticate_session(None, None).await.unwrap_err();
    assert!(err.to_string().contains("missing"));

    // Unknown.
    let err = h
        .manager
        .authenticate_session(Some(Uuid::new_v4()), None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown"));

    // Mismatched parent: a project token of someone else's session.
    let other_auth = h.store.issue_auth(Uuid::new_v4()).await.unwrap();
    let other_session = h
        .store
        .issue_session(&other_auth, UserPreferences::default())
        .await
        .unwrap();
    let foreign_project = h
        .manager
        .activate_project(&other_session, Uuid::new_v4())
        .await
        .unwrap();
    let err = h
        .manager
        .authenticate_session(Some(session), Some(foreign_project))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not bound"));
}

#[tokio::test(start_paused = true)]
async fn test_session_ttl_bounded_by_auth() {
    let config = TokenConfig {
        auth_token_ttl: 1000,
        session_token_ttl: 600,
        ..TokenConfig::default()
    };
    let h = harness_with(config);

    let auth = h.store.issue_auth(Uuid::new_v4()).await.unwrap();

    // Burn most of the auth lifetime, then open a session: it must inherit
    // the shorter remaining parent TTL.
    tokio::time::advance(Duration::from_secs(700)).await;
    let session = h
        .store
        .issue_session(&auth, UserPreferences::default())
        .await
        .unwrap();

    let ttl = h
        .cache
        .ttl(&TokenKind::Session.key(&session))
        .await
        .unwrap()
        .unwrap();
    assert!(ttl <= Duration::from_secs(300), "ttl was {ttl:?}");
}

#[tokio::test]
async fn test_project_shared_across_sessions() {
    let h = harness();
    let user = Uuid::new_v4();
    let project_id = Uuid::new_v4();

    let auth = h.store.issue_auth(user).await.unwrap();
    let s1 = h
        .store
        .issue_session(&auth, UserPreferences::default())
        .await
        .unwrap();
    let s2 = h
        .store
        .issue_session(&auth, UserPreferences::default())
        .await
        .unwrap();

    let p1 = h.manager.activate_project(&s1, project_id).await.unwrap();
    let p2 = h.manager.activate_project(&s2, project_id).await.unwrap();
    assert_eq!(p1, p2, "same project under one user must share its token");

    let record = h.store.get_project(&p1).await.unwrap().unwrap();
    assert_eq!(record.session_tokens.len(), 2);

    // First session leaves: project survives with one parent.
    h.manager.deactivate_session(&s1).await.unwrap();
    let record = h.store.get_project(&p1).await.unwrap().unwrap();
    assert_eq!(record.session_tokens, vec![s2]);
    assert_invariants(&h.store).await;

    // Last session leaves: project dies.
    h.manager.deactivate_session(&s2).await.unwrap();
    assert!(h.store.get_project(&p1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_cascade_flushes_context_exactly_once() {
    let h = harness();
    let auth = h.store.issue_auth(Uuid::new_v4()).await.unwrap();
    let session = h
        .store
        .issue_session(&auth, UserPreferences::default())
        .await
        .unwrap();
    let project = h
        .manager
        .activate_project(&session, Uuid::new_v4())
        .await
        .unwrap();

    h.store
        .update_context(&project, "src/foo.py", sample_change(&["x = 1"]))
        .await
        .unwrap();

    h.manager.deactivate_session(&session).await.unwrap();

    let tasks = drain_persist(&h.broker).await;
    let flushes: Vec<_> = tasks
        .iter()
        .filter(|t| matches!(t, PersistTask::ContextFlush(_)))
        .collect();
    assert_eq!(flushes.len(), 1, "context must flush exactly once");
    let closes: Vec<_> = tasks
        .iter()
        .filter(|t| matches!(t, PersistTask::SessionClose { .. }))
        .collect();
    assert_eq!(closes.len(), 1);

    assert_eq!(h.observer.session_closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.observer.project_closes.load(Ordering::SeqCst), 1);

    // Replay is a no-op: the session is already gone.
    h.manager.deactivate_session(&session).await.unwrap();
    assert!(drain_persist(&h.broker).await.is_empty());
}

#[tokio::test]
async fn test_flush_gated_by_preferences() {
    let h = harness();
    let auth = h.store.issue_auth(Uuid::new_v4()).await.unwrap();
    let prefs = UserPreferences {
        store_context: false,
        ..UserPreferences::default()
    };
    let session = h.store.issue_session(&auth, prefs).await.unwrap();
    let project = h
        .manager
        .activate_project(&session, Uuid::new_v4())
        .await
        .unwrap();
    h.store
        .update_context(&project, "a.py", sample_change(&["secret"]))
        .await
        .unwrap();

    h.manager.deactivate_session(&session).await.unwrap();

    let tasks = drain_persist(&h.broker).await;
    assert!(
        !tasks.iter().any(|t| matches!(t, PersistTask::ContextFlush(_))),
        "opted-out context must not be flushed"
    );
}

#[tokio::test]
async fn test_revoke_auth_cascades_all_sessions() {
    let h = harness();
    let auth = h.store.issue_auth(Uuid::new_v4()).await.unwrap();
    let s1 = h
        .store
        .issue_session(&auth, UserPreferences::default())
        .await
        .unwrap();
    let s2 = h
        .store
        .issue_session(&auth, UserPreferences::default())
        .await
        .unwrap();

    h.manager.revoke_auth(&auth).await.unwrap();

    assert!(h.store.get_auth(&auth).await.unwrap().is_none());
    assert!(h.store.get_session(&s1).await.unwrap().is_none());
    assert!(h.store.get_session(&s2).await.unwrap().is_none());
    assert_eq!(h.observer.session_closes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_context_indices_strictly_monotonic_under_contention() {
    let h = harness();
    let auth = h.store.issue_auth(Uuid::new_v4()).await.unwrap();
    let session = h
        .store
        .issue_session(&auth, UserPreferences::default())
        .await
        .unwrap();
    let project = h
        .manager
        .activate_project(&session, Uuid::new_v4())
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..4 {
        let store = Arc::clone(&h.store);
        let file = format!("f{}.py", i % 2);
        handles.push(tokio::spawn(async move {
            let mut indices = Vec::new();
            for _ in 0..10 {
                let (index, _) = store
                    .update_context(&project, &file, sample_change(&["l"]))
                    .await
                    .unwrap();
                indices.push(index);
            }
            indices
        }));
    }

    let mut all: Vec<u64> = Vec::new();
    for handle in handles {
        let indices = handle.await.unwrap();
        // Per writer, indices are strictly increasing.
        assert!(indices.windows(2).all(|w| w[0] < w[1]));
        all.extend(indices);
    }

    // Globally, every index was assigned exactly once.
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 40);
    assert_eq!(*all.last().unwrap(), 39);
}

#[tokio::test]
async fn test_one_shot_consumed_once() {
    let h = harness();
    let user = Uuid::new_v4();
    let token = h
        .store
        .issue_one_shot(TokenKind::Reset, user)
        .await
        .unwrap();

    assert_eq!(
        h.store
            .consume_one_shot(TokenKind::Reset, &token)
            .await
            .unwrap(),
        user
    );
    assert!(
        h.store
            .consume_one_shot(TokenKind::Reset, &token)
            .await
            .is_err()
    );
}

#[tokio::test(start_paused = true)]
async fn test_hook_expiry_drives_cascade() {
    let config = TokenConfig {
        auth_token_ttl: 1000,
        session_token_ttl: 300,
        hook_margin: 60,
        ..TokenConfig::default()
    };
    let h = harness_with(config);

    let auth = h.store.issue_auth(Uuid::new_v4()).await.unwrap();
    let session = h
        .store
        .issue_session(&auth, UserPreferences::default())
        .await
        .unwrap();

    let reaper = Arc::new(Reaper::new(Arc::clone(&h.cache), Arc::clone(&h.manager)));
    reaper.start().await.unwrap();

    // The session hook fires at 240s, before the record dies at 300s; the
    // cascade must run while the record is still readable.
    tokio::time::advance(Duration::from_secs(250)).await;
    // Let the janitor and listener run.
    for _ in 0..20 {
        tokio::time::advance(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
    }

    assert!(h.store.get_session(&session).await.unwrap().is_none());
    assert_eq!(h.observer.session_closes.load(Ordering::SeqCst), 1);

    let tasks = drain_persist(&h.broker).await;
    assert!(
        tasks
            .iter()
            .any(|t| matches!(t, PersistTask::SessionClose { .. }))
    );
}

#[tokio::test(start_paused = true)]
async fn test_lost_notification_recovered_by_sweep() {
    let h = harness();
    let auth = h.store.issue_auth(Uuid::new_v4()).await.unwrap();
    let session = h
        .store
        .issue_session(&auth, UserPreferences::default())
        .await
        .unwrap();

    // Simulate a lost expiration notification: the auth record vanishes
    // without any hook event being processed.
    h.store.delete_auth(&auth).await.unwrap();

    // Validation now fails closed.
    assert!(
        h.manager
            .authenticate_session(Some(session), None)
            .await
            .is_err()
    );

    // The sweep finds the orphaned session and completes the cascade.
    let reaper = Reaper::new(Arc::clone(&h.cache), Arc::clone(&h.manager));
    reaper.sweep_orphans().await.unwrap();

    assert!(h.store.get_session(&session).await.unwrap().is_none());
    assert_eq!(h.observer.session_closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_detach_orderings_preserve_invariants() {
    // Exercise create/detach interleavings across two users and a shared
    // project; invariants must hold at every observation point.
    for ordering in 0..3 {
        let h = harness();
        let auth_a = h.store.issue_auth(Uuid::new_v4()).await.unwrap();
        let auth_b = h.store.issue_auth(Uuid::new_v4()).await.unwrap();
        let sa = h
            .store
            .issue_session(&auth_a, UserPreferences::default())
            .await
            .unwrap();
        let sb = h
            .store
            .issue_session(&auth_b, UserPreferences::default())
            .await
            .unwrap();
        let pa = h.manager.activate_project(&sa, Uuid::new_v4()).await.unwrap();
        let pb = h.manager.activate_project(&sb, Uuid::new_v4()).await.unwrap();
        assert_ne!(pa, pb, "distinct users never share project tokens");
        assert_invariants(&h.store).await;

        match ordering {
            0 => {
                h.manager.deactivate_session(&sa).await.unwrap();
                assert_invariants(&h.store).await;
                h.manager.revoke_auth(&auth_b).await.unwrap();
            }
            1 => {
                h.manager.revoke_auth(&auth_a).await.unwrap();
                assert_invariants(&h.store).await;
                h.manager.deactivate_session(&sb).await.unwrap();
            }
            _ => {
                h.manager.revoke_auth(&auth_b).await.unwrap();
                assert_invariants(&h.store).await;
                h.manager.revoke_auth(&auth_a).await.unwrap();
            }
        }
        assert_invariants(&h.store).await;
        assert!(h.store.get_project(&pa).await.unwrap().is_none());
        assert!(h.store.get_project(&pb).await.unwrap().is_none());
    }
}
