use async_trait::async_trait;
use common::interface::PersistenceGateway;
use common::model::frame::{BehavioralTelemetry, ContextualTelemetry};
use common::model::record::{
    ContextFlushRecord, GenerationRecord, GroundTruthRecord, MetaQueryRecord, UserRow,
};
use errors::error::PersistError;
use errors::Result;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, UserRow>,
    configs: HashMap<i64, String>,
    meta_queries: HashMap<Uuid, MetaQueryRecord>,
    generations: HashMap<(Uuid, i64), GenerationRecord>,
    ground_truths: HashSet<(Uuid, String)>,
    telemetry: HashMap<Uuid, (Option<ContextualTelemetry>, Option<BehavioralTelemetry>)>,
    flushes: HashMap<Uuid, Option<u64>>,
    closed_sessions: HashMap<Uuid, String>,
}

/// In-memory gateway with the same idempotency contract as the Postgres
/// implementation. Tests use it to observe what the persistence pipeline
/// actually wrote and to inject transient failures.
#[derive(Default)]
pub struct MemoryGateway {
    inner: Mutex<Inner>,
    /// Number of upcoming calls that fail with a transient error.
    fail_next: AtomicU32,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    fn check_failure(&self) -> Result<()> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(PersistError::Transient("injected failure".into()).into());
        }
        Ok(())
    }

    pub async fn insert_user(&self, user: UserRow) {
        self.inner.lock().await.users.insert(user.user_id, user);
    }

    pub async fn generation_count(&self) -> usize {
        self.inner.lock().await.generations.len()
    }

    pub async fn generation(&self, request_id: Uuid, model_id: i64) -> Option<GenerationRecord> {
        self.inner
            .lock()
            .await
            .generations
            .get(&(request_id, model_id))
            .cloned()
    }

    pub async fn meta_query(&self, request_id: Uuid) -> Option<MetaQueryRecord> {
        self.inner.lock().await.meta_queries.get(&request_id).cloned()
    }

    pub async fn meta_query_count(&self) -> usize {
        self.inner.lock().await.meta_queries.len()
    }

    pub async fn ground_truth_count(&self) -> usize {
        self.inner.lock().await.ground_truths.len()
    }

    pub async fn flush_count(&self) -> usize {
        self.inner.lock().await.flushes.len()
    }

    pub async fn session_closed(&self, session_id: Uuid) -> bool {
        self.inner.lock().await.closed_sessions.contains_key(&session_id)
    }

    pub async fn telemetry_count(&self) -> usize {
        self.inner.lock().await.telemetry.len()
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<UserRow>> {
        self.check_failure()?;
        Ok(self.inner.lock().await.users.get(&user_id).cloned())
    }

    async fn load_config(&self, config_id: i64) -> Result<Option<String>> {
        Ok(self.inner.lock().await.configs.get(&config_id).cloned())
    }

    async fn upsert_user(&self, user: &UserRow) -> Result<()> {
        self.check_failure()?;
        self.inner
            .lock()
            .await
            .users
            .insert(user.user_id, user.clone());
        Ok(())
    }

    async fn create_meta_query(&self, record: &MetaQueryRecord) -> Result<()> {
        self.check_failure()?;
        self.inner
            .lock()
            .await
            .meta_queries
            .entry(record.request_id)
            .or_insert_with(|| record.clone());
        Ok(())
    }

    async fn create_generation(&self, row: &GenerationRecord) -> Result<bool> {
        self.check_failure()?;
        let mut inner = self.inner.lock().await;
        let key = (row.request_id, row.model_id);
        if inner.generations.contains_key(&key) {
            return Ok(false);
        }
        inner.generations.insert(key, row.clone());
        Ok(true)
    }

    async fn update_generation_acceptance(
        &self,
        request_id: Uuid,
        model_id: i64,
        was_accepted: bool,
        shown_at: &[String],
    ) -> Result<bool> {
        self.check_failure()?;
        let mut inner = self.inner.lock().await;
        match inner.generations.get_mut(&(request_id, model_id)) {
            Some(row) => {
                row.was_accepted = was_accepted;
                for stamp in shown_at {
                    if !row.shown_at.contains(stamp) {
                        row.shown_at.push(stamp.clone());
                    }
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn append_ground_truth(&self, row: &GroundTruthRecord) -> Result<bool> {
        self.check_failure()?;
        let mut inner = self.inner.lock().await;
        Ok(inner
            .ground_truths
            .insert((row.request_id, row.truth_timestamp.clone())))
    }

    async fn upsert_telemetry(
        &self,
        request_id: Uuid,
        contextual: Option<&ContextualTelemetry>,
        behavioral: Option<&BehavioralTelemetry>,
    ) -> Result<()> {
        self.check_failure()?;
        self.inner
            .lock()
            .await
            .telemetry
            .insert(request_id, (contextual.cloned(), behavioral.cloned()));
        Ok(())
    }

    async fn flush_project_context(&self, record: &ContextFlushRecord) -> Result<bool> {
        self.check_failure()?;
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.flushes.get(&record.project_id)
            && *existing >= record.last_index
        {
            return Ok(false);
        }
        inner.flushes.insert(record.project_id, record.last_index);
        Ok(true)
    }

    async fn close_session(&self, session_id: Uuid, end_time: &str) -> Result<()> {
        self.check_failure()?;
        self.inner
            .lock()
            .await
            .closed_sessions
            .entry(session_id)
            .or_insert_with(|| end_time.to_string());
        Ok(())
    }

    async fn query_owner(&self, request_id: Uuid) -> Result<Option<Uuid>> {
        Ok(self
            .inner
            .lock()
            .await
            .meta_queries
            .get(&request_id)
            .map(|r| r.user_id))
    }
}
