use crate::orchestrator::Orchestrator;
use crate::registry::ConnectionRegistry;
use common::model::config::OrchestratorConfig;
use queue::QueueManager;
use session::AuthSessionManager;
use std::sync::Arc;
use utils::rate_limit::SlidingWindowRateLimiter;

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    pub manager: Arc<AuthSessionManager>,
    pub registry: Arc<ConnectionRegistry>,
    pub broker: Arc<QueueManager>,
    pub limiter: Arc<SlidingWindowRateLimiter>,
    pub orchestrator_config: OrchestratorConfig,
    /// Cookie Max-Age values come from the token TTLs.
    pub session_ttl: u64,
    pub auth_ttl: u64,
}
