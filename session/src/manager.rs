use crate::store::{DetachOutcome, TokenStore};
use async_trait::async_trait;
use chrono::Utc;
use common::interface::PersistenceGateway;
use common::model::record::ContextFlushRecord;
use common::model::task::PersistTask;
use common::model::token::{ProjectRecord, SessionRecord, UserPreferences};
use errors::error::{SessionError, TokenError};
use errors::Result;
use log::{error, info, warn};
use metrics::counter;
use queue::QueueManager;
use std::sync::Arc;
use tokio::sync::OnceCell;
use uuid::Uuid;

/// Connection-close reasons surfaced when a cascade tears tokens down.
pub const REASON_SESSION_EXPIRED: &str = "session-expired";
pub const REASON_PROJECT_ENDED: &str = "project-ended";

/// Downstream effects of token invalidation that live outside this crate
/// (closing registered connections). The registry implements this.
#[async_trait]
pub trait CascadeObserver: Send + Sync {
    async fn close_session_connections(&self, session_token: &Uuid, reason: &str);
    async fn close_project_connections(&self, project_token: &Uuid, reason: &str);
}

/// Result of authenticating a connection or request.
#[derive(Debug, Clone)]
pub struct Authz {
    pub user_id: Uuid,
    pub session_token: Uuid,
    pub project_tokens: Vec<Uuid>,
    pub preferences: UserPreferences,
}

/// Higher-level verbs over the token store: issue/validate/renew/revoke plus
/// the cleanup cascade that synchronizes dying state to durable storage (via
/// the persist queue, never inline).
pub struct AuthSessionManager {
    tokens: Arc<TokenStore>,
    gateway: Arc<dyn PersistenceGateway>,
    broker: Arc<QueueManager>,
    observer: OnceCell<Arc<dyn CascadeObserver>>,
}

impl AuthSessionManager {
    pub fn new(
        tokens: Arc<TokenStore>,
        gateway: Arc<dyn PersistenceGateway>,
        broker: Arc<QueueManager>,
    ) -> Self {
        Self {
            tokens,
            gateway,
            broker,
            observer: OnceCell::new(),
        }
    }

    /// Wires in the connection registry once it exists. Called exactly once
    /// during startup.
    pub fn set_observer(&self, observer: Arc<dyn CascadeObserver>) {
        if self.observer.set(observer).is_err() {
            warn!("Cascade observer already installed");
        }
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    // ------------------------------------------------------------------
    // Request-path verbs
    // ------------------------------------------------------------------

    /// Validates the session/project pair from raw cookies and resolves the
    /// full authorization context. Every failure maps to a distinguished
    /// rejection: missing, unknown/expired, or mismatched parent.
    pub async fn authenticate_session(
        &self,
        session_token: Option<Uuid>,
        project_token: Option<Uuid>,
    ) -> Result<Authz> {
        let session_token = session_token.ok_or(TokenError::Missing)?;
        let session = self
            .tokens
            .get_session(&session_token)
            .await?
            .ok_or(TokenError::Unknown)?;

        // The parent auth token must still exist (hierarchy invariant). If it
        // was revoked but the session record lingers, treat the session as
        // dead and let the sweep collect it.
        if self.tokens.get_auth(&session.auth_token).await?.is_none() {
            return Err(TokenError::OrphanedParent.into());
        }

        if let Some(project_token) = project_token {
            if !session.project_tokens.contains(&project_token) {
                return Err(TokenError::MismatchedParent.into());
            }
            if self.tokens.get_project(&project_token).await?.is_none() {
                return Err(TokenError::Unknown.into());
            }
        }

        Ok(Authz {
            user_id: session.user_id,
            session_token,
            project_tokens: session.project_tokens,
            preferences: session.preferences,
        })
    }

    /// Creates a session for a valid auth cookie, copying the user's
    /// preference snapshot out of the durable store.
    pub async fn acquire_session(&self, auth_token: Option<Uuid>) -> Result<Uuid> {
        let auth_token = auth_token.ok_or(TokenError::Missing)?;
        let auth = self
            .tokens
            .get_auth(&auth_token)
            .await?
            .ok_or(TokenError::Unknown)?;

        let preferences = match self.gateway.get_user(auth.user_id).await {
            Ok(Some(user)) => user.preferences,
            Ok(None) => return Err(SessionError::UserNotFound.into()),
            Err(e) => {
                // Cache-only fallback keeps login working through a store
                // outage; defaults are the conservative choice.
                warn!("User lookup failed, using default preferences: {}", e);
                UserPreferences::default()
            }
        };

        let session_token = self.tokens.issue_session(&auth_token, preferences).await?;
        info!("Session {} acquired for user {}", session_token, auth.user_id);
        Ok(session_token)
    }

    /// Attaches a project to the session; idempotent.
    pub async fn activate_project(&self, session_token: &Uuid, project_id: Uuid) -> Result<Uuid> {
        let token = self.tokens.attach_project(session_token, project_id).await?;
        counter!("project_activate_total").increment(1);
        Ok(token)
    }

    /// Explicit logout: runs the full session cascade.
    pub async fn deactivate_session(&self, session_token: &Uuid) -> Result<()> {
        self.cascade_session(session_token, REASON_SESSION_EXPIRED).await
    }

    /// Revokes an auth token and everything under it.
    pub async fn revoke_auth(&self, auth_token: &Uuid) -> Result<()> {
        let sessions = self.tokens.sessions_of_auth(auth_token).await?;
        self.tokens.delete_auth(auth_token).await?;
        for session_token in sessions {
            if let Err(e) = self
                .cascade_session(&session_token, REASON_SESSION_EXPIRED)
                .await
            {
                error!("Cascade of session {} failed: {}", session_token, e);
            }
        }
        counter!("auth_revoke_total").increment(1);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cascade
    // ------------------------------------------------------------------

    /// Tears a session down: detaches it from every project, closes its
    /// connections, flushes dying projects, and records the session end.
    /// Partial failure is surfaced so the reaper can retry.
    pub async fn cascade_session(&self, session_token: &Uuid, reason: &str) -> Result<()> {
        let outcome = match self.tokens.detach_session(session_token).await? {
            Some(outcome) => outcome,
            None => return Ok(()),
        };
        let DetachOutcome {
            session,
            dead_projects,
        } = outcome;

        if let Some(observer) = self.observer.get() {
            observer
                .close_session_connections(session_token, reason)
                .await;
        }

        let mut failures = Vec::new();

        for (project_token, project) in &dead_projects {
            if let Err(e) = self.finish_project(project_token, project, &session).await {
                warn!("Project {} cleanup failed: {}", project.project_id, e);
                failures.push(project.project_id.to_string());
            }
        }

        if let Err(e) = self
            .broker
            .enqueue_persist(PersistTask::SessionClose {
                session_id: *session_token,
                end_time: Utc::now().to_rfc3339(),
            })
            .await
        {
            warn!("Session-close persist enqueue failed: {}", e);
            failures.push(format!("session-close:{session_token}"));
        }

        counter!("session_cascade_total", "reason" => reason.to_string()).increment(1);

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SessionError::CascadeIncomplete(failures.join(",")).into())
        }
    }

    /// Last-parent-death handling for a project: close its connections and
    /// flush the multi-file context to durable storage, exactly once per
    /// (project, last change index).
    async fn finish_project(
        &self,
        project_token: &Uuid,
        project: &ProjectRecord,
        session: &SessionRecord,
    ) -> Result<()> {
        if let Some(observer) = self.observer.get() {
            // The cache record is gone by now, but the token value still
            // identifies registered connections.
            observer
                .close_project_connections(project_token, REASON_PROJECT_ENDED)
                .await;
        }

        let flush_gated = !self.tokens.config().store_multi_file_context_durably
            || !session.preferences.store_context;
        if flush_gated {
            info!(
                "Context flush for project {} skipped by preference",
                project.project_id
            );
            return Ok(());
        }

        self.broker
            .enqueue_persist(PersistTask::ContextFlush(ContextFlushRecord {
                project_id: project.project_id,
                context: project.context.clone(),
                changes: project.changes.clone(),
                last_index: project.last_index(),
            }))
            .await
            .map_err(|e| SessionError::FlushFailed(Box::new(e)))?;

        counter!("project_flush_total").increment(1);
        Ok(())
    }
}
