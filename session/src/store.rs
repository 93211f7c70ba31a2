use cacheable::CacheService;
use chrono::Utc;
use common::model::config::TokenConfig;
use common::model::token::{
    AuthRecord, ContextChange, OneShotRecord, ProjectRecord, SessionRecord, TokenKind,
    UserPreferences,
};
use errors::error::TokenError;
use errors::{CacheError, Result};
use log::{debug, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Attempts before a compare-and-swap loop gives up. Contention on a single
/// project record is writer-vs-writer on the same user; a handful of retries
/// is plenty.
const CAS_MAX_RETRIES: usize = 8;

/// Outcome of removing a session from the hierarchy.
pub struct DetachOutcome {
    pub session: SessionRecord,
    /// Tokens and records of projects whose parent set drained; the records
    /// are returned so the caller can flush their context before the tokens
    /// are gone for good.
    pub dead_projects: Vec<(Uuid, ProjectRecord)>,
}

/// The four-level token hierarchy over the session cache. Records are JSON
/// values under `<kind>:<token>` keys; long-lived tokens get a paired hook
/// key expiring `hook_margin` seconds earlier so cascades run while the
/// record is still readable.
pub struct TokenStore {
    cache: Arc<CacheService>,
    config: TokenConfig,
}

impl TokenStore {
    pub fn new(cache: Arc<CacheService>, config: TokenConfig) -> Self {
        Self { cache, config }
    }

    pub fn cache(&self) -> &Arc<CacheService> {
        &self.cache
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    async fn read<T: DeserializeOwned>(&self, kind: TokenKind, token: &Uuid) -> Result<Option<T>> {
        let raw = self.cache.get(&kind.key(token)).await.map_err(errors::Error::from)?;
        match raw {
            Some(bytes) => {
                let record = serde_json::from_slice(&bytes)
                    .map_err(|e| TokenError::Malformed(Box::new(e)))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn write<T: Serialize>(
        &self,
        kind: TokenKind,
        token: &Uuid,
        record: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(record).map_err(CacheError::Encode)?;
        self.cache.set(&kind.key(token), &bytes, ttl).await?;

        if kind.has_hook()
            && let Some(ttl) = ttl
        {
            let hook_ttl = ttl.saturating_sub(Duration::from_secs(self.config.hook_margin));
            self.cache
                .set(&kind.hook_key(token), b"", Some(hook_ttl))
                .await?;
        }
        Ok(())
    }

    /// Rewrites a record without touching its TTL.
    async fn rewrite<T: Serialize>(&self, kind: TokenKind, token: &Uuid, record: &T) -> Result<()> {
        let bytes = serde_json::to_vec(record).map_err(CacheError::Encode)?;
        self.cache.set_keepttl(&kind.key(token), &bytes).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Auth tokens
    // ------------------------------------------------------------------

    pub async fn issue_auth(&self, user_id: Uuid) -> Result<Uuid> {
        let token = Uuid::new_v4();
        let record = AuthRecord {
            user_id,
            issued_at: Utc::now(),
        };
        self.write(
            TokenKind::Auth,
            &token,
            &record,
            Some(Duration::from_secs(self.config.auth_token_ttl)),
        )
        .await?;
        debug!("Issued auth token for user {}", user_id);
        Ok(token)
    }

    pub async fn get_auth(&self, token: &Uuid) -> Result<Option<AuthRecord>> {
        self.read(TokenKind::Auth, token).await
    }

    // ------------------------------------------------------------------
    // Session tokens
    // ------------------------------------------------------------------

    /// Creates a session under an auth token. The session can never outlive
    /// its parent: TTL is the smaller of the configured session TTL and the
    /// parent's remaining lifetime.
    pub async fn issue_session(
        &self,
        auth_token: &Uuid,
        preferences: UserPreferences,
    ) -> Result<Uuid> {
        let auth: AuthRecord = self
            .read(TokenKind::Auth, auth_token)
            .await?
            .ok_or(TokenError::Unknown)?;

        let ttl = self.session_ttl(auth_token).await?;

        let token = Uuid::new_v4();
        let record = SessionRecord {
            auth_token: *auth_token,
            user_id: auth.user_id,
            project_tokens: Vec::new(),
            preferences,
        };
        self.write(TokenKind::Session, &token, &record, Some(ttl)).await?;
        Ok(token)
    }

    async fn session_ttl(&self, auth_token: &Uuid) -> Result<Duration> {
        let auth_remaining = self
            .cache
            .ttl(&TokenKind::Auth.key(auth_token))
            .await
            .map_err(errors::Error::from)?
            .unwrap_or(Duration::from_secs(self.config.auth_token_ttl));
        Ok(auth_remaining.min(Duration::from_secs(self.config.session_token_ttl)))
    }

    pub async fn get_session(&self, token: &Uuid) -> Result<Option<SessionRecord>> {
        self.read(TokenKind::Session, token).await
    }

    /// Activity-driven renewal: re-arms the session TTL (still bounded by the
    /// parent auth token) and its hook. Reads never refresh TTLs; only this
    /// explicit call does.
    pub async fn renew_session(&self, token: &Uuid) -> Result<()> {
        let record: SessionRecord = self
            .read(TokenKind::Session, token)
            .await?
            .ok_or(TokenError::Unknown)?;
        let ttl = self.session_ttl(&record.auth_token).await?;
        self.write(TokenKind::Session, token, &record, Some(ttl)).await
    }

    // ------------------------------------------------------------------
    // Project tokens
    // ------------------------------------------------------------------

    fn project_index_key(project_id: &Uuid) -> String {
        format!("project_index:{project_id}")
    }

    /// Attaches a project to a session. If a live ProjectToken already exists
    /// for this project it is shared (the session joins its parent set);
    /// otherwise a fresh token is created. Idempotent per (session, project).
    pub async fn attach_project(&self, session_token: &Uuid, project_id: Uuid) -> Result<Uuid> {
        let mut session: SessionRecord = self
            .read(TokenKind::Session, session_token)
            .await?
            .ok_or(TokenError::Unknown)?;

        let index_key = Self::project_index_key(&project_id);

        for _ in 0..CAS_MAX_RETRIES {
            // Fast path: the index points at a live shared token.
            if let Some(raw) = self.cache.get(&index_key).await.map_err(errors::Error::from)? {
                let token = Uuid::from_slice(&raw)
                    .map_err(|e| TokenError::Malformed(Box::new(e)))?;

                match self.cas_update_project(&token, |project| {
                    if !project.session_tokens.contains(session_token) {
                        project.session_tokens.push(*session_token);
                    }
                })
                .await
                {
                    Ok(_) => {
                        self.link_project_to_session(&mut session, session_token, &token)
                            .await?;
                        return Ok(token);
                    }
                    Err(e) if e.is_token() => {
                        // Stale index: the record died underneath it.
                        self.cache.del(&index_key).await.map_err(errors::Error::from)?;
                    }
                    Err(e) => return Err(e),
                }
            }

            // Create a fresh token and claim the index.
            let token = Uuid::new_v4();
            let record = ProjectRecord::new(project_id, session.user_id, *session_token);
            self.write(TokenKind::Project, &token, &record, None).await?;

            let claimed = self
                .cache
                .set_nx(&index_key, token.as_bytes(), None)
                .await
                .map_err(errors::Error::from)?;
            if claimed {
                self.link_project_to_session(&mut session, session_token, &token)
                    .await?;
                return Ok(token);
            }

            // Lost the race; discard ours and join the winner next round.
            self.cache
                .del(&TokenKind::Project.key(&token))
                .await
                .map_err(errors::Error::from)?;
        }

        Err(CacheError::Conflict(index_key).into())
    }

    async fn link_project_to_session(
        &self,
        session: &mut SessionRecord,
        session_token: &Uuid,
        project_token: &Uuid,
    ) -> Result<()> {
        if !session.project_tokens.contains(project_token) {
            session.project_tokens.push(*project_token);
            self.rewrite(TokenKind::Session, session_token, session).await?;
        }
        Ok(())
    }

    pub async fn get_project(&self, token: &Uuid) -> Result<Option<ProjectRecord>> {
        self.read(TokenKind::Project, token).await
    }

    /// Compare-and-swap update of a project record. `mutate` runs on a fresh
    /// copy each attempt; conflicting writers retry against the new value.
    pub async fn cas_update_project<F>(&self, token: &Uuid, mut mutate: F) -> Result<ProjectRecord>
    where
        F: FnMut(&mut ProjectRecord),
    {
        let key = TokenKind::Project.key(token);
        for _ in 0..CAS_MAX_RETRIES {
            let raw = self
                .cache
                .get(&key)
                .await
                .map_err(errors::Error::from)?
                .ok_or(TokenError::Unknown)?;
            let mut record: ProjectRecord = serde_json::from_slice(&raw)
                .map_err(|e| TokenError::Malformed(Box::new(e)))?;

            mutate(&mut record);

            let new_raw = serde_json::to_vec(&record).map_err(CacheError::Encode)?;
            if self
                .cache
                .compare_swap(&key, &raw, &new_raw)
                .await
                .map_err(errors::Error::from)?
            {
                return Ok(record);
            }
            metrics::counter!("token_cas_conflict_total").increment(1);
        }
        Err(CacheError::Conflict(key).into())
    }

    /// Appends one context change to a project, returning the assigned
    /// monotonic index. Indices are totally ordered per project because the
    /// record itself is the serialization point.
    pub async fn update_context(
        &self,
        project_token: &Uuid,
        file_path: &str,
        change: ContextChange,
    ) -> Result<(u64, ProjectRecord)> {
        let cap = self.config.context_changelog_cap;
        let mut assigned = 0u64;
        let record = self
            .cas_update_project(project_token, |project| {
                assigned = project.apply_change(file_path, change.clone(), cap);
            })
            .await?;
        Ok((assigned, record))
    }

    /// Removes a session from the hierarchy: every child project loses this
    /// parent, projects whose parent set drains are deleted (their records
    /// are handed back for flushing), and the session itself is removed.
    pub async fn detach_session(&self, session_token: &Uuid) -> Result<Option<DetachOutcome>> {
        let session: SessionRecord = match self.read(TokenKind::Session, session_token).await? {
            Some(record) => record,
            None => return Ok(None),
        };

        let mut dead_projects = Vec::new();

        for project_token in &session.project_tokens {
            match self
                .cas_update_project(project_token, |project| {
                    project.session_tokens.retain(|t| t != session_token);
                })
                .await
            {
                Ok(record) => {
                    if record.session_tokens.is_empty() {
                        self.cache
                            .del_batch(&[
                                TokenKind::Project.key(project_token).as_str(),
                                Self::project_index_key(&record.project_id).as_str(),
                            ])
                            .await
                            .map_err(errors::Error::from)?;
                        dead_projects.push((*project_token, record));
                    }
                }
                Err(e) if e.is_token() => {
                    // Already gone; nothing to detach.
                    debug!("Project {} vanished during detach", project_token);
                }
                Err(e) => {
                    warn!("Detach of project {} failed: {}", project_token, e);
                    return Err(e);
                }
            }
        }

        self.cache
            .del_batch(&[
                TokenKind::Session.key(session_token).as_str(),
                TokenKind::Session.hook_key(session_token).as_str(),
            ])
            .await
            .map_err(errors::Error::from)?;

        Ok(Some(DetachOutcome {
            session,
            dead_projects,
        }))
    }

    pub async fn delete_auth(&self, auth_token: &Uuid) -> Result<()> {
        self.cache
            .del_batch(&[
                TokenKind::Auth.key(auth_token).as_str(),
                TokenKind::Auth.hook_key(auth_token).as_str(),
            ])
            .await
            .map_err(errors::Error::from)?;
        Ok(())
    }

    /// All live sessions whose parent is `auth_token`. Cache scan; only the
    /// cascade path uses it.
    pub async fn sessions_of_auth(&self, auth_token: &Uuid) -> Result<Vec<Uuid>> {
        let keys = self
            .cache
            .keys_with_limit(&format!("{}:*", TokenKind::Session.prefix()), 10_000)
            .await
            .map_err(errors::Error::from)?;

        let mut sessions = Vec::new();
        for key in keys {
            let Some(token_str) = key.strip_prefix("session_token:") else {
                continue;
            };
            let Ok(token) = Uuid::parse_str(token_str) else {
                continue;
            };
            if let Some(record) = self.get_session(&token).await? {
                if record.auth_token == *auth_token {
                    sessions.push(token);
                }
            }
        }
        Ok(sessions)
    }

    /// All live session tokens, for the orphan sweep.
    pub async fn all_sessions(&self) -> Result<Vec<Uuid>> {
        let keys = self
            .cache
            .keys_with_limit(&format!("{}:*", TokenKind::Session.prefix()), 10_000)
            .await
            .map_err(errors::Error::from)?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix("session_token:"))
            .filter_map(|t| Uuid::parse_str(t).ok())
            .collect())
    }

    // ------------------------------------------------------------------
    // One-shot tokens
    // ------------------------------------------------------------------

    pub async fn issue_one_shot(&self, kind: TokenKind, user_id: Uuid) -> Result<Uuid> {
        let ttl = match kind {
            TokenKind::Verification => self.config.verification_token_ttl,
            TokenKind::Reset => self.config.reset_token_ttl,
            _ => return Err(TokenError::Malformed("not a one-shot kind".into()).into()),
        };
        let token = Uuid::new_v4();
        let record = OneShotRecord {
            user_id,
            issued_at: Utc::now(),
        };
        self.write(kind, &token, &record, Some(Duration::from_secs(ttl)))
            .await?;
        Ok(token)
    }

    /// Consumes a one-shot token: the first successful call wins, any
    /// replay sees `Consumed`.
    pub async fn consume_one_shot(&self, kind: TokenKind, token: &Uuid) -> Result<Uuid> {
        let record: OneShotRecord = self
            .read(kind, token)
            .await?
            .ok_or(TokenError::Unknown)?;
        let removed = self
            .cache
            .del_batch(&[kind.key(token).as_str()])
            .await
            .map_err(errors::Error::from)?;
        if removed == 0 {
            return Err(TokenError::Consumed.into());
        }
        Ok(record.user_id)
    }
}
