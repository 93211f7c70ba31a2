use crate::manager::{AuthSessionManager, REASON_SESSION_EXPIRED};
use cacheable::CacheService;
use common::model::token::TokenKind;
use errors::Result;
use log::{debug, error, info, warn};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const CASCADE_RETRIES: u32 = 3;

/// Listens for hook-key expirations and drives the cleanup cascade while the
/// main token record is still readable. A per-token cache lock keeps multiple
/// backend instances from running the same cascade; failed cascades are
/// retried until the main key itself expires, after which the periodic orphan
/// sweep picks up whatever is left.
pub struct Reaper {
    cache: Arc<CacheService>,
    manager: Arc<AuthSessionManager>,
    /// Safety margin between hook and record expiry, also the sweep period.
    hook_margin: Duration,
}

impl Reaper {
    pub fn new(cache: Arc<CacheService>, manager: Arc<AuthSessionManager>) -> Self {
        let hook_margin = Duration::from_secs(manager.tokens().config().hook_margin);
        Self {
            cache,
            manager,
            hook_margin,
        }
    }

    /// Spawns the notification listener and the orphan sweep. Returns once
    /// the subscription is established.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let mut events = self.cache.expired_events().await.map_err(errors::Error::from)?;
        info!("Reaper listening for expired token hooks");

        let listener = Arc::clone(&self);
        tokio::spawn(async move {
            while let Some(key) = events.recv().await {
                let Some((kind, token)) = TokenKind::from_hook_key(&key) else {
                    continue;
                };
                debug!("Hook expired: {} {}", kind.prefix(), token);
                listener.handle_expiry(kind, token).await;
            }
            warn!("Expired-key event stream ended");
        });

        let sweeper = Arc::clone(&self);
        tokio::spawn(async move {
            sweeper.orphan_sweep_loop().await;
        });

        Ok(())
    }

    async fn handle_expiry(&self, kind: TokenKind, token: Uuid) {
        // One cascade per token across all instances.
        let lock_key = format!("lock:cascade:{token}");
        let locked = self
            .cache
            .set_nx(&lock_key, b"", Some(Duration::from_secs(10)))
            .await
            .unwrap_or(false);
        if !locked {
            debug!("Cascade for {} already in flight elsewhere", token);
            return;
        }

        counter!("reaper_cascade_total", "kind" => kind.prefix()).increment(1);

        for attempt in 0..CASCADE_RETRIES {
            let result = match kind {
                TokenKind::Auth => self.manager.revoke_auth(&token).await,
                TokenKind::Session => {
                    self.manager
                        .cascade_session(&token, REASON_SESSION_EXPIRED)
                        .await
                }
                _ => Ok(()),
            };

            match result {
                Ok(()) => break,
                Err(e) if attempt + 1 < CASCADE_RETRIES => {
                    warn!(
                        "Cascade for {} failed (attempt {}): {}; retrying",
                        token,
                        attempt + 1,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(200 * (1 << attempt))).await;
                }
                Err(e) => {
                    // The main key will expire on its own; the record is then
                    // reconstructed best effort from the durable store.
                    error!("Cascade for {} abandoned after retries: {}", token, e);
                    counter!("reaper_cascade_abandoned_total").increment(1);
                }
            }
        }

        let _ = self.cache.del(&lock_key).await;
    }

    /// Periodic repair pass for lost notifications: any session whose parent
    /// auth token no longer exists is cascaded here, bounding the cleanup
    /// delay at roughly two hook margins.
    async fn orphan_sweep_loop(&self) {
        let mut interval = tokio::time::interval(self.hook_margin);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = self.sweep_orphans().await {
                warn!("Orphan sweep failed: {}", e);
            }
        }
    }

    pub async fn sweep_orphans(&self) -> Result<()> {
        let tokens = self.manager.tokens();
        let sessions = tokens.all_sessions().await?;

        for session_token in sessions {
            let Some(record) = tokens.get_session(&session_token).await? else {
                continue;
            };
            if tokens.get_auth(&record.auth_token).await?.is_none() {
                info!(
                    "Sweep found orphaned session {}; cascading",
                    session_token
                );
                counter!("reaper_sweep_cascade_total").increment(1);
                if let Err(e) = self
                    .manager
                    .cascade_session(&session_token, REASON_SESSION_EXPIRED)
                    .await
                {
                    warn!("Sweep cascade for {} failed: {}", session_token, e);
                }
            }
        }
        Ok(())
    }
}
