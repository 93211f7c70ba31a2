use async_trait::async_trait;
use common::model::frame::{ClientErrorKind, Frame};
use dashmap::DashMap;
use errors::error::ConnectionError;
use errors::Result;
use log::{debug, info, warn};
use metrics::{counter, gauge};
use session::CascadeObserver;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

/// Close reason delivered when the registry drops a connection that cannot
/// keep up with its outbound stream.
pub const REASON_BACKPRESSURE: &str = "backpressure";

/// One live bidirectional connection: its outbound frame sink, the tokens it
/// is bound to, and a close signal back to the socket task.
pub struct ConnectionHandle {
    pub connection_id: Uuid,
    pub session_token: Uuid,
    pub project_token: Uuid,
    pub created_at: Instant,
    sink: mpsc::Sender<Frame>,
    closer: mpsc::Sender<String>,
}

/// Process-local map of live connections with secondary indexes by session
/// and project token. Delivery is O(1) and never blocks: a full sink drops
/// the connection instead of stalling dispatch.
pub struct ConnectionRegistry {
    connections: DashMap<Uuid, ConnectionHandle>,
    by_session: DashMap<Uuid, HashSet<Uuid>>,
    by_project: DashMap<Uuid, HashSet<Uuid>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            by_session: DashMap::new(),
            by_project: DashMap::new(),
        }
    }

    pub fn register(
        &self,
        connection_id: Uuid,
        sink: mpsc::Sender<Frame>,
        closer: mpsc::Sender<String>,
        session_token: Uuid,
        project_token: Uuid,
    ) {
        self.connections.insert(
            connection_id,
            ConnectionHandle {
                connection_id,
                session_token,
                project_token,
                created_at: Instant::now(),
                sink,
                closer,
            },
        );
        self.by_session
            .entry(session_token)
            .or_default()
            .insert(connection_id);
        self.by_project
            .entry(project_token)
            .or_default()
            .insert(connection_id);

        gauge!("registry_connections").set(self.connections.len() as f64);
        debug!("Registered connection {}", connection_id);
    }

    pub fn unregister(&self, connection_id: &Uuid) {
        if let Some((_, handle)) = self.connections.remove(connection_id) {
            if let Some(mut set) = self.by_session.get_mut(&handle.session_token) {
                set.remove(connection_id);
            }
            if let Some(mut set) = self.by_project.get_mut(&handle.project_token) {
                set.remove(connection_id);
            }
            debug!("Unregistered connection {}", connection_id);
        }
        gauge!("registry_connections").set(self.connections.len() as f64);
    }

    pub fn is_alive(&self, connection_id: &Uuid) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Tokens a connection was registered with, used by the orchestrator for
    /// per-request revalidation.
    pub fn binding(&self, connection_id: &Uuid) -> Option<(Uuid, Uuid)> {
        self.connections
            .get(connection_id)
            .map(|h| (h.session_token, h.project_token))
    }

    /// Enqueues a frame on the connection's outbound sink. When the sink is
    /// full the connection is dropped with reason `backpressure` rather than
    /// blocking dispatch for everyone else.
    pub fn deliver(&self, connection_id: &Uuid, frame: Frame) -> Result<()> {
        let result = match self.connections.get(connection_id) {
            Some(handle) => handle.sink.try_send(frame),
            None => {
                counter!("registry_deliver_total", "outcome" => "unknown").increment(1);
                return Err(ConnectionError::NotFound(connection_id.to_string()).into());
            }
        };

        match result {
            Ok(()) => {
                counter!("registry_deliver_total", "outcome" => "ok").increment(1);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Outbound sink full for {}; dropping connection",
                    connection_id
                );
                counter!("registry_deliver_total", "outcome" => "backpressure").increment(1);
                self.close(connection_id, REASON_BACKPRESSURE);
                Err(ConnectionError::SinkFull.into())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.unregister(connection_id);
                Err(ConnectionError::SinkClosed.into())
            }
        }
    }

    /// Delivers to every connection bound to the project, optionally skipping
    /// the originator.
    pub fn broadcast(&self, project_token: &Uuid, frame: &Frame, except: Option<&Uuid>) {
        let targets: Vec<Uuid> = match self.by_project.get(project_token) {
            Some(set) => set
                .iter()
                .filter(|id| except.map(|e| *id != e).unwrap_or(true))
                .copied()
                .collect(),
            None => return,
        };

        for connection_id in targets {
            let _ = self.deliver(&connection_id, frame.clone());
        }
    }

    /// Removes the connection and signals its socket task to close with the
    /// given reason.
    pub fn close(&self, connection_id: &Uuid, reason: &str) {
        if let Some(handle) = self.connections.get(connection_id) {
            let _ = handle.closer.try_send(reason.to_string());
        }
        self.unregister(connection_id);
        counter!("registry_close_total", "reason" => reason.to_string()).increment(1);
    }

    fn close_all(&self, ids: Vec<Uuid>, reason: &str) {
        for connection_id in ids {
            // Best-effort client notification before the close signal.
            if let Some(handle) = self.connections.get(&connection_id) {
                let _ = handle.sink.try_send(Frame::error(
                    None,
                    ClientErrorKind::Unauthenticated,
                    reason,
                ));
            }
            self.close(&connection_id, reason);
        }
    }

    pub fn close_session(&self, session_token: &Uuid, reason: &str) {
        let ids: Vec<Uuid> = self
            .by_session
            .get(session_token)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        if !ids.is_empty() {
            info!(
                "Closing {} connection(s) of session {}: {}",
                ids.len(),
                session_token,
                reason
            );
        }
        self.close_all(ids, reason);
    }

    pub fn close_project(&self, project_token: &Uuid, reason: &str) {
        let ids: Vec<Uuid> = self
            .by_project
            .get(project_token)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        self.close_all(ids, reason);
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[async_trait]
impl CascadeObserver for ConnectionRegistry {
    async fn close_session_connections(&self, session_token: &Uuid, reason: &str) {
        self.close_session(session_token, reason);
    }

    async fn close_project_connections(&self, project_token: &Uuid, reason: &str) {
        self.close_project(project_token, reason);
    }
}
