//! Session registry implementation
//!
//! The set of live client sessions, shared by the accept loop (insert), the
//! session tasks (remove on teardown) and the broadcast engine (snapshot).

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::session::{ClientSession, SessionId};

/// Registry of connected client sessions
///
/// Thread-safe via `RwLock`. The broadcast path only takes the read lock long
/// enough to clone the `Arc`s out, so fan-out never holds the lock while
/// touching a session. Sessions are keyed by their monotonically increasing
/// id, which keeps snapshots in accept order.
pub struct SessionRegistry {
    sessions: RwLock<BTreeMap<SessionId, Arc<ClientSession>>>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a session
    ///
    /// Replaces any existing session with the same id.
    pub async fn add(&self, session: Arc<ClientSession>) {
        let id = session.id();
        let peer = session.peer_addr();

        let count = {
            let mut sessions = self.sessions.write().await;
            sessions.insert(id, session);
            sessions.len()
        };

        tracing::info!(session_id = %id, peer = %peer, sessions = count, "Session added");
    }

    /// Deregister a session
    pub async fn remove(&self, id: SessionId) -> Option<Arc<ClientSession>> {
        let (removed, count) = {
            let mut sessions = self.sessions.write().await;
            let removed = sessions.remove(&id);
            (removed, sessions.len())
        };

        if removed.is_some() {
            tracing::info!(session_id = %id, sessions = count, "Session removed");
        }

        removed
    }

    /// Point-in-time view of the open sessions, in accept order
    ///
    /// Closed sessions that have not been removed yet are left out.
    pub async fn snapshot(&self) -> Vec<Arc<ClientSession>> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|session| session.is_open())
            .cloned()
            .collect()
    }

    /// Look up a session by id
    pub async fn get(&self, id: SessionId) -> Option<Arc<ClientSession>> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Number of registered sessions
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Close every registered session
    ///
    /// Used when the upstream link goes away. Sessions stay registered until
    /// their own tasks finish and remove them.
    pub async fn close_all(&self) -> usize {
        let sessions = self.snapshot().await;
        for session in &sessions {
            session.close();
        }

        if !sessions.is_empty() {
            tracing::info!(sessions = sessions.len(), "Closed all sessions");
        }

        sessions.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::HEADER_SIZE;
    use crate::protocol::DongleInfo;
    use crate::session::{SessionConfig, SessionState};

    fn session(id: u64) -> Arc<ClientSession> {
        let header = DongleInfo::from_bytes([0x52, 0x54, 0x4C, 0x30, 0, 0, 0, 1, 0, 0, 0, 14]);
        Arc::new(ClientSession::new(
            SessionId(id),
            "127.0.0.1:4000".parse().unwrap(),
            SessionConfig::default(),
            &header,
        ))
    }

    #[tokio::test]
    async fn test_add_remove() {
        let registry = SessionRegistry::new();
        assert!(registry.is_empty().await);

        registry.add(session(1)).await;
        registry.add(session(2)).await;
        assert_eq!(registry.len().await, 2);
        assert!(registry.get(SessionId(2)).await.is_some());

        let removed = registry.remove(SessionId(1)).await.unwrap();
        assert_eq!(removed.id(), SessionId(1));
        assert!(registry.remove(SessionId(1)).await.is_none());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_snapshot_ordered_by_id() {
        let registry = SessionRegistry::new();
        for id in [3, 1, 2] {
            registry.add(session(id)).await;
        }

        let ids: Vec<_> = registry
            .snapshot()
            .await
            .iter()
            .map(|s| s.id())
            .collect();
        assert_eq!(ids, vec![SessionId(1), SessionId(2), SessionId(3)]);
    }

    #[tokio::test]
    async fn test_snapshot_is_stable_against_mutation() {
        let registry = SessionRegistry::new();
        registry.add(session(1)).await;
        registry.add(session(2)).await;

        let snapshot = registry.snapshot().await;
        registry.remove(SessionId(1)).await;
        registry.add(session(3)).await;

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id(), SessionId(1));
        assert_eq!(snapshot[0].queued_bytes(), HEADER_SIZE);
    }

    #[tokio::test]
    async fn test_snapshot_skips_closed_sessions() {
        let registry = SessionRegistry::new();
        let closed = session(1);
        registry.add(closed.clone()).await;
        registry.add(session(2)).await;

        closed.close();

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), SessionId(2));
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = SessionRegistry::new();
        let a = session(1);
        let b = session(2);
        registry.add(a.clone()).await;
        registry.add(b.clone()).await;

        assert_eq!(registry.close_all().await, 2);
        assert_eq!(a.state(), SessionState::Closed);
        assert_eq!(b.state(), SessionState::Closed);
        assert!(registry.snapshot().await.is_empty());
    }
}
