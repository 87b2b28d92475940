//! Peer session store

use super::peer::{NegotiationState, PeerInfo, PeerSession};
use crate::events::{EventHub, MeshEvent};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Owns the map from peer id to [`PeerSession`]
pub struct PeerSessionStore {
    /// Map of peer_id to PeerSession
    sessions: RwLock<HashMap<String, Arc<PeerSession>>>,

    /// Maximum number of peers allowed
    max_peers: u32,

    hub: Arc<EventHub>,
}

impl PeerSessionStore {
    /// Create an empty store
    ///
    /// # Arguments
    ///
    /// * `max_peers` - Maximum number of simultaneous sessions
    /// * `hub` - Receives `PeerClosed` for every removed session
    pub fn new(max_peers: u32, hub: Arc<EventHub>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_peers,
            hub,
        }
    }

    /// Return the session for `peer_id`, creating it if needed
    ///
    /// Creation happens under the write lock, so concurrent callers for the
    /// same id get the same instance. The flag is `true` for the caller
    /// that created it.
    ///
    /// # Errors
    ///
    /// Returns `PeerLimitReached` if a new session would exceed `max_peers`.
    pub async fn get_or_create(&self, peer_id: &str) -> Result<(Arc<PeerSession>, bool)> {
        if let Some(session) = self.sessions.read().await.get(peer_id) {
            if !session.is_closed() {
                return Ok((session.clone(), false));
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(peer_id) {
            if !session.is_closed() {
                return Ok((session.clone(), false));
            }
            debug!("Replacing closed session for {}", peer_id);
            sessions.remove(peer_id);
        }

        if sessions.len() >= self.max_peers as usize {
            return Err(Error::PeerLimitReached(self.max_peers));
        }

        let session = Arc::new(PeerSession::new(peer_id));
        info!(
            "Adding peer session: {} (session {})",
            peer_id,
            session.session_id()
        );
        sessions.insert(peer_id.to_string(), session.clone());
        Ok((session, true))
    }

    /// Get a session by peer id
    pub async fn get(&self, peer_id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.read().await.get(peer_id).cloned()
    }

    /// Check if a session exists
    pub async fn contains(&self, peer_id: &str) -> bool {
        self.sessions.read().await.contains_key(peer_id)
    }

    /// Number of sessions
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether the store is empty
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Snapshot of all sessions for fan-out
    pub async fn all(&self) -> Vec<Arc<PeerSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Snapshot info of all sessions, sorted by peer id
    pub async fn list_peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.info())
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    /// Close and evict a session. Returns whether one existed.
    pub async fn remove(&self, peer_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(peer_id);
        match removed {
            Some(session) => {
                info!("Removing peer session: {}", peer_id);
                self.close_session(&session).await;
                true
            }
            None => false,
        }
    }

    /// Close and evict every session. Returns how many were removed.
    pub async fn clear(&self) -> usize {
        let drained: Vec<Arc<PeerSession>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, s)| s).collect()
        };

        debug!("Clearing {} peer sessions", drained.len());
        for session in &drained {
            self.close_session(session).await;
        }
        drained.len()
    }

    async fn close_session(&self, session: &PeerSession) {
        let from = session.state();
        if session.close().await {
            self.hub.emit(&MeshEvent::NegotiationStateChanged {
                peer_id: session.peer_id().to_string(),
                from,
                to: NegotiationState::Closed,
            });
            self.hub.emit(&MeshEvent::PeerClosed {
                peer_id: session.peer_id().to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(max_peers: u32) -> PeerSessionStore {
        PeerSessionStore::new(max_peers, Arc::new(EventHub::new()))
    }

    #[tokio::test]
    async fn test_get_or_create_returns_existing() {
        let store = store(4);
        let (first, created) = store.get_or_create("peer-1").await.unwrap();
        assert!(created);
        let (second, created) = store.get_or_create("peer-1").await.unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create_creates_once() {
        let store = Arc::new(store(4));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.get_or_create("peer-1").await.unwrap() })
            })
            .collect();

        let mut created = 0;
        let mut ids = Vec::new();
        for task in tasks {
            let (session, was_created) = task.await.unwrap();
            if was_created {
                created += 1;
            }
            ids.push(session.session_id().to_string());
        }

        assert_eq!(created, 1);
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_max_peers_limit() {
        let store = store(2);
        store.get_or_create("peer-1").await.unwrap();
        store.get_or_create("peer-2").await.unwrap();

        let err = store.get_or_create("peer-3").await.unwrap_err();
        assert!(matches!(err, Error::PeerLimitReached(2)));

        // existing ids are still served at the limit
        assert!(store.get_or_create("peer-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_remove_closes_and_emits() {
        let hub = Arc::new(EventHub::new());
        let store = PeerSessionStore::new(4, hub.clone());
        let (_id, mut events) = hub.subscribe_channel();

        let (session, _) = store.get_or_create("peer-1").await.unwrap();
        assert!(store.remove("peer-1").await);
        assert!(!store.remove("peer-1").await);
        assert!(session.is_closed());
        assert!(!store.contains("peer-1").await);

        assert!(matches!(
            events.recv().await,
            Some(MeshEvent::NegotiationStateChanged {
                to: NegotiationState::Closed,
                ..
            })
        ));
        assert!(matches!(
            events.recv().await,
            Some(MeshEvent::PeerClosed { peer_id }) if peer_id == "peer-1"
        ));
    }

    #[tokio::test]
    async fn test_closed_session_is_replaced() {
        let store = store(4);
        let (old, _) = store.get_or_create("peer-1").await.unwrap();
        old.close().await;

        let (new, created) = store.get_or_create("peer-1").await.unwrap();
        assert!(created);
        assert_ne!(old.session_id(), new.session_id());
    }

    #[tokio::test]
    async fn test_clear_and_list() {
        let store = store(4);
        store.get_or_create("peer-b").await.unwrap();
        store.get_or_create("peer-a").await.unwrap();

        let peers = store.list_peers().await;
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].peer_id, "peer-a");
        assert_eq!(peers[0].state, NegotiationState::Idle);

        let sessions = store.all().await;
        assert_eq!(store.clear().await, 2);
        assert!(store.is_empty().await);
        assert!(sessions.iter().all(|s| s.is_closed()));
    }
}
