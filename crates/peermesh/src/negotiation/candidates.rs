//! Candidate buffering and application

use crate::session::{PeerSession, PeerSessionStore};
use crate::transport::IceCandidate;
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of draining a session's candidate queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Candidates the handle accepted
    pub applied: usize,
    /// Candidates the handle rejected; they are dropped
    pub failed: usize,
}

/// Buffers candidates until a remote description exists, then applies
/// them in arrival order
pub struct CandidateRelay {
    store: Arc<PeerSessionStore>,
}

impl CandidateRelay {
    /// Create a relay over the session store
    pub fn new(store: Arc<PeerSessionStore>) -> Self {
        Self { store }
    }

    /// Apply `candidate` now if the session has a remote description,
    /// otherwise queue it
    pub async fn enqueue(&self, peer_id: &str, candidate: IceCandidate) -> Result<()> {
        let session = self
            .store
            .get(peer_id)
            .await
            .ok_or_else(|| Error::PeerNotFound(peer_id.to_string()))?;
        let _gate = session.lock_gate().await;
        Self::enqueue_locked(&session, candidate).await;
        Ok(())
    }

    /// Apply every queued candidate, oldest first
    pub async fn drain(&self, peer_id: &str) -> Result<DrainReport> {
        let session = self
            .store
            .get(peer_id)
            .await
            .ok_or_else(|| Error::PeerNotFound(peer_id.to_string()))?;
        let _gate = session.lock_gate().await;
        Ok(Self::drain_locked(&session).await)
    }

    /// [`enqueue`](Self::enqueue) for a caller that holds the session gate.
    /// Returns `true` if the candidate was applied.
    pub(crate) async fn enqueue_locked(session: &PeerSession, candidate: IceCandidate) -> bool {
        let transport = session.with_inner(|inner| {
            match (&inner.transport, inner.has_remote_description) {
                (Some(transport), true) => Some(transport.clone()),
                _ => {
                    inner.pending_candidates.push_back(candidate.clone());
                    None
                }
            }
        });

        let Some(transport) = transport else {
            debug!(
                "Queued candidate for {} until remote description is set",
                session.peer_id()
            );
            return false;
        };

        match transport.add_ice_candidate(candidate).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to apply candidate from {}: {}", session.peer_id(), e);
                false
            }
        }
    }

    /// [`drain`](Self::drain) for a caller that holds the session gate
    pub(crate) async fn drain_locked(session: &PeerSession) -> DrainReport {
        let mut report = DrainReport::default();

        loop {
            let next = session.with_inner(|inner| {
                let transport = inner.transport.clone()?;
                let candidate = inner.pending_candidates.pop_front()?;
                Some((transport, candidate))
            });
            let Some((transport, candidate)) = next else {
                break;
            };

            match transport.add_ice_candidate(candidate).await {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    warn!(
                        "Skipping candidate from {} that failed to apply: {}",
                        session.peer_id(),
                        e
                    );
                    report.failed += 1;
                }
            }

            if session.is_closed() {
                break;
            }
        }

        if report.applied + report.failed > 0 {
            debug!(
                "Drained candidates for {}: {} applied, {} failed",
                session.peer_id(),
                report.applied,
                report.failed
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventHub;
    use crate::transport::mock::MockEngine;
    use crate::transport::{SessionDescription, TransportEngine, TransportEventSink};
    use tokio::sync::mpsc;

    async fn session_with_handle(
        engine: &MockEngine,
        store: &PeerSessionStore,
    ) -> Arc<PeerSession> {
        let (session, _) = store.get_or_create("peer-b").await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = engine
            .create_handle(
                "peer-b",
                &[],
                TransportEventSink::new("peer-b", session.session_id(), tx),
            )
            .await
            .unwrap();
        session.with_inner(|inner| inner.transport = Some(handle));
        session
    }

    #[tokio::test]
    async fn test_candidates_wait_for_remote_description() {
        let engine = MockEngine::new();
        let store = Arc::new(PeerSessionStore::new(4, Arc::new(EventHub::new())));
        let relay = CandidateRelay::new(store.clone());
        let session = session_with_handle(&engine, &store).await;

        relay
            .enqueue("peer-b", IceCandidate::new("candidate:1"))
            .await
            .unwrap();
        relay
            .enqueue("peer-b", IceCandidate::new("invalid:2"))
            .await
            .unwrap();
        relay
            .enqueue("peer-b", IceCandidate::new("candidate:3"))
            .await
            .unwrap();
        assert_eq!(session.pending_candidates(), 3);
        assert!(engine.handle("peer-b").unwrap().applied_candidates().is_empty());

        let transport = session.transport().unwrap();
        transport
            .set_remote_description(SessionDescription::offer("mock-offer:a:1\n"))
            .await
            .unwrap();
        session.with_inner(|inner| inner.has_remote_description = true);

        let report = relay.drain("peer-b").await.unwrap();
        assert_eq!(report, DrainReport { applied: 2, failed: 1 });
        assert_eq!(session.pending_candidates(), 0);

        let applied: Vec<String> = engine
            .handle("peer-b")
            .unwrap()
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(applied, vec!["candidate:1", "candidate:3"]);

        // with a remote description, candidates apply immediately
        relay
            .enqueue("peer-b", IceCandidate::new("candidate:4"))
            .await
            .unwrap();
        assert_eq!(session.pending_candidates(), 0);
        assert_eq!(engine.handle("peer-b").unwrap().applied_candidates().len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let store = Arc::new(PeerSessionStore::new(4, Arc::new(EventHub::new())));
        let relay = CandidateRelay::new(store);
        assert!(matches!(
            relay.enqueue("nobody", IceCandidate::new("c")).await,
            Err(Error::PeerNotFound(_))
        ));
        assert!(relay.drain("nobody").await.is_err());
    }
}
