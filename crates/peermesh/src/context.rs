//! Context (room) membership
//!
//! A context is the set of peers the local participant should be meshed
//! with. Changing it tears down every session first, and connect requests
//! are refused until the bus acknowledges the new context.

use crate::events::{EventHub, MeshEvent};
use crate::media::resources::FanoutReport;
use crate::negotiation::NegotiationEngine;
use crate::session::{NegotiationState, PeerSessionStore};
use crate::signaling::{ContextCommand, ContextEvent, SignalingBridge};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Where the local participant stands with respect to its context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextState {
    /// No context assigned yet
    Detached,
    /// A change was requested and not acknowledged yet
    AwaitingAck {
        /// Requested context id
        requested: String,
    },
    /// Joined and accepting connect requests
    Ready {
        /// Current context id
        context: String,
    },
}

impl ContextState {
    /// Current context id, if ready
    pub fn context(&self) -> Option<&str> {
        match self {
            ContextState::Ready { context } => Some(context),
            _ => None,
        }
    }
}

/// Join, leave and room-change orchestration
pub struct ContextController {
    bridge: Arc<SignalingBridge>,
    store: Arc<PeerSessionStore>,
    engine: Arc<NegotiationEngine>,
    hub: Arc<EventHub>,
    auto_connect: bool,
    state: watch::Sender<ContextState>,
}

impl ContextController {
    /// Create a controller; with `auto_connect` every acknowledged context
    /// change is followed by `connectContext`
    pub fn new(
        bridge: Arc<SignalingBridge>,
        store: Arc<PeerSessionStore>,
        engine: Arc<NegotiationEngine>,
        hub: Arc<EventHub>,
        auto_connect: bool,
    ) -> Self {
        let (state, _) = watch::channel(ContextState::Detached);
        Self {
            bridge,
            store,
            engine,
            hub,
            auto_connect,
            state,
        }
    }

    /// Current state
    pub fn state(&self) -> ContextState {
        self.state.borrow().clone()
    }

    /// Current context id, if acknowledged
    pub fn context(&self) -> Option<String> {
        self.state.borrow().context().map(str::to_string)
    }

    /// Whether connect requests are accepted
    pub fn is_ready(&self) -> bool {
        matches!(*self.state.borrow(), ContextState::Ready { .. })
    }

    fn ensure_ready(&self) -> Result<()> {
        match &*self.state.borrow() {
            ContextState::Ready { .. } => Ok(()),
            ContextState::Detached => Err(Error::ContextNotReady(
                "no context has been assigned yet".to_string(),
            )),
            ContextState::AwaitingAck { requested } => Err(Error::ContextNotReady(format!(
                "waiting for the bus to acknowledge context {}",
                requested
            ))),
        }
    }

    /// Close every session and move to `context`
    ///
    /// Connect requests fail with [`Error::ContextNotReady`] until the bus
    /// acknowledges the change.
    pub async fn change_context(&self, context: &str) -> Result<()> {
        if context.is_empty() {
            return Err(Error::InvalidState("context id must not be empty".to_string()));
        }

        self.state.send_replace(ContextState::AwaitingAck {
            requested: context.to_string(),
        });
        let closed = self.store.clear().await;
        info!("Changing context to {} ({} sessions closed)", context, closed);

        self.bridge
            .send_command(ContextCommand::ChangeContext {
                context: context.to_string(),
            })
            .await
    }

    /// Ask the bus for the current members; it answers with `connectTo`
    pub async fn connect_context(&self) -> Result<()> {
        self.ensure_ready()?;
        self.bridge.send_command(ContextCommand::ConnectContext).await
    }

    /// Connect to each peer not already connected or offering
    ///
    /// The local id is skipped. Per-peer failures are reported once on the
    /// event hub. Returns how many peers were asked to connect.
    pub async fn connect_all(&self, peer_ids: &[String]) -> Result<usize> {
        self.ensure_ready()?;
        let local = self.bridge.local_peer_id();
        let mut report = FanoutReport::new("connect_all");
        let mut requested = 0;

        for peer_id in peer_ids {
            if peer_id.is_empty() || local.as_deref() == Some(peer_id.as_str()) {
                continue;
            }
            if let Some(session) = self.store.get(peer_id).await {
                if matches!(
                    session.state(),
                    NegotiationState::Connected | NegotiationState::OfferPending
                ) {
                    debug!("Already connected or offering to {}", peer_id);
                    continue;
                }
            }
            let result = self.engine.connect(peer_id).await;
            if result.is_ok() {
                requested += 1;
            }
            report.record(peer_id, result);
        }

        report.report(&self.hub);
        Ok(requested)
    }

    /// Connect to a single peer
    pub async fn connect(&self, peer_id: &str) -> Result<()> {
        self.ensure_ready()?;
        if self.bridge.local_peer_id().as_deref() == Some(peer_id) {
            return Err(Error::InvalidState("cannot connect to ourselves".to_string()));
        }
        self.engine.connect(peer_id).await
    }

    /// Close every session and move to a fresh private context
    pub async fn disconnect(&self) -> Result<()> {
        let context = uuid::Uuid::new_v4().to_string();
        self.change_context(&context).await
    }

    /// Close one session; returns whether it existed
    pub async fn disconnect_peer(&self, peer_id: &str) -> bool {
        self.store.remove(peer_id).await
    }

    /// Wait until the context is acknowledged and return its id
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<String> {
        let mut rx = self.state.subscribe();
        let wait = async {
            loop {
                let current = rx.borrow_and_update().context().map(str::to_string);
                if let Some(context) = current {
                    return Ok(context);
                }
                if rx.changed().await.is_err() {
                    return Err(Error::InvalidState("context controller dropped".to_string()));
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            Error::OperationTimeout(format!(
                "context not acknowledged within {}ms",
                timeout.as_millis()
            ))
        })?
    }

    /// Apply a membership event from the bus
    pub async fn handle_event(&self, event: ContextEvent) {
        match event {
            ContextEvent::ContextCreated { peer_id, context } => {
                info!("Joined context {} as {}", context, peer_id);
                self.bridge.set_local_peer_id(peer_id.clone());
                self.state.send_replace(ContextState::Ready {
                    context: context.clone(),
                });
                self.hub
                    .emit(&MeshEvent::ContextCreated { peer_id, context });
            }
            ContextEvent::ContextChanged { context } => {
                info!("Context changed to {}", context);
                self.state.send_replace(ContextState::Ready {
                    context: context.clone(),
                });
                self.hub.emit(&MeshEvent::ContextChanged { context });

                if self.auto_connect {
                    if let Err(e) = self.connect_context().await {
                        warn!("Failed to request context members: {}", e);
                        self.hub.emit(&MeshEvent::error(None, e));
                    }
                }
            }
            ContextEvent::ConnectTo { peers } => {
                if !self.is_ready() {
                    warn!("Ignoring connectTo for {} peers: context not ready", peers.len());
                    return;
                }
                if let Err(e) = self.connect_all(&peers).await {
                    warn!("connectTo failed: {}", e);
                }
            }
            ContextEvent::PeerLeft { peer_id } => {
                if self.store.remove(&peer_id).await {
                    info!("Peer {} left the context", peer_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use crate::media::LocalResourceManager;
    use crate::signaling::{MemoryHub, SignalingBus};
    use crate::transport::mock::MockEngine;
    use tokio::sync::mpsc;

    struct Fixture {
        hub: MemoryHub,
        controller: ContextController,
        store: Arc<PeerSessionStore>,
        _bus: Arc<dyn SignalingBus>,
    }

    fn fixture(auto_connect: bool) -> Fixture {
        let hub = MemoryHub::new();
        let bus: Arc<dyn SignalingBus> = Arc::new(hub.connect_as("local"));
        let events = Arc::new(EventHub::new());
        let store = Arc::new(PeerSessionStore::new(8, events.clone()));
        let bridge = Arc::new(SignalingBridge::new(bus.clone(), events.clone()));
        let (changes, _) = mpsc::unbounded_channel();
        let resources = Arc::new(LocalResourceManager::new(
            store.clone(),
            events.clone(),
            changes,
        ));
        let (transport_tx, _) = mpsc::unbounded_channel();
        let engine = Arc::new(NegotiationEngine::new(
            &MeshConfig::default(),
            store.clone(),
            bridge.clone(),
            resources,
            Arc::new(MockEngine::new()),
            events.clone(),
            transport_tx,
        ));
        let controller = ContextController::new(bridge, store.clone(), engine, events, auto_connect);
        Fixture {
            hub,
            controller,
            store,
            _bus: bus,
        }
    }

    #[tokio::test]
    async fn test_connect_refused_until_ready() {
        let f = fixture(false);
        assert_eq!(f.controller.state(), ContextState::Detached);
        assert!(matches!(
            f.controller.connect("peer-b").await,
            Err(Error::ContextNotReady(_))
        ));

        f.controller
            .handle_event(ContextEvent::ContextCreated {
                peer_id: "local".to_string(),
                context: "lobby".to_string(),
            })
            .await;
        assert_eq!(f.controller.context().as_deref(), Some("lobby"));

        f.controller.change_context("room").await.unwrap();
        assert_eq!(
            f.controller.state(),
            ContextState::AwaitingAck {
                requested: "room".to_string()
            }
        );
        assert!(f.controller.connect_all(&["b".to_string()]).await.is_err());
        assert_eq!(f.hub.context_of("local").as_deref(), Some("room"));

        f.controller
            .handle_event(ContextEvent::ContextChanged {
                context: "room".to_string(),
            })
            .await;
        assert!(f.controller.is_ready());
        assert_eq!(
            f.controller
                .wait_until_ready(Duration::from_millis(10))
                .await
                .unwrap(),
            "room"
        );
    }

    #[tokio::test]
    async fn test_change_context_closes_sessions() {
        let f = fixture(false);
        f.controller
            .handle_event(ContextEvent::ContextCreated {
                peer_id: "local".to_string(),
                context: "lobby".to_string(),
            })
            .await;
        f.store.get_or_create("peer-b").await.unwrap();
        f.store.get_or_create("peer-c").await.unwrap();

        f.controller.change_context("room").await.unwrap();
        assert!(f.store.is_empty().await);
        assert!(f.controller.change_context("").await.is_err());
    }

    #[tokio::test]
    async fn test_connect_all_skips_self_and_busy_peers() {
        let f = fixture(false);
        f.controller
            .handle_event(ContextEvent::ContextCreated {
                peer_id: "local".to_string(),
                context: "lobby".to_string(),
            })
            .await;
        let (busy, _) = f.store.get_or_create("busy").await.unwrap();
        busy.transition(NegotiationState::Connected);

        let peers = vec!["local".to_string(), "busy".to_string(), "fresh".to_string()];
        assert_eq!(f.controller.connect_all(&peers).await.unwrap(), 1);
        assert!(f.store.contains("fresh").await);
    }

    #[tokio::test]
    async fn test_peer_left_removes_session() {
        let f = fixture(false);
        f.store.get_or_create("peer-b").await.unwrap();
        f.controller
            .handle_event(ContextEvent::PeerLeft {
                peer_id: "peer-b".to_string(),
            })
            .await;
        assert!(!f.store.contains("peer-b").await);
    }

    #[tokio::test]
    async fn test_wait_until_ready_times_out() {
        let f = fixture(false);
        assert!(matches!(
            f.controller.wait_until_ready(Duration::from_millis(20)).await,
            Err(Error::OperationTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_moves_to_private_context() {
        let f = fixture(false);
        f.controller
            .handle_event(ContextEvent::ContextCreated {
                peer_id: "local".to_string(),
                context: "lobby".to_string(),
            })
            .await;
        f.controller.disconnect().await.unwrap();
        let context = f.hub.context_of("local").unwrap();
        assert_ne!(context, "lobby");
        assert!(matches!(f.controller.state(), ContextState::AwaitingAck { .. }));
    }
}
