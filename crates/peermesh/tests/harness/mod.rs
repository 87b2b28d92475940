//! Mesh integration test harness
//!
//! Runs several [`Mesh`] nodes in one process over a [`MemoryHub`], each
//! with its own [`MockEngine`]. A [`ScriptedPeer`] joins the same hub as a
//! raw bus connection so tests can play the remote side of a negotiation
//! message by message.
//!
//! Basic usage pattern:
//!
//! 1. Create a `MeshTestHarness`
//! 2. Add nodes with `harness.node("a")` and join them to a room
//! 3. Wait for states or events with the `wait_*` helpers
//! 4. Call `harness.shutdown()` to clean up

#![allow(dead_code)]

use peermesh::events::MeshEvent;
use peermesh::session::NegotiationState;
use peermesh::signaling::{
    BusCommand, BusEvent, MemoryBus, MemoryHub, SignalEnvelope, SignalMessage, SignalingBus,
};
use peermesh::transport::mock::MockEngine;
use peermesh::transport::IceCandidate;
use peermesh::{Mesh, MeshConfig};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Upper bound for any single wait in these tests
pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds, panicking after [`WAIT`]
pub async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = tokio::time::timeout(WAIT, async {
        loop {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {}", what);
}

/// One mesh participant
pub struct TestNode {
    pub id: String,
    pub mesh: Arc<Mesh>,
    pub engine: Arc<MockEngine>,
    events: Mutex<mpsc::UnboundedReceiver<MeshEvent>>,
}

impl TestNode {
    /// Negotiation state of the session with `peer_id`
    pub async fn state_of(&self, peer_id: &str) -> Option<NegotiationState> {
        self.mesh.peer_state(peer_id).await
    }

    /// Wait until the session with `peer_id` reaches `state`
    pub async fn wait_state(&self, peer_id: &str, state: NegotiationState) {
        let what = format!("{} to see {} as {}", self.id, peer_id, state);
        wait_until(&what, || async move { self.state_of(peer_id).await == Some(state) }).await;
    }

    /// Wait until the session with `peer_id` is gone
    pub async fn wait_removed(&self, peer_id: &str) {
        let what = format!("{} to drop {}", self.id, peer_id);
        wait_until(&what, || async move { self.mesh.session(peer_id).await.is_none() }).await;
    }

    /// Move to `room` and wait for the acknowledgement
    pub async fn join(&self, room: &str) {
        self.mesh.change_context(room).await.unwrap();
        wait_until(&format!("{} to join {}", self.id, room), || async move {
            self.mesh.context().as_deref() == Some(room)
        })
        .await;
    }

    /// Wait for the first event matching `predicate`, skipping others
    pub async fn wait_event<P>(&self, what: &str, mut predicate: P) -> MeshEvent
    where
        P: FnMut(&MeshEvent) -> bool,
    {
        let mut events = self.events.lock().await;
        let found = tokio::time::timeout(WAIT, async {
            while let Some(event) = events.recv().await {
                if predicate(&event) {
                    return Some(event);
                }
            }
            None
        })
        .await;
        match found {
            Ok(Some(event)) => event,
            _ => panic!("{} never saw {}", self.id, what),
        }
    }

    /// Events received so far, without waiting
    pub async fn drain_events(&self) -> Vec<MeshEvent> {
        let mut events = self.events.lock().await;
        let mut drained = Vec::new();
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }
}

/// Raw bus connection acting as a hand-driven remote peer
pub struct ScriptedPeer {
    pub id: String,
    bus: MemoryBus,
    inbox: Mutex<mpsc::UnboundedReceiver<BusEvent>>,
}

impl ScriptedPeer {
    async fn signal(&self, to: &str, message: SignalMessage, version: u64, skip: bool) {
        let envelope = SignalEnvelope::new(self.id.clone(), to, &message, version, skip).unwrap();
        self.bus.send(BusCommand::Signal(envelope)).await.unwrap();
    }

    pub async fn send_offer(&self, to: &str, sdp: &str, version: u64) {
        let message = SignalMessage::Offer {
            sdp: sdp.to_string(),
        };
        self.signal(to, message, version, false).await;
    }

    pub async fn send_answer(&self, to: &str, sdp: &str, version: u64) {
        let message = SignalMessage::Answer {
            sdp: sdp.to_string(),
        };
        self.signal(to, message, version, false).await;
    }

    pub async fn send_candidate(&self, to: &str, candidate: &str) {
        let message = SignalMessage::Candidate {
            ice_candidate: IceCandidate::new(candidate),
        };
        self.signal(to, message, 0, false).await;
    }

    /// Wait for the next signal addressed to us, skipping context events
    pub async fn next_signal(&self) -> (SignalEnvelope, SignalMessage) {
        let mut inbox = self.inbox.lock().await;
        let found = tokio::time::timeout(WAIT, async {
            while let Some(event) = inbox.recv().await {
                if let BusEvent::Signal(envelope) = event {
                    return Some(envelope);
                }
            }
            None
        })
        .await;
        match found {
            Ok(Some(envelope)) => {
                let message = envelope.decode().unwrap();
                (envelope, message)
            }
            _ => panic!("{} never received a signal", self.id),
        }
    }

    /// Wait for the next offer or answer, skipping candidates
    pub async fn next_description(&self) -> (SignalEnvelope, SignalMessage) {
        loop {
            let (envelope, message) = self.next_signal().await;
            if !matches!(message, SignalMessage::Candidate { .. }) {
                return (envelope, message);
            }
        }
    }

    /// Signals received so far, without waiting
    pub async fn pending_signals(&self) -> Vec<SignalEnvelope> {
        let mut inbox = self.inbox.lock().await;
        let mut signals = Vec::new();
        while let Ok(event) = inbox.try_recv() {
            if let BusEvent::Signal(envelope) = event {
                signals.push(envelope);
            }
        }
        signals
    }
}

/// Several nodes sharing one in-memory signaling service
pub struct MeshTestHarness {
    pub hub: MemoryHub,
    nodes: Vec<Arc<TestNode>>,
}

impl MeshTestHarness {
    pub fn new() -> Self {
        init_logging();
        Self {
            hub: MemoryHub::new(),
            nodes: Vec::new(),
        }
    }

    /// Start a node with the default configuration
    pub async fn node(&mut self, id: &str) -> Arc<TestNode> {
        self.node_with(id, MeshConfig::default()).await
    }

    /// Start a node and wait until the hub has assigned its id
    pub async fn node_with(&mut self, id: &str, config: MeshConfig) -> Arc<TestNode> {
        let bus: Arc<dyn SignalingBus> = Arc::new(self.hub.connect_as(id));
        let engine = Arc::new(MockEngine::new());
        let mesh = Arc::new(Mesh::new(config, bus, engine.clone()).unwrap());
        let (_, events) = mesh.events();
        mesh.start().unwrap();
        mesh.wait_until_ready(WAIT).await.unwrap();

        let node = Arc::new(TestNode {
            id: id.to_string(),
            mesh,
            engine,
            events: Mutex::new(events),
        });
        self.nodes.push(node.clone());
        node
    }

    /// Join a raw bus connection to the hub
    pub fn scripted(&self, id: &str) -> ScriptedPeer {
        let bus = self.hub.connect_as(id);
        let inbox = bus.subscribe().unwrap();
        ScriptedPeer {
            id: id.to_string(),
            bus,
            inbox: Mutex::new(inbox),
        }
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.mesh.shutdown().await.unwrap();
        }
    }
}

/// Config with auto-connect on context change turned off
pub fn manual_config() -> MeshConfig {
    MeshConfig {
        auto_connect_on_context_change: false,
        ..Default::default()
    }
}

/// Two default nodes `a` and `b` joined to `room` and connected
pub async fn connected_pair(harness: &mut MeshTestHarness) -> (Arc<TestNode>, Arc<TestNode>) {
    let a = harness.node("a").await;
    let b = harness.node("b").await;
    a.join("room").await;
    b.join("room").await;
    a.wait_state("b", NegotiationState::Connected).await;
    b.wait_state("a", NegotiationState::Connected).await;
    (a, b)
}
