//! In-process room service
//!
//! [`MemoryHub`] plays the role of the signaling server for tests and
//! single-process demos: it assigns every connecting peer a fresh context,
//! tracks context membership, and relays peer signals to their recipient.

use super::protocol::{BusCommand, BusEvent, ContextCommand, ContextEvent};
use super::SignalingBus;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

struct Member {
    context: String,
    tx: mpsc::UnboundedSender<BusEvent>,
}

#[derive(Default)]
struct HubState {
    members: HashMap<String, Member>,
    failing: HashSet<String>,
}

impl HubState {
    fn notify(&self, peer_id: &str, event: BusEvent) {
        if let Some(member) = self.members.get(peer_id) {
            let _ = member.tx.send(event);
        }
    }

    fn others_in(&self, context: &str, except: &str) -> Vec<String> {
        let mut peers: Vec<String> = self
            .members
            .iter()
            .filter(|(id, m)| m.context == context && id.as_str() != except)
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }

    fn announce_left(&self, peer_id: &str, context: &str) {
        for other in self.others_in(context, peer_id) {
            self.notify(
                &other,
                BusEvent::Context(ContextEvent::PeerLeft {
                    peer_id: peer_id.to_string(),
                }),
            );
        }
    }
}

/// Shared in-process room service
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a peer with a generated id
    pub fn connect(&self) -> MemoryBus {
        self.connect_as(uuid::Uuid::new_v4().to_string())
    }

    /// Connect a peer with a chosen id
    ///
    /// The peer is placed in a fresh random context and receives
    /// `ContextCreated` as its first event. Reconnecting an id replaces
    /// the previous connection.
    pub fn connect_as(&self, peer_id: impl Into<String>) -> MemoryBus {
        let peer_id = peer_id.into();
        let context = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        let _ = tx.send(BusEvent::Context(ContextEvent::ContextCreated {
            peer_id: peer_id.clone(),
            context: context.clone(),
        }));

        self.state
            .lock()
            .members
            .insert(peer_id.clone(), Member { context, tx });
        debug!("Memory hub: {} connected", peer_id);

        MemoryBus {
            peer_id,
            hub: self.clone(),
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Drop a peer; the rest of its context receives `PeerLeft`
    pub fn disconnect(&self, peer_id: &str) {
        let mut state = self.state.lock();
        if let Some(member) = state.members.remove(peer_id) {
            state.announce_left(peer_id, &member.context);
            debug!("Memory hub: {} disconnected", peer_id);
        }
    }

    /// Members of a context, sorted
    pub fn members(&self, context: &str) -> Vec<String> {
        self.state.lock().others_in(context, "")
    }

    /// Context a peer is currently in
    pub fn context_of(&self, peer_id: &str) -> Option<String> {
        self.state
            .lock()
            .members
            .get(peer_id)
            .map(|m| m.context.clone())
    }

    /// Make every send from `peer_id` fail, to exercise error paths
    pub fn set_failing(&self, peer_id: &str, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing.insert(peer_id.to_string());
        } else {
            state.failing.remove(peer_id);
        }
    }

    fn handle(&self, from: &str, command: BusCommand) -> Result<()> {
        let mut state = self.state.lock();

        if state.failing.contains(from) {
            return Err(Error::SignalingError(format!(
                "memory hub refused message from {}",
                from
            )));
        }
        let Some(current) = state.members.get(from).map(|m| m.context.clone()) else {
            return Err(Error::SignalingError(format!("{} is not connected", from)));
        };

        match command {
            BusCommand::Context(ContextCommand::ChangeContext { context }) => {
                state.announce_left(from, &current);
                if let Some(member) = state.members.get_mut(from) {
                    member.context = context.clone();
                }
                state.notify(from, BusEvent::Context(ContextEvent::ContextChanged { context }));
            }
            BusCommand::Context(ContextCommand::ConnectContext) => {
                let peers = state.others_in(&current, from);
                state.notify(from, BusEvent::Context(ContextEvent::ConnectTo { peers }));
            }
            BusCommand::Signal(envelope) => {
                let Some(recipient) = state.members.get(&envelope.recipient) else {
                    return Err(Error::SignalingError(format!(
                        "unknown recipient {}",
                        envelope.recipient
                    )));
                };
                let _ = recipient.tx.send(BusEvent::Signal(envelope));
            }
        }
        Ok(())
    }
}

/// One peer's connection to a [`MemoryHub`]
pub struct MemoryBus {
    peer_id: String,
    hub: MemoryHub,
    rx: Mutex<Option<mpsc::UnboundedReceiver<BusEvent>>>,
}

impl MemoryBus {
    /// Peer id this connection was registered under
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }
}

#[async_trait]
impl SignalingBus for MemoryBus {
    async fn send(&self, command: BusCommand) -> Result<()> {
        self.hub.handle(&self.peer_id, command)
    }

    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<BusEvent>> {
        self.rx
            .lock()
            .take()
            .ok_or_else(|| Error::InvalidState("memory bus already subscribed".to_string()))
    }
}
