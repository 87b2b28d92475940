//! Typed send/receive wrapper over the signaling bus

use super::protocol::{BusCommand, ContextCommand, SignalEnvelope, SignalMessage};
use super::SignalingBus;
use crate::events::{EventHub, HandlerId, MeshEvent, Observers};
use crate::transport::{DescriptionKind, IceCandidate, SessionDescription};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

/// Kind of a peer signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Session offer
    Offer,
    /// Session answer
    Answer,
    /// Connectivity candidate
    Candidate,
}

/// A peer signal, outbound or parsed inbound
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Session offer
    Offer {
        /// Offer description
        description: SessionDescription,
        /// Sender's local description version
        version: u64,
        /// Sender already attached its tracks
        skip_local_tracks: bool,
    },
    /// Session answer
    Answer {
        /// Answer description
        description: SessionDescription,
        /// Sender's local description version
        version: u64,
    },
    /// Connectivity candidate
    Candidate(IceCandidate),
}

impl Signal {
    /// The kind of this signal
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::Offer { .. } => SignalKind::Offer,
            Signal::Answer { .. } => SignalKind::Answer,
            Signal::Candidate(_) => SignalKind::Candidate,
        }
    }
}

/// Signal received from a remote peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundSignal {
    /// Remote peer that sent it
    pub sender: String,
    /// Local peer it was addressed to
    pub recipient: String,
    /// Parsed signal
    pub signal: Signal,
}

/// Typed bridge between the mesh and the [`SignalingBus`]
pub struct SignalingBridge {
    bus: Arc<dyn SignalingBus>,
    local_peer_id: RwLock<Option<String>>,
    handlers: Observers<InboundSignal>,
    hub: Arc<EventHub>,
}

impl SignalingBridge {
    /// Create a bridge over `bus`; bus failures are reported on `hub`
    pub fn new(bus: Arc<dyn SignalingBus>, hub: Arc<EventHub>) -> Self {
        Self {
            bus,
            local_peer_id: RwLock::new(None),
            handlers: Observers::new(),
            hub,
        }
    }

    /// Local peer id, once the bus assigned one
    pub fn local_peer_id(&self) -> Option<String> {
        self.local_peer_id.read().clone()
    }

    /// Record the id the bus assigned to us
    pub fn set_local_peer_id(&self, peer_id: impl Into<String>) {
        *self.local_peer_id.write() = Some(peer_id.into());
    }

    /// Serialize `signal` and relay it to `recipient`
    ///
    /// Only local failures (no peer id yet, serialization) are returned.
    /// A bus failure is reported as a [`MeshEvent::Error`] and the call
    /// still succeeds.
    pub async fn send(&self, recipient: &str, signal: Signal) -> Result<()> {
        let sender = self.local_peer_id().ok_or_else(|| {
            Error::SignalingError("local peer id has not been assigned yet".to_string())
        })?;

        let kind = signal.kind();
        let envelope = match signal {
            Signal::Offer {
                description,
                version,
                skip_local_tracks,
            } => SignalEnvelope::new(
                sender,
                recipient,
                &SignalMessage::Offer {
                    sdp: description.sdp,
                },
                version,
                skip_local_tracks,
            )?,
            Signal::Answer {
                description,
                version,
            } => SignalEnvelope::new(
                sender,
                recipient,
                &SignalMessage::Answer {
                    sdp: description.sdp,
                },
                version,
                false,
            )?,
            Signal::Candidate(candidate) => SignalEnvelope::new(
                sender,
                recipient,
                &SignalMessage::Candidate {
                    ice_candidate: candidate,
                },
                0,
                false,
            )?,
        };

        debug!("Sending {:?} to {}", kind, recipient);
        if let Err(e) = self.bus.send(BusCommand::Signal(envelope)).await {
            warn!("Failed to relay {:?} to {}: {}", kind, recipient, e);
            self.hub.emit(&MeshEvent::error(Some(recipient), e));
        }
        Ok(())
    }

    /// Relay a context command; bus failures are returned to the caller
    pub async fn send_command(&self, command: ContextCommand) -> Result<()> {
        debug!("Sending context command {:?}", command);
        self.bus.send(BusCommand::Context(command)).await
    }

    /// Register a handler for one kind of inbound signal
    pub fn on_signal<F>(&self, kind: SignalKind, handler: F) -> HandlerId
    where
        F: Fn(&InboundSignal) + Send + Sync + 'static,
    {
        self.handlers.subscribe(move |inbound: &InboundSignal| {
            if inbound.signal.kind() == kind {
                handler(inbound);
            }
        })
    }

    /// Remove a handler registered with [`on_signal`](Self::on_signal)
    pub fn off(&self, id: HandlerId) -> bool {
        self.handlers.unsubscribe(id)
    }

    /// Parse an inbound envelope and deliver it to the handlers
    ///
    /// Malformed envelopes and envelopes addressed to someone else are
    /// logged and dropped; the return value says whether it was delivered.
    pub fn dispatch(&self, envelope: SignalEnvelope) -> bool {
        match self.parse(envelope) {
            Ok(inbound) => {
                debug!("Received {:?} from {}", inbound.signal.kind(), inbound.sender);
                self.handlers.emit(&inbound);
                true
            }
            Err(e) => {
                warn!("Dropping inbound signal: {}", e);
                false
            }
        }
    }

    fn parse(&self, envelope: SignalEnvelope) -> Result<InboundSignal> {
        if envelope.sender.is_empty() {
            return Err(Error::MalformedSignal {
                sender: String::new(),
                reason: "missing sender".to_string(),
            });
        }

        if let Some(local) = self.local_peer_id.read().as_deref() {
            if envelope.recipient != local {
                return Err(Error::MalformedSignal {
                    sender: envelope.sender.clone(),
                    reason: format!("addressed to {}, not {}", envelope.recipient, local),
                });
            }
        }

        let signal = match envelope.decode()? {
            SignalMessage::Offer { sdp } => Signal::Offer {
                description: SessionDescription {
                    kind: DescriptionKind::Offer,
                    sdp,
                },
                version: envelope.version,
                skip_local_tracks: envelope.skip_local_tracks,
            },
            SignalMessage::Answer { sdp } => Signal::Answer {
                description: SessionDescription {
                    kind: DescriptionKind::Answer,
                    sdp,
                },
                version: envelope.version,
            },
            SignalMessage::Candidate { ice_candidate } => Signal::Candidate(ice_candidate),
        };

        Ok(InboundSignal {
            sender: envelope.sender,
            recipient: envelope.recipient,
            signal,
        })
    }
}
