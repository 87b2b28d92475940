//! Per-peer session state
//!
//! A [`PeerSession`] holds everything the mesh knows about one remote
//! peer: negotiation state, description versions, buffered candidates,
//! the transport handle and its channel instances. Negotiation steps for
//! the session run one at a time: commands queue in the session inbox and
//! a single worker processes them while holding the session gate.

use crate::transport::{
    ChannelHandle, ConnectivityState, IceCandidate, SessionDescription, TransportHandle,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Negotiation state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    /// Created, nothing negotiated yet
    Idle,
    /// Local offer sent, waiting for the answer
    OfferPending,
    /// Remote offer applied, answer being produced
    AnswerPending,
    /// Offer/answer complete
    Connected,
    /// Transport lost; session kept until closed
    Disconnected,
    /// Torn down; terminal
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::OfferPending => "offer-pending",
            NegotiationState::AnswerPending => "answer-pending",
            NegotiationState::Connected => "connected",
            NegotiationState::Disconnected => "disconnected",
            NegotiationState::Closed => "closed",
        };
        f.write_str(name)
    }
}

impl NegotiationState {
    /// Offer or answer in flight
    pub fn is_negotiating(&self) -> bool {
        matches!(
            self,
            NegotiationState::OfferPending | NegotiationState::AnswerPending
        )
    }
}

/// Work item for a session worker
#[derive(Debug, Clone)]
pub(crate) enum PeerCommand {
    Connect,
    RemoteOffer {
        description: SessionDescription,
        version: u64,
        skip_local_tracks: bool,
    },
    RemoteAnswer {
        description: SessionDescription,
        version: u64,
    },
    RemoteCandidate(IceCandidate),
    /// Gathered locally; relayed after any description being sent
    LocalCandidate(IceCandidate),
    ResourcesChanged,
    Connectivity(ConnectivityState),
    NegotiationTimeout {
        version: u64,
    },
}

/// Mutable session fields, guarded by a sync lock that is never held
/// across an await
pub(crate) struct SessionInner {
    pub(crate) state: NegotiationState,
    pub(crate) transport: Option<Arc<dyn TransportHandle>>,
    pub(crate) local_version: u64,
    pub(crate) remote_version: u64,
    pub(crate) has_remote_description: bool,
    pub(crate) pending_candidates: VecDeque<IceCandidate>,
    pub(crate) data_channels: HashMap<String, Arc<dyn ChannelHandle>>,
    pub(crate) attached_tracks: HashSet<String>,
    pub(crate) renegotiation_needed: bool,
    /// State to return to when an offer is abandoned
    pub(crate) stable_state: NegotiationState,
    pub(crate) connected_at: Option<SystemTime>,
}

/// Snapshot of one session
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    /// Remote peer id
    pub peer_id: String,
    /// Session instance id
    pub session_id: String,
    /// Negotiation state
    pub state: NegotiationState,
    /// Local description version
    pub local_version: u64,
    /// Highest applied remote description version
    pub remote_version: u64,
    /// Channel labels with an instance on this session
    pub data_channels: Vec<String>,
    /// Number of local tracks attached
    pub attached_tracks: usize,
    /// Connection duration (if connected)
    pub duration_secs: Option<u64>,
}

/// One remote peer
pub struct PeerSession {
    peer_id: String,
    session_id: String,
    inner: Mutex<SessionInner>,
    gate: tokio::sync::Mutex<()>,
    inbox: mpsc::UnboundedSender<PeerCommand>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerCommand>>>,
    closed: watch::Sender<bool>,
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer_id", &self.peer_id)
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .finish()
    }
}

impl PeerSession {
    /// Create an idle session
    pub fn new(peer_id: impl Into<String>) -> Self {
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        Self {
            peer_id: peer_id.into(),
            session_id: uuid::Uuid::new_v4().to_string(),
            inner: Mutex::new(SessionInner {
                state: NegotiationState::Idle,
                transport: None,
                local_version: 0,
                remote_version: 0,
                has_remote_description: false,
                pending_candidates: VecDeque::new(),
                data_channels: HashMap::new(),
                attached_tracks: HashSet::new(),
                renegotiation_needed: false,
                stable_state: NegotiationState::Idle,
                connected_at: None,
            }),
            gate: tokio::sync::Mutex::new(()),
            inbox,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            closed,
        }
    }

    /// Remote peer id
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Unique id of this session instance
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Current negotiation state
    pub fn state(&self) -> NegotiationState {
        self.inner.lock().state
    }

    /// Whether the session has been closed
    pub fn is_closed(&self) -> bool {
        self.state() == NegotiationState::Closed
    }

    /// Version of the last local description sent
    pub fn local_version(&self) -> u64 {
        self.inner.lock().local_version
    }

    /// Highest remote description version applied
    pub fn remote_version(&self) -> u64 {
        self.inner.lock().remote_version
    }

    /// Whether a remote description has been applied
    pub fn has_remote_description(&self) -> bool {
        self.inner.lock().has_remote_description
    }

    /// Number of candidates waiting for a remote description
    pub fn pending_candidates(&self) -> usize {
        self.inner.lock().pending_candidates.len()
    }

    /// Labels of the channel instances on this session, sorted
    pub fn data_channel_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.inner.lock().data_channels.keys().cloned().collect();
        labels.sort();
        labels
    }

    /// Channel instance for a label
    pub fn data_channel(&self, label: &str) -> Option<Arc<dyn ChannelHandle>> {
        self.inner.lock().data_channels.get(label).cloned()
    }

    /// Ids of local tracks attached to the handle
    pub fn attached_tracks(&self) -> HashSet<String> {
        self.inner.lock().attached_tracks.clone()
    }

    /// Whether a resource change is waiting for the current negotiation
    pub fn renegotiation_needed(&self) -> bool {
        self.inner.lock().renegotiation_needed
    }

    /// When the transport last reported connectivity
    pub fn connected_at(&self) -> Option<SystemTime> {
        self.inner.lock().connected_at
    }

    /// Transport handle, once created
    pub fn transport(&self) -> Option<Arc<dyn TransportHandle>> {
        self.inner.lock().transport.clone()
    }

    /// Snapshot for listings
    pub fn info(&self) -> PeerInfo {
        let inner = self.inner.lock();
        let mut data_channels: Vec<String> = inner.data_channels.keys().cloned().collect();
        data_channels.sort();
        PeerInfo {
            peer_id: self.peer_id.clone(),
            session_id: self.session_id.clone(),
            state: inner.state,
            local_version: inner.local_version,
            remote_version: inner.remote_version,
            data_channels,
            attached_tracks: inner.attached_tracks.len(),
            duration_secs: inner
                .connected_at
                .and_then(|t| t.elapsed().ok())
                .map(|d| d.as_secs()),
        }
    }

    pub(crate) fn with_inner<R>(&self, f: impl FnOnce(&mut SessionInner) -> R) -> R {
        f(&mut self.inner.lock())
    }

    /// Move to `to`. Returns the previous state if it changed; a closed
    /// session never leaves Closed.
    pub(crate) fn transition(&self, to: NegotiationState) -> Option<NegotiationState> {
        let mut inner = self.inner.lock();
        let from = inner.state;
        if from == to || from == NegotiationState::Closed {
            return None;
        }
        inner.state = to;
        if matches!(
            to,
            NegotiationState::Idle | NegotiationState::Connected | NegotiationState::Disconnected
        ) {
            inner.stable_state = to;
        }
        debug!("Session {} state: {} -> {}", self.peer_id, from, to);
        Some(from)
    }

    /// Queue a command; returns `false` once the session is closed
    pub(crate) fn enqueue(&self, command: PeerCommand) -> bool {
        if self.is_closed() {
            return false;
        }
        self.inbox.send(command).is_ok()
    }

    /// Take the inbox receiver; only the first caller gets it
    pub(crate) fn take_inbox(&self) -> Option<mpsc::UnboundedReceiver<PeerCommand>> {
        self.inbox_rx.lock().take()
    }

    /// Serialize negotiation and resource mutation for this session
    pub(crate) async fn lock_gate(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    /// Resolves once the session is closed
    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Close the session
    ///
    /// The state becomes Closed immediately, before any await, so work in
    /// flight sees it at its next check. The handle and channel instances
    /// are released exactly once. Returns `false` if already closed.
    pub async fn close(&self) -> bool {
        let (transport, channels) = {
            let mut inner = self.inner.lock();
            if inner.state == NegotiationState::Closed {
                return false;
            }
            inner.state = NegotiationState::Closed;
            inner.pending_candidates.clear();
            inner.renegotiation_needed = false;
            (
                inner.transport.take(),
                std::mem::take(&mut inner.data_channels),
            )
        };
        self.closed.send_replace(true);
        info!("Closing session with peer {}", self.peer_id);

        for (label, channel) in channels {
            if let Err(e) = channel.close().await {
                warn!("Error closing channel '{}' for {}: {}", label, self.peer_id, e);
            }
        }
        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                warn!("Error closing transport for {}: {}", self.peer_id, e);
            }
        }
        true
    }
}
