//! Per-peer offer/answer state machine
//!
//! Every session gets one worker task that drains its inbox in order and
//! holds the session gate while it processes a command. Workers for
//! different peers run independently, so a slow negotiation with one peer
//! never delays another.
//!
//! State transitions:
//!
//! ```text
//! Idle ──connect──────────────▶ OfferPending ──answer──▶ Connected
//!   │                               │  ▲                    │
//!   └──remote offer─▶ AnswerPending ◀┘  └──resources changed─┘
//!                         │
//!                         └──answer sent──▶ Connected
//! any ──transport lost──▶ Disconnected      any ──close──▶ Closed
//! ```
//!
//! Glare is resolved by peer id: the lexicographically smaller id keeps its
//! offer, the larger id rolls back and answers.

use super::candidates::CandidateRelay;
use crate::config::{IceServerConfig, MeshConfig};
use crate::events::{EventHub, MeshEvent};
use crate::media::LocalResourceManager;
use crate::session::{NegotiationState, PeerCommand, PeerSession, PeerSessionStore};
use crate::signaling::{InboundSignal, Signal, SignalingBridge};
use crate::transport::{
    ConnectivityState, PeerTransportEvent, SessionDescription, TransportEngine, TransportEvent,
    TransportEventSink, TransportHandle,
};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

/// Drives negotiation for every session
pub struct NegotiationEngine {
    store: Arc<PeerSessionStore>,
    bridge: Arc<SignalingBridge>,
    resources: Arc<LocalResourceManager>,
    transport: Arc<dyn TransportEngine>,
    hub: Arc<EventHub>,
    transport_events: mpsc::UnboundedSender<PeerTransportEvent>,
    ice_servers: RwLock<Vec<IceServerConfig>>,
    negotiation_timeout: Duration,
}

impl NegotiationEngine {
    /// Create an engine
    ///
    /// `transport_events` is handed to every transport handle; whoever owns
    /// the receiving end feeds the events back through
    /// [`handle_transport_event`](Self::handle_transport_event).
    pub fn new(
        config: &MeshConfig,
        store: Arc<PeerSessionStore>,
        bridge: Arc<SignalingBridge>,
        resources: Arc<LocalResourceManager>,
        transport: Arc<dyn TransportEngine>,
        hub: Arc<EventHub>,
        transport_events: mpsc::UnboundedSender<PeerTransportEvent>,
    ) -> Self {
        Self {
            store,
            bridge,
            resources,
            transport,
            hub,
            transport_events,
            ice_servers: RwLock::new(config.ice_servers.clone()),
            negotiation_timeout: config.negotiation_timeout(),
        }
    }

    /// ICE servers used for handles created from now on
    pub fn ice_servers(&self) -> Vec<IceServerConfig> {
        self.ice_servers.read().clone()
    }

    /// Append an ICE server; existing handles keep their configuration
    pub fn add_ice_server(&self, server: IceServerConfig) {
        info!("Adding ICE server {:?}", server.urls);
        self.ice_servers.write().push(server);
    }

    /// Get or create the session for `peer_id`, starting its worker on
    /// creation
    pub async fn session(self: &Arc<Self>, peer_id: &str) -> Result<Arc<PeerSession>> {
        let (session, created) = self.store.get_or_create(peer_id).await?;
        if created {
            self.spawn_worker(session.clone());
        }
        Ok(session)
    }

    /// Start negotiating with `peer_id` unless already connected or in
    /// progress
    pub async fn connect(self: &Arc<Self>, peer_id: &str) -> Result<()> {
        let session = self.session(peer_id).await?;
        session.enqueue(PeerCommand::Connect);
        Ok(())
    }

    /// Route a parsed inbound signal to its session
    ///
    /// Offers create the session if needed. Answers and candidates for
    /// unknown peers are dropped.
    pub async fn handle_signal(self: &Arc<Self>, inbound: InboundSignal) -> Result<()> {
        let command = match inbound.signal {
            Signal::Offer {
                description,
                version,
                skip_local_tracks,
            } => {
                let session = self.session(&inbound.sender).await?;
                session.enqueue(PeerCommand::RemoteOffer {
                    description,
                    version,
                    skip_local_tracks,
                });
                return Ok(());
            }
            Signal::Answer {
                description,
                version,
            } => PeerCommand::RemoteAnswer {
                description,
                version,
            },
            Signal::Candidate(candidate) => PeerCommand::RemoteCandidate(candidate),
        };

        match self.store.get(&inbound.sender).await {
            Some(session) => {
                session.enqueue(command);
            }
            None => debug!("Dropping signal from unknown peer {}", inbound.sender),
        }
        Ok(())
    }

    /// Local tracks of `peer_id`'s session changed
    pub async fn notify_resources_changed(&self, peer_id: &str) {
        if let Some(session) = self.store.get(peer_id).await {
            session.enqueue(PeerCommand::ResourcesChanged);
        }
    }

    /// Apply an event reported by a transport handle
    ///
    /// Events from a session instance that is no longer in the store are
    /// ignored.
    pub async fn handle_transport_event(&self, event: PeerTransportEvent) {
        let PeerTransportEvent {
            peer_id,
            session_id,
            event,
        } = event;

        let Some(session) = self.store.get(&peer_id).await else {
            debug!("Transport event for unknown peer {}", peer_id);
            return;
        };
        if session.session_id() != session_id || session.is_closed() {
            debug!("Ignoring transport event from stale session of {}", peer_id);
            return;
        }

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                session.enqueue(PeerCommand::LocalCandidate(candidate));
            }
            TransportEvent::Connectivity(state) => {
                session.enqueue(PeerCommand::Connectivity(state));
            }
            TransportEvent::RemoteTrack(track) => {
                self.hub.emit(&MeshEvent::RemoteTrack { peer_id, track });
            }
            TransportEvent::RemoteTrackEnded { track_id } => {
                self.hub
                    .emit(&MeshEvent::RemoteTrackLost { peer_id, track_id });
            }
            TransportEvent::RemoteChannel(channel) => {
                self.resources.adopt_remote_channel(&session, channel);
            }
            TransportEvent::ChannelOpen { label } => {
                self.hub.emit(&MeshEvent::ChannelOpen { peer_id, label });
            }
            TransportEvent::ChannelClosed { label } => {
                self.hub.emit(&MeshEvent::ChannelClosed { peer_id, label });
            }
            TransportEvent::ChannelMessage { label, data } => {
                self.hub.emit(&MeshEvent::ChannelMessage {
                    peer_id,
                    label,
                    data,
                });
            }
        }
    }

    fn spawn_worker(self: &Arc<Self>, session: Arc<PeerSession>) {
        let Some(mut inbox) = session.take_inbox() else {
            return;
        };
        let engine: Weak<Self> = Arc::downgrade(self);
        let mut closed = session.closed_signal();

        tokio::spawn(async move {
            loop {
                let command = tokio::select! {
                    biased;
                    _ = wait_closed(&mut closed) => break,
                    command = inbox.recv() => match command {
                        Some(command) => command,
                        None => break,
                    },
                };
                let Some(engine) = engine.upgrade() else {
                    break;
                };

                let _gate = session.lock_gate().await;
                if session.is_closed() {
                    break;
                }
                engine.process(&session, command).await;
            }
            debug!("Negotiation worker for {} exited", session.peer_id());
        });
    }

    async fn process(&self, session: &PeerSession, command: PeerCommand) {
        let result = match command {
            PeerCommand::Connect => self.on_connect(session).await,
            PeerCommand::RemoteOffer {
                description,
                version,
                skip_local_tracks,
            } => {
                self.accept_offer(session, description, version, skip_local_tracks)
                    .await
            }
            PeerCommand::RemoteAnswer {
                description,
                version,
            } => self.accept_answer(session, description, version).await,
            PeerCommand::RemoteCandidate(candidate) => {
                CandidateRelay::enqueue_locked(session, candidate).await;
                Ok(())
            }
            PeerCommand::LocalCandidate(candidate) => {
                self.bridge
                    .send(session.peer_id(), Signal::Candidate(candidate))
                    .await
            }
            PeerCommand::ResourcesChanged => self.on_resources_changed(session).await,
            PeerCommand::Connectivity(state) => self.on_connectivity(session, state).await,
            PeerCommand::NegotiationTimeout { version } => self.on_timeout(session, version).await,
        };

        if let Err(e) = result {
            if session.is_closed() {
                debug!("Discarding result for closed session {}: {}", session.peer_id(), e);
            } else {
                if e.is_retryable() {
                    warn!("Negotiation with {} failed: {}", session.peer_id(), e);
                } else {
                    error!("Negotiation with {} failed: {}", session.peer_id(), e);
                }
                self.hub
                    .emit(&MeshEvent::error(Some(session.peer_id()), e));
            }
        }
    }

    fn set_state(&self, session: &PeerSession, to: NegotiationState) {
        if let Some(from) = session.transition(to) {
            self.hub.emit(&MeshEvent::NegotiationStateChanged {
                peer_id: session.peer_id().to_string(),
                from,
                to,
            });
        }
    }

    fn check_open(session: &PeerSession) -> Result<()> {
        if session.is_closed() {
            return Err(Error::SessionClosed(session.peer_id().to_string()));
        }
        Ok(())
    }

    /// Return the session's handle, creating it on first use
    async fn ensure_transport(&self, session: &PeerSession) -> Result<Arc<dyn TransportHandle>> {
        if let Some(transport) = session.transport() {
            return Ok(transport);
        }

        let sink = TransportEventSink::new(
            session.peer_id(),
            session.session_id(),
            self.transport_events.clone(),
        );
        let ice_servers = self.ice_servers();
        let transport = self
            .transport
            .create_handle(session.peer_id(), &ice_servers, sink)
            .await?;

        if session.is_closed() {
            // closed while the handle was being created
            if let Err(e) = transport.close().await {
                warn!("Error closing orphaned transport for {}: {}", session.peer_id(), e);
            }
            return Err(Error::SessionClosed(session.peer_id().to_string()));
        }
        session.with_inner(|inner| inner.transport = Some(transport.clone()));

        if let Err(e) = self.resources.replay_channels(session).await {
            warn!("Failed to replay channels for {}: {}", session.peer_id(), e);
            self.hub.emit(&MeshEvent::error(Some(session.peer_id()), e));
        }
        Ok(transport)
    }

    async fn on_connect(&self, session: &PeerSession) -> Result<()> {
        match session.state() {
            NegotiationState::Idle | NegotiationState::Disconnected => {
                self.start_offer(session, false).await
            }
            state => {
                debug!("Connect to {} ignored in state {}", session.peer_id(), state);
                Ok(())
            }
        }
    }

    #[instrument(skip(self, session), fields(peer_id = %session.peer_id()))]
    async fn start_offer(&self, session: &PeerSession, skip_local_tracks: bool) -> Result<()> {
        let transport = self.ensure_transport(session).await?;
        if !skip_local_tracks {
            self.resources.attach_local_resources(session).await?;
        }
        Self::check_open(session)?;

        let offer = transport.create_offer().await?;
        Self::check_open(session)?;
        transport.set_local_description(offer.clone()).await?;
        Self::check_open(session)?;

        let version = session.with_inner(|inner| {
            inner.local_version += 1;
            inner.renegotiation_needed = false;
            inner.local_version
        });
        self.set_state(session, NegotiationState::OfferPending);

        let sent = self
            .bridge
            .send(
                session.peer_id(),
                Signal::Offer {
                    description: offer,
                    version,
                    skip_local_tracks,
                },
            )
            .await;
        if let Err(e) = sent {
            if let Err(rollback_err) = transport.rollback().await {
                warn!("Rollback after failed send to {}: {}", session.peer_id(), rollback_err);
            }
            let stable = session.with_inner(|inner| inner.stable_state);
            self.set_state(session, stable);
            return Err(e);
        }

        info!("Sent offer v{} to {}", version, session.peer_id());
        self.schedule_timeout(session, version);
        Ok(())
    }

    fn schedule_timeout(&self, session: &PeerSession, version: u64) {
        let timeout = self.negotiation_timeout;
        let peer_id = session.peer_id().to_string();
        let store = self.store.clone();
        let session_id = session.session_id().to_string();

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(session) = store.get(&peer_id).await {
                if session.session_id() == session_id {
                    session.enqueue(PeerCommand::NegotiationTimeout { version });
                }
            }
        });
    }

    #[instrument(skip(self, session, description), fields(peer_id = %session.peer_id()))]
    async fn accept_offer(
        &self,
        session: &PeerSession,
        description: SessionDescription,
        version: u64,
        skip_local_tracks: bool,
    ) -> Result<()> {
        let (prior, remote_version) =
            session.with_inner(|inner| (inner.state, inner.remote_version));

        if version < remote_version {
            debug!(
                "Dropping stale offer v{} from {} (applied v{})",
                version,
                session.peer_id(),
                remote_version
            );
            return Ok(());
        }

        let mut rolled_back = false;
        if prior == NegotiationState::OfferPending {
            let local_id = self.bridge.local_peer_id().unwrap_or_default();
            if local_id.as_str() < session.peer_id() {
                info!(
                    "Glare with {}: keeping our offer, dropping theirs",
                    session.peer_id()
                );
                return Ok(());
            }
            if let Some(transport) = session.transport() {
                transport.rollback().await?;
                Self::check_open(session)?;
            }
            rolled_back = true;
            info!("Glare with {}: rolled back our offer to answer", session.peer_id());
        }

        let result = self
            .answer_offer(session, description, version, skip_local_tracks)
            .await;

        if result.is_err() && !session.is_closed() {
            let restore = if rolled_back {
                session.with_inner(|inner| inner.stable_state)
            } else {
                prior
            };
            self.set_state(session, restore);
        }
        result
    }

    async fn answer_offer(
        &self,
        session: &PeerSession,
        description: SessionDescription,
        version: u64,
        skip_local_tracks: bool,
    ) -> Result<()> {
        let transport = self.ensure_transport(session).await?;
        if !skip_local_tracks {
            self.resources.attach_local_resources(session).await?;
        }
        Self::check_open(session)?;

        transport.set_remote_description(description).await?;
        Self::check_open(session)?;
        session.with_inner(|inner| {
            inner.remote_version = version;
            inner.has_remote_description = true;
        });
        self.set_state(session, NegotiationState::AnswerPending);

        CandidateRelay::drain_locked(session).await;
        Self::check_open(session)?;

        let answer = transport.create_answer().await?;
        Self::check_open(session)?;
        transport.set_local_description(answer.clone()).await?;
        Self::check_open(session)?;

        let local_version = session.with_inner(|inner| {
            inner.local_version += 1;
            inner.local_version
        });
        self.bridge
            .send(
                session.peer_id(),
                Signal::Answer {
                    description: answer,
                    version: local_version,
                },
            )
            .await?;

        info!("Sent answer v{} to {}", local_version, session.peer_id());
        self.set_state(session, NegotiationState::Connected);
        self.resume_pending_renegotiation(session).await
    }

    #[instrument(skip(self, session, description), fields(peer_id = %session.peer_id()))]
    async fn accept_answer(
        &self,
        session: &PeerSession,
        description: SessionDescription,
        version: u64,
    ) -> Result<()> {
        let (state, remote_version) =
            session.with_inner(|inner| (inner.state, inner.remote_version));

        if version < remote_version {
            debug!(
                "Dropping stale answer v{} from {} (applied v{})",
                version,
                session.peer_id(),
                remote_version
            );
            return Ok(());
        }
        if state != NegotiationState::OfferPending {
            debug!("Dropping answer from {} in state {}", session.peer_id(), state);
            return Ok(());
        }
        let Some(transport) = session.transport() else {
            return Ok(());
        };

        transport.set_remote_description(description).await?;
        Self::check_open(session)?;
        session.with_inner(|inner| {
            inner.remote_version = version;
            inner.has_remote_description = true;
        });
        self.set_state(session, NegotiationState::Connected);
        info!("Applied answer v{} from {}", version, session.peer_id());

        CandidateRelay::drain_locked(session).await;
        Self::check_open(session)?;
        self.resume_pending_renegotiation(session).await
    }

    async fn resume_pending_renegotiation(&self, session: &PeerSession) -> Result<()> {
        let pending = session.with_inner(|inner| {
            inner.renegotiation_needed && inner.state == NegotiationState::Connected
        });
        if pending {
            debug!("Running deferred renegotiation with {}", session.peer_id());
            self.start_offer(session, true).await?;
        }
        Ok(())
    }

    async fn on_resources_changed(&self, session: &PeerSession) -> Result<()> {
        match session.state() {
            NegotiationState::Connected => self.start_offer(session, true).await,
            state if state.is_negotiating() => {
                session.with_inner(|inner| inner.renegotiation_needed = true);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn on_connectivity(&self, session: &PeerSession, state: ConnectivityState) -> Result<()> {
        match state {
            ConnectivityState::Connected => {
                session.with_inner(|inner| inner.connected_at = Some(SystemTime::now()));
                if session.state() == NegotiationState::Disconnected {
                    self.set_state(session, NegotiationState::Connected);
                    self.resources.replay_channels(session).await?;
                }
                info!("Transport connected to {}", session.peer_id());
                self.hub.emit(&MeshEvent::PeerConnected {
                    peer_id: session.peer_id().to_string(),
                });
            }
            state if state.is_lost() => {
                if session.state() == NegotiationState::Disconnected {
                    return Ok(());
                }
                let channels = session.with_inner(|inner| {
                    inner.connected_at = None;
                    inner.renegotiation_needed = false;
                    inner.pending_candidates.clear();
                    std::mem::take(&mut inner.data_channels)
                });
                for (label, channel) in channels {
                    if let Err(e) = channel.close().await {
                        debug!("Error dropping channel '{}' for {}: {}", label, session.peer_id(), e);
                    }
                }
                self.set_state(session, NegotiationState::Disconnected);
                info!("Transport to {} lost ({:?})", session.peer_id(), state);
                self.hub.emit(&MeshEvent::PeerDisconnected {
                    peer_id: session.peer_id().to_string(),
                });
            }
            _ => {}
        }
        Ok(())
    }

    async fn on_timeout(&self, session: &PeerSession, version: u64) -> Result<()> {
        let (state, local_version, stable) =
            session.with_inner(|inner| (inner.state, inner.local_version, inner.stable_state));
        if state != NegotiationState::OfferPending || local_version != version {
            return Ok(());
        }

        warn!(
            "Offer v{} to {} was not answered in time, rolling back",
            version,
            session.peer_id()
        );
        if let Some(transport) = session.transport() {
            if let Err(e) = transport.rollback().await {
                warn!("Rollback for {} failed: {}", session.peer_id(), e);
            }
        }
        Self::check_open(session)?;
        self.set_state(session, stable);

        Err(Error::NegotiationTimeout {
            peer_id: session.peer_id().to_string(),
            timeout_ms: self.negotiation_timeout.as_millis() as u64,
        })
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        let is_closed = *closed.borrow_and_update();
        if is_closed || closed.changed().await.is_err() {
            return;
        }
    }
}
