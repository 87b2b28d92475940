//! Top-level orchestrator
//!
//! A [`Mesh`] owns one instance of every component and runs a router task
//! that is the single logical queue for bus events, transport events and
//! local resource changes.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Mesh                                                     │
//! │  ├─ SignalingBridge ◀──── SignalingBus (WebSocket/memory) │
//! │  ├─ ContextController                                     │
//! │  ├─ NegotiationEngine ──▶ per-peer workers                │
//! │  │   └─ CandidateRelay                                    │
//! │  ├─ LocalResourceManager                                  │
//! │  ├─ PeerSessionStore                                      │
//! │  └─ EventHub ──▶ application observers                    │
//! │                                                           │
//! │  router: bus events │ transport events │ resource events  │
//! └──────────────────────────────────────────────────────────┘
//! ```

use crate::config::{DataChannelConfig, IceServerConfig, MeshConfig};
use crate::context::{ContextController, ContextState};
use crate::events::{EventHub, HandlerId, MeshEvent};
use crate::media::{
    DataChannel, LocalResourceManager, MediaStream, MediaTrack, ResourceEvent, TrackConstraint,
    TrackKind,
};
use crate::negotiation::NegotiationEngine;
use crate::session::{NegotiationState, PeerInfo, PeerSession, PeerSessionStore};
use crate::signaling::{BusEvent, InboundSignal, SignalKind, SignalingBridge, SignalingBus};
use crate::transport::{PeerTransportEvent, RemoteTrack, SenderInfo, TransportEngine};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receivers the router drains, taken on start
struct RouterInputs {
    transport_events: mpsc::UnboundedReceiver<PeerTransportEvent>,
    resource_events: mpsc::UnboundedReceiver<ResourceEvent>,
}

struct RouterHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
    signal_handlers: Vec<HandlerId>,
}

/// Multi-peer connection orchestrator
pub struct Mesh {
    config: MeshConfig,
    bus: Arc<dyn SignalingBus>,
    hub: Arc<EventHub>,
    store: Arc<PeerSessionStore>,
    bridge: Arc<SignalingBridge>,
    resources: Arc<LocalResourceManager>,
    engine: Arc<NegotiationEngine>,
    controller: Arc<ContextController>,
    inputs: Mutex<Option<RouterInputs>>,
    router: Mutex<Option<RouterHandle>>,
}

impl Mesh {
    /// Create a mesh over a signaling bus and a transport engine
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid.
    pub fn new(
        config: MeshConfig,
        bus: Arc<dyn SignalingBus>,
        transport: Arc<dyn TransportEngine>,
    ) -> Result<Self> {
        config.validate()?;
        info!("Creating mesh (max {} peers)", config.max_peers);

        let hub = Arc::new(EventHub::new());
        let store = Arc::new(PeerSessionStore::new(config.max_peers, hub.clone()));
        let bridge = Arc::new(SignalingBridge::new(bus.clone(), hub.clone()));

        let (resource_tx, resource_rx) = mpsc::unbounded_channel();
        let resources = Arc::new(LocalResourceManager::new(
            store.clone(),
            hub.clone(),
            resource_tx,
        ));

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(NegotiationEngine::new(
            &config,
            store.clone(),
            bridge.clone(),
            resources.clone(),
            transport,
            hub.clone(),
            transport_tx,
        ));

        let controller = Arc::new(ContextController::new(
            bridge.clone(),
            store.clone(),
            engine.clone(),
            hub.clone(),
            config.auto_connect_on_context_change,
        ));

        Ok(Self {
            config,
            bus,
            hub,
            store,
            bridge,
            resources,
            engine,
            controller,
            inputs: Mutex::new(Some(RouterInputs {
                transport_events: transport_rx,
                resource_events: resource_rx,
            })),
            router: Mutex::new(None),
        })
    }

    /// Start routing bus, transport and resource events
    ///
    /// A mesh can be started once.
    pub fn start(&self) -> Result<()> {
        let inputs = self
            .inputs
            .lock()
            .take()
            .ok_or_else(|| Error::InvalidState("mesh already started".to_string()))?;
        let bus_events = self.bus.subscribe()?;

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let signal_handlers = [SignalKind::Offer, SignalKind::Answer, SignalKind::Candidate]
            .into_iter()
            .map(|kind| {
                let tx = signal_tx.clone();
                self.bridge.on_signal(kind, move |inbound: &InboundSignal| {
                    let _ = tx.send(inbound.clone());
                })
            })
            .collect();

        let (stop, stop_rx) = oneshot::channel();
        let router = Router {
            bridge: self.bridge.clone(),
            engine: self.engine.clone(),
            controller: self.controller.clone(),
            hub: self.hub.clone(),
        };
        let task = tokio::spawn(router.run(bus_events, signal_rx, inputs, stop_rx));

        *self.router.lock() = Some(RouterHandle {
            stop,
            task,
            signal_handlers,
        });
        info!("Mesh started");
        Ok(())
    }

    /// Close every session and stop the router
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down mesh");
        let router = self.router.lock().take();

        let closed = self.store.clear().await;
        debug!("Closed {} sessions", closed);

        if let Some(router) = router {
            for id in router.signal_handlers {
                self.bridge.off(id);
            }
            let _ = router.stop.send(());
            if let Err(e) = router.task.await {
                warn!("Router task ended abnormally: {}", e);
            }
        }

        info!("Mesh shutdown complete");
        Ok(())
    }

    // ---- observers -------------------------------------------------------

    /// Register an observer for every [`MeshEvent`]
    pub fn subscribe<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&MeshEvent) + Send + Sync + 'static,
    {
        self.hub.subscribe(handler)
    }

    /// Receive every [`MeshEvent`] on a channel
    pub fn events(&self) -> (HandlerId, mpsc::UnboundedReceiver<MeshEvent>) {
        self.hub.subscribe_channel()
    }

    /// Remove an observer
    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        self.hub.unsubscribe(id)
    }

    // ---- context ---------------------------------------------------------

    /// Configuration this mesh was created with
    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Id the bus assigned to us
    pub fn local_peer_id(&self) -> Option<String> {
        self.bridge.local_peer_id()
    }

    /// Current context id, once acknowledged
    pub fn context(&self) -> Option<String> {
        self.controller.context()
    }

    /// Context membership state
    pub fn context_state(&self) -> ContextState {
        self.controller.state()
    }

    /// Wait for the bus to acknowledge a context
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<String> {
        self.controller.wait_until_ready(timeout).await
    }

    /// Close every session and move to `context`
    pub async fn change_context(&self, context: &str) -> Result<()> {
        self.controller.change_context(context).await
    }

    /// Ask the bus for the members of the current context
    pub async fn connect_context(&self) -> Result<()> {
        self.controller.connect_context().await
    }

    /// Negotiate with one peer
    pub async fn connect(&self, peer_id: &str) -> Result<()> {
        self.controller.connect(peer_id).await
    }

    /// Negotiate with several peers; returns how many were asked to connect
    pub async fn connect_all(&self, peer_ids: &[String]) -> Result<usize> {
        self.controller.connect_all(peer_ids).await
    }

    /// Close everything and move to a private context
    pub async fn disconnect(&self) -> Result<()> {
        self.controller.disconnect().await
    }

    /// Close the session with one peer
    pub async fn disconnect_peer(&self, peer_id: &str) -> bool {
        self.controller.disconnect_peer(peer_id).await
    }

    // ---- sessions --------------------------------------------------------

    /// Session with `peer_id`, if any
    pub async fn session(&self, peer_id: &str) -> Option<Arc<PeerSession>> {
        self.store.get(peer_id).await
    }

    /// Negotiation state with `peer_id`
    pub async fn peer_state(&self, peer_id: &str) -> Option<NegotiationState> {
        self.store.get(peer_id).await.map(|s| s.state())
    }

    /// Snapshot of every session, sorted by peer id
    pub async fn list_peers(&self) -> Vec<PeerInfo> {
        self.store.list_peers().await
    }

    /// Local tracks being sent to `peer_id`
    pub async fn rtp_senders(&self, peer_id: &str) -> Result<Vec<SenderInfo>> {
        let session = self.require_session(peer_id).await?;
        match session.transport() {
            Some(transport) => Ok(transport.senders().await),
            None => Ok(Vec::new()),
        }
    }

    /// Tracks received from `peer_id`
    pub async fn rtp_receivers(&self, peer_id: &str) -> Result<Vec<RemoteTrack>> {
        let session = self.require_session(peer_id).await?;
        match session.transport() {
            Some(transport) => Ok(transport.receivers().await),
            None => Ok(Vec::new()),
        }
    }

    async fn require_session(&self, peer_id: &str) -> Result<Arc<PeerSession>> {
        self.store
            .get(peer_id)
            .await
            .ok_or_else(|| Error::PeerNotFound(peer_id.to_string()))
    }

    /// Use an extra ICE server for sessions created from now on
    pub fn add_ice_server(&self, server: IceServerConfig) -> Result<()> {
        server.validate()?;
        self.engine.add_ice_server(server);
        Ok(())
    }

    // ---- local resources -------------------------------------------------

    /// Recorded local streams
    pub fn streams(&self) -> Vec<MediaStream> {
        self.resources.streams()
    }

    /// Send `stream` to every current and future peer
    pub async fn add_stream(&self, stream: MediaStream) -> Result<()> {
        self.resources.add_stream(stream).await
    }

    /// Stop sending `stream_id`; returns whether it was recorded
    pub async fn remove_stream(&self, stream_id: &str) -> Result<bool> {
        self.resources.remove_stream(stream_id).await
    }

    /// Add `track` to a recorded stream and send it to every peer
    pub async fn add_track_to_peers(&self, stream_id: &str, track: MediaTrack) -> Result<()> {
        self.resources.add_track_to_peers(stream_id, track).await
    }

    /// Stop sending `track_id` to every peer that has it
    pub async fn remove_track_from_peers(&self, track_id: &str) -> Result<()> {
        self.resources.remove_track_from_peers(track_id).await
    }

    /// Constrain every local track of `kind`
    pub async fn apply_constraint(
        &self,
        kind: TrackKind,
        constraint: TrackConstraint,
    ) -> Result<usize> {
        self.resources.apply_constraint(kind, constraint).await
    }

    /// Open a data channel with every current and future peer
    ///
    /// `None` uses the configured default channel settings.
    pub async fn create_data_channel(
        &self,
        label: &str,
        config: Option<DataChannelConfig>,
    ) -> Result<DataChannel> {
        let config = config.unwrap_or_else(|| self.config.default_channel.clone());
        self.resources.create_data_channel(label, config).await
    }

    /// Registered data channel
    pub fn data_channel(&self, label: &str) -> Option<DataChannel> {
        self.resources.data_channel(label)
    }

    /// Close a data channel with every peer
    pub async fn remove_data_channel(&self, label: &str) -> Result<bool> {
        self.resources.remove_data_channel(label).await
    }
}

/// Single consumer of everything that drives the mesh
struct Router {
    bridge: Arc<SignalingBridge>,
    engine: Arc<NegotiationEngine>,
    controller: Arc<ContextController>,
    hub: Arc<EventHub>,
}

impl Router {
    async fn run(
        self,
        mut bus_events: mpsc::UnboundedReceiver<BusEvent>,
        mut signals: mpsc::UnboundedReceiver<InboundSignal>,
        mut inputs: RouterInputs,
        mut stop: oneshot::Receiver<()>,
    ) {
        debug!("Mesh router running");
        loop {
            tokio::select! {
                biased;
                _ = &mut stop => break,
                event = bus_events.recv() => match event {
                    Some(event) => self.on_bus_event(event).await,
                    None => {
                        warn!("Signaling bus closed");
                        self.hub.emit(&MeshEvent::error(
                            None,
                            Error::SignalingError("signaling bus closed".to_string()),
                        ));
                        break;
                    }
                },
                Some(inbound) = signals.recv() => {
                    if let Err(e) = self.engine.handle_signal(inbound).await {
                        warn!("Failed to route signal: {}", e);
                        self.hub.emit(&MeshEvent::error(None, e));
                    }
                }
                Some(event) = inputs.transport_events.recv() => {
                    self.engine.handle_transport_event(event).await;
                }
                Some(event) = inputs.resource_events.recv() => {
                    self.engine.notify_resources_changed(event.peer_id()).await;
                }
            }
        }
        debug!("Mesh router stopped");
    }

    async fn on_bus_event(&self, event: BusEvent) {
        match event {
            BusEvent::Signal(envelope) => {
                self.bridge.dispatch(envelope);
            }
            BusEvent::Context(event) => self.controller.handle_event(event).await,
            BusEvent::Error(message) => {
                warn!("Signaling bus error: {}", message);
                self.hub
                    .emit(&MeshEvent::error(None, Error::SignalingError(message)));
            }
        }
    }
}

impl Drop for Mesh {
    fn drop(&mut self) {
        if let Some(router) = self.router.get_mut().take() {
            router.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::MemoryHub;
    use crate::transport::mock::MockEngine;

    fn mesh(hub: &MemoryHub, id: &str) -> Mesh {
        let bus: Arc<dyn SignalingBus> = Arc::new(hub.connect_as(id));
        Mesh::new(MeshConfig::default(), bus, Arc::new(MockEngine::new())).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let hub = MemoryHub::new();
        let bus: Arc<dyn SignalingBus> = Arc::new(hub.connect_as("a"));
        let config = MeshConfig {
            max_peers: 0,
            ..Default::default()
        };
        assert!(Mesh::new(config, bus, Arc::new(MockEngine::new())).is_err());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let hub = MemoryHub::new();
        let mesh = mesh(&hub, "a");
        mesh.start().unwrap();
        assert!(matches!(mesh.start(), Err(Error::InvalidState(_))));
        mesh.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_ready_after_context_created() {
        let hub = MemoryHub::new();
        let mesh = mesh(&hub, "a");
        mesh.start().unwrap();

        let context = mesh.wait_until_ready(Duration::from_secs(1)).await.unwrap();
        assert_eq!(hub.context_of("a"), Some(context));
        assert_eq!(mesh.local_peer_id().as_deref(), Some("a"));
        mesh.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_rtp_senders_unknown_peer() {
        let hub = MemoryHub::new();
        let mesh = mesh(&hub, "a");
        assert!(matches!(
            mesh.rtp_senders("nobody").await,
            Err(Error::PeerNotFound(_))
        ));
        assert!(matches!(
            mesh.rtp_receivers("nobody").await,
            Err(Error::PeerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_default_channel_config() {
        let hub = MemoryHub::new();
        let mesh = mesh(&hub, "a");
        let chat = mesh.create_data_channel("chat", None).await.unwrap();
        assert_eq!(chat.config(), &mesh.config().default_channel);
        assert!(mesh.data_channel("chat").is_some());
    }
}
