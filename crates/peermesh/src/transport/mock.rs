//! In-process Transport Engine for tests and dry runs
//!
//! [`MockEngine`] produces deterministic text descriptions that list the
//! attached senders, so a handle applying a remote description can report
//! the peer's tracks as [`TransportEvent::RemoteTrack`]. Every call is
//! recorded on the handle, and any operation can be made to fail per peer
//! with [`MockEngine::fail_on`].
//!
//! Connectivity is simulated: once a handle has both a local and a remote
//! description it reports [`ConnectivityState::Connected`]. Each applied
//! local description also yields one local candidate.

use super::{
    ChannelHandle, ChannelState, ConnectivityState, DescriptionKind, IceCandidate, RemoteTrack,
    SenderInfo, SessionDescription, TransportEngine, TransportEvent, TransportEventSink,
    TransportHandle,
};
use crate::config::{DataChannelConfig, IceServerConfig};
use crate::media::{MediaTrack, TrackConstraint, TrackKind};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    /// `TransportEngine::create_handle`
    CreateHandle,
    /// `create_offer`
    CreateOffer,
    /// `create_answer`
    CreateAnswer,
    /// `set_local_description`
    SetLocalDescription,
    /// `set_remote_description`
    SetRemoteDescription,
    /// `add_ice_candidate`
    AddIceCandidate,
    /// `add_track`
    AddTrack,
    /// `remove_track`
    RemoveTrack,
    /// `create_data_channel`
    CreateDataChannel,
    /// `apply_constraint`
    ApplyConstraint,
}

#[derive(Default)]
struct Shared {
    failures: Mutex<HashSet<(String, MockOp)>>,
    latency: Mutex<Duration>,
}

impl Shared {
    fn check(&self, peer_id: &str, op: MockOp) -> Result<()> {
        if self.failures.lock().contains(&(peer_id.to_string(), op)) {
            return Err(Error::WebRtcError(format!(
                "injected {:?} failure for {}",
                op, peer_id
            )));
        }
        Ok(())
    }

    async fn pause(&self) {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

/// Deterministic Transport Engine
#[derive(Default)]
pub struct MockEngine {
    shared: Arc<Shared>,
    handles: Mutex<HashMap<String, Vec<Arc<MockHandle>>>>,
}

impl MockEngine {
    /// Create an engine with no failures and no latency
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `op` fail for every handle of `peer_id` until cleared
    pub fn fail_on(&self, peer_id: &str, op: MockOp) {
        self.shared
            .failures
            .lock()
            .insert((peer_id.to_string(), op));
    }

    /// Undo [`fail_on`](Self::fail_on)
    pub fn clear_failure(&self, peer_id: &str, op: MockOp) {
        self.shared
            .failures
            .lock()
            .remove(&(peer_id.to_string(), op));
    }

    /// Delay every async handle operation by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.shared.latency.lock() = latency;
    }

    /// Most recent handle created for `peer_id`
    pub fn handle(&self, peer_id: &str) -> Option<Arc<MockHandle>> {
        self.handles
            .lock()
            .get(peer_id)
            .and_then(|handles| handles.last().cloned())
    }

    /// Every handle created for `peer_id`, oldest first
    pub fn handles(&self, peer_id: &str) -> Vec<Arc<MockHandle>> {
        self.handles
            .lock()
            .get(peer_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Total handles created
    pub fn handle_count(&self) -> usize {
        self.handles.lock().values().map(Vec::len).sum()
    }
}

#[async_trait]
impl TransportEngine for MockEngine {
    async fn create_handle(
        &self,
        peer_id: &str,
        ice_servers: &[IceServerConfig],
        events: TransportEventSink,
    ) -> Result<Arc<dyn TransportHandle>> {
        self.shared.check(peer_id, MockOp::CreateHandle)?;

        let handle = Arc::new(MockHandle {
            peer_id: peer_id.to_string(),
            ice_servers: ice_servers.to_vec(),
            shared: self.shared.clone(),
            events,
            state: Mutex::new(HandleState::default()),
        });

        self.handles
            .lock()
            .entry(peer_id.to_string())
            .or_default()
            .push(handle.clone());

        debug!("Created mock transport handle for {}", peer_id);
        Ok(handle)
    }
}

#[derive(Default)]
struct HandleState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    /// A local offer awaits its answer
    offer_pending: bool,
    senders: Vec<SenderInfo>,
    receivers: Vec<RemoteTrack>,
    channels: Vec<Arc<MockChannel>>,
    candidates: Vec<IceCandidate>,
    constraints: Vec<(String, TrackConstraint)>,
    offers: usize,
    answers: usize,
    rollbacks: usize,
    gathered: usize,
    connected: bool,
    closed: bool,
}

/// Handle produced by [`MockEngine`]
pub struct MockHandle {
    peer_id: String,
    ice_servers: Vec<IceServerConfig>,
    shared: Arc<Shared>,
    events: TransportEventSink,
    state: Mutex<HandleState>,
}

impl MockHandle {
    fn ensure_open(&self) -> Result<()> {
        if self.state.lock().closed {
            return Err(Error::InvalidState(format!(
                "transport handle for {} is closed",
                self.peer_id
            )));
        }
        Ok(())
    }

    fn maybe_connect(&self) {
        let became_connected = {
            let mut state = self.state.lock();
            if !state.connected && state.local.is_some() && state.remote.is_some() {
                state.connected = true;
                true
            } else {
                false
            }
        };
        if became_connected {
            self.events
                .emit(TransportEvent::Connectivity(ConnectivityState::Connected));
        }
    }

    /// ICE servers the handle was created with
    pub fn ice_servers(&self) -> &[IceServerConfig] {
        &self.ice_servers
    }

    /// Remote candidates applied so far, in order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    /// Constraints applied so far as `(track_id, constraint)`
    pub fn applied_constraints(&self) -> Vec<(String, TrackConstraint)> {
        self.state.lock().constraints.clone()
    }

    /// Number of offers generated
    pub fn offers_created(&self) -> usize {
        self.state.lock().offers
    }

    /// Number of answers generated
    pub fn answers_created(&self) -> usize {
        self.state.lock().answers
    }

    /// Number of rollbacks performed
    pub fn rollbacks(&self) -> usize {
        self.state.lock().rollbacks
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Whether a remote description has been applied
    pub fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    /// Ids of attached local tracks
    pub fn sender_track_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .senders
            .iter()
            .map(|s| s.track_id.clone())
            .collect()
    }

    /// Labels of locally created channels
    pub fn channel_labels(&self) -> Vec<String> {
        self.state
            .lock()
            .channels
            .iter()
            .map(|c| c.label.clone())
            .collect()
    }

    /// Locally created channel with this label
    pub fn channel(&self, label: &str) -> Option<Arc<MockChannel>> {
        self.state
            .lock()
            .channels
            .iter()
            .rev()
            .find(|c| c.label == label)
            .cloned()
    }

    /// Simulate a connectivity change reported by the network
    pub fn set_connectivity(&self, state: ConnectivityState) {
        self.state.lock().connected = state == ConnectivityState::Connected;
        self.events.emit(TransportEvent::Connectivity(state));
    }

    /// Simulate the peer opening a channel
    pub fn open_remote_channel(&self, label: &str) -> Arc<MockChannel> {
        let channel = Arc::new(MockChannel::open(label));
        self.events
            .emit(TransportEvent::RemoteChannel(channel.clone()));
        channel
    }

    /// Simulate a message arriving on a channel
    pub fn deliver_message(&self, label: &str, data: impl Into<Bytes>) {
        self.events.emit(TransportEvent::ChannelMessage {
            label: label.to_string(),
            data: data.into(),
        });
    }

    fn render(&self, kind: DescriptionKind, n: usize, senders: &[SenderInfo]) -> String {
        let tag = match kind {
            DescriptionKind::Offer => "offer",
            DescriptionKind::Answer => "answer",
        };
        let mut sdp = format!("mock-{}:{}:{}\n", tag, self.peer_id, n);
        for sender in senders {
            sdp.push_str(&format!(
                "track:{}:{}:{}\n",
                sender.kind, sender.stream_id, sender.track_id
            ));
        }
        sdp
    }

    fn apply_remote_tracks(&self, sdp: &str) {
        let announced = parse_tracks(sdp);
        let (added, ended) = {
            let mut state = self.state.lock();
            let added: Vec<RemoteTrack> = announced
                .iter()
                .filter(|t| !state.receivers.iter().any(|r| r.id == t.id))
                .cloned()
                .collect();
            let ended: Vec<String> = state
                .receivers
                .iter()
                .filter(|r| !announced.iter().any(|t| t.id == r.id))
                .map(|r| r.id.clone())
                .collect();
            state.receivers = announced;
            (added, ended)
        };

        for track in added {
            self.events.emit(TransportEvent::RemoteTrack(track));
        }
        for track_id in ended {
            self.events
                .emit(TransportEvent::RemoteTrackEnded { track_id });
        }
    }
}

fn parse_tracks(sdp: &str) -> Vec<RemoteTrack> {
    sdp.lines()
        .filter_map(|line| line.strip_prefix("track:"))
        .filter_map(|rest| {
            let mut parts = rest.splitn(3, ':');
            let kind = match parts.next()? {
                "audio" => TrackKind::Audio,
                "video" => TrackKind::Video,
                _ => return None,
            };
            let stream_id = parts.next()?.to_string();
            let id = parts.next()?.to_string();
            Some(RemoteTrack {
                id,
                kind,
                stream_id,
            })
        })
        .collect()
}

#[async_trait]
impl TransportHandle for MockHandle {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.shared.pause().await;
        self.ensure_open()?;
        self.shared.check(&self.peer_id, MockOp::CreateOffer)?;

        let (n, senders) = {
            let mut state = self.state.lock();
            state.offers += 1;
            (state.offers, state.senders.clone())
        };
        Ok(SessionDescription::offer(self.render(
            DescriptionKind::Offer,
            n,
            &senders,
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.shared.pause().await;
        self.ensure_open()?;
        self.shared.check(&self.peer_id, MockOp::CreateAnswer)?;

        let (n, senders) = {
            let mut state = self.state.lock();
            match &state.remote {
                Some(desc) if desc.kind == DescriptionKind::Offer => {}
                _ => {
                    return Err(Error::SdpError(
                        "cannot create answer without a remote offer".to_string(),
                    ))
                }
            }
            state.answers += 1;
            (state.answers, state.senders.clone())
        };
        Ok(SessionDescription::answer(self.render(
            DescriptionKind::Answer,
            n,
            &senders,
        )))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.shared.pause().await;
        self.ensure_open()?;
        self.shared
            .check(&self.peer_id, MockOp::SetLocalDescription)?;

        let gathered = {
            let mut state = self.state.lock();
            state.offer_pending = description.kind == DescriptionKind::Offer;
            state.local = Some(description);
            state.gathered += 1;
            state.gathered
        };

        self.events
            .emit(TransportEvent::LocalCandidate(IceCandidate {
                candidate: format!(
                    "candidate:{} 1 udp 2122260223 10.0.0.{} 5000 typ host",
                    gathered,
                    gathered % 250
                ),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
                username_fragment: None,
            }));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.shared.pause().await;
        self.ensure_open()?;
        self.shared
            .check(&self.peer_id, MockOp::SetRemoteDescription)?;

        {
            let mut state = self.state.lock();
            let have_local_offer = state.offer_pending;
            match description.kind {
                DescriptionKind::Offer if have_local_offer => {
                    return Err(Error::SdpError(
                        "remote offer while a local offer is pending".to_string(),
                    ));
                }
                DescriptionKind::Answer if !have_local_offer => {
                    return Err(Error::SdpError(
                        "remote answer without a local offer".to_string(),
                    ));
                }
                _ => {}
            }
            if description.kind == DescriptionKind::Offer {
                state.local = None;
            }
            state.offer_pending = false;
            state.remote = Some(description.clone());
        }

        self.apply_remote_tracks(&description.sdp);
        self.maybe_connect();
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if state.offer_pending {
            state.offer_pending = false;
            state.local = None;
        }
        state.rollbacks += 1;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.shared.pause().await;
        self.ensure_open()?;
        self.shared.check(&self.peer_id, MockOp::AddIceCandidate)?;

        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(Error::IceCandidateError(
                "candidate applied before remote description".to_string(),
            ));
        }
        if candidate.candidate.starts_with("invalid") {
            return Err(Error::IceCandidateError(format!(
                "unparseable candidate: {}",
                candidate.candidate
            )));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &MediaTrack, stream_id: &str) -> Result<()> {
        self.ensure_open()?;
        self.shared.check(&self.peer_id, MockOp::AddTrack)?;

        let mut state = self.state.lock();
        if state.senders.iter().any(|s| s.track_id == track.id) {
            return Err(Error::MediaTrackError(format!(
                "track {} already has a sender",
                track.id
            )));
        }
        state.senders.push(SenderInfo {
            track_id: track.id.clone(),
            kind: track.kind,
            stream_id: stream_id.to_string(),
        });
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<bool> {
        self.ensure_open()?;
        self.shared.check(&self.peer_id, MockOp::RemoveTrack)?;

        let mut state = self.state.lock();
        let before = state.senders.len();
        state.senders.retain(|s| s.track_id != track_id);
        Ok(state.senders.len() != before)
    }

    async fn senders(&self) -> Vec<SenderInfo> {
        self.state.lock().senders.clone()
    }

    async fn receivers(&self) -> Vec<RemoteTrack> {
        self.state.lock().receivers.clone()
    }

    async fn create_data_channel(
        &self,
        label: &str,
        _config: &DataChannelConfig,
    ) -> Result<Arc<dyn ChannelHandle>> {
        self.shared.pause().await;
        self.ensure_open()?;
        self.shared
            .check(&self.peer_id, MockOp::CreateDataChannel)?;

        let channel = Arc::new(MockChannel::open(label));
        self.state.lock().channels.push(channel.clone());
        self.events.emit(TransportEvent::ChannelOpen {
            label: label.to_string(),
        });
        Ok(channel)
    }

    async fn apply_constraint(&self, track_id: &str, constraint: &TrackConstraint) -> Result<()> {
        self.shared.pause().await;
        self.ensure_open()?;
        self.shared.check(&self.peer_id, MockOp::ApplyConstraint)?;

        let mut state = self.state.lock();
        if !state.senders.iter().any(|s| s.track_id == track_id) {
            return Err(Error::ConstraintError(format!(
                "no sender for track {}",
                track_id
            )));
        }
        state
            .constraints
            .push((track_id.to_string(), constraint.clone()));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let channels = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            std::mem::take(&mut state.channels)
        };
        for channel in channels {
            channel.close().await?;
        }
        Ok(())
    }
}

/// Channel produced by [`MockHandle`]
#[derive(Debug)]
pub struct MockChannel {
    label: String,
    state: Mutex<ChannelState>,
    sent: Mutex<Vec<Bytes>>,
}

impl MockChannel {
    fn open(label: &str) -> Self {
        Self {
            label: label.to_string(),
            state: Mutex::new(ChannelState::Open),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Messages sent on this channel
    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl ChannelHandle for MockChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        if *self.state.lock() != ChannelState::Open {
            return Err(Error::DataChannelError(format!(
                "channel {} is not open",
                self.label
            )));
        }
        self.sent.lock().push(data);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.state.lock() = ChannelState::Closed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PeerTransportEvent;
    use tokio::sync::mpsc;

    async fn handle(
        engine: &MockEngine,
        peer: &str,
    ) -> (
        Arc<dyn TransportHandle>,
        mpsc::UnboundedReceiver<PeerTransportEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = TransportEventSink::new(peer, "s", tx);
        (engine.create_handle(peer, &[], sink).await.unwrap(), rx)
    }

    #[tokio::test]
    async fn test_offer_answer_announces_tracks() {
        let engine = MockEngine::new();
        let (a, _a_rx) = handle(&engine, "b").await;
        let (b, mut b_rx) = handle(&engine, "a").await;

        a.add_track(&MediaTrack::video("cam-v"), "cam").await.unwrap();
        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();

        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        let mut saw_track = false;
        let mut saw_connected = false;
        while let Ok(event) = b_rx.try_recv() {
            match event.event {
                TransportEvent::RemoteTrack(track) => {
                    assert_eq!(track.id, "cam-v");
                    assert_eq!(track.kind, TrackKind::Video);
                    saw_track = true;
                }
                TransportEvent::Connectivity(ConnectivityState::Connected) => {
                    saw_connected = true
                }
                _ => {}
            }
        }
        assert!(saw_track);
        assert!(saw_connected);
        assert_eq!(b.receivers().await.len(), 1);
    }

    #[tokio::test]
    async fn test_candidate_requires_remote_description() {
        let engine = MockEngine::new();
        let (h, _rx) = handle(&engine, "b").await;
        let err = h
            .add_ice_candidate(IceCandidate::new("candidate:1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IceCandidateError(_)));
    }

    #[tokio::test]
    async fn test_remote_offer_rejected_with_local_offer_pending() {
        let engine = MockEngine::new();
        let (h, _rx) = handle(&engine, "b").await;
        let offer = h.create_offer().await.unwrap();
        h.set_local_description(offer).await.unwrap();

        let remote = SessionDescription::offer("mock-offer:a:1\n");
        assert!(h.set_remote_description(remote.clone()).await.is_err());

        h.rollback().await.unwrap();
        h.set_remote_description(remote).await.unwrap();
        assert_eq!(engine.handle("b").unwrap().rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let engine = MockEngine::new();
        engine.fail_on("b", MockOp::CreateOffer);
        let (h, _rx) = handle(&engine, "b").await;
        assert!(h.create_offer().await.is_err());

        engine.clear_failure("b", MockOp::CreateOffer);
        assert!(h.create_offer().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let engine = MockEngine::new();
        let (h, _rx) = handle(&engine, "b").await;
        let chat = h
            .create_data_channel("chat", &DataChannelConfig::default())
            .await
            .unwrap();
        h.close().await.unwrap();
        h.close().await.unwrap();

        assert_eq!(chat.state(), ChannelState::Closed);
        assert!(h.create_offer().await.is_err());
        assert!(engine.handle("b").unwrap().is_closed());
    }
}
