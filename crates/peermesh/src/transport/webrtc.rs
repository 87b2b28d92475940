//! Transport Engine backed by webrtc-rs
//!
//! One `RTCPeerConnection` per handle. Local tracks are
//! `TrackLocalStaticSample`s shared by every handle, so an application
//! writes a sample once (see [`WebRtcEngine::local_track`]) and it is sent
//! to all peers that have the track attached.

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
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

#[derive(Default)]
struct Shared {
    /// Sample tracks by local track id
    tracks: Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>,
    /// Last constraint applied per local track id
    constraints: Mutex<HashMap<String, TrackConstraint>>,
}

/// webrtc-rs Transport Engine
#[derive(Default)]
pub struct WebRtcEngine {
    shared: Arc<Shared>,
}

impl WebRtcEngine {
    /// Create a new engine
    pub fn new() -> Self {
        Self::default()
    }

    /// Sample track for a local track id, once it has been attached anywhere
    pub fn local_track(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.shared.tracks.lock().get(track_id).cloned()
    }

    /// Last constraint applied to a local track; capture code reads this
    pub fn constraint(&self, track_id: &str) -> Option<TrackConstraint> {
        self.shared.constraints.lock().get(track_id).cloned()
    }
}

fn to_rtc_ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn track_kind(kind: RTPCodecType) -> Option<TrackKind> {
    match kind {
        RTPCodecType::Audio => Some(TrackKind::Audio),
        RTPCodecType::Video => Some(TrackKind::Video),
        _ => None,
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

#[async_trait]
impl TransportEngine for WebRtcEngine {
    #[instrument(skip(self, ice_servers, events), fields(peer_id = %peer_id))]
    async fn create_handle(
        &self,
        peer_id: &str,
        ice_servers: &[IceServerConfig],
        events: TransportEventSink,
    ) -> Result<Arc<dyn TransportHandle>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: to_rtc_ice_servers(ice_servers),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?);

        let handle = WebRtcHandle {
            peer_id: peer_id.to_string(),
            pc,
            shared: self.shared.clone(),
            senders: Mutex::new(HashMap::new()),
            receivers: Arc::new(Mutex::new(Vec::new())),
            events,
        };
        handle.install_handlers();

        info!("Created peer connection for {}", peer_id);
        Ok(Arc::new(handle))
    }
}

/// Handle wrapping one `RTCPeerConnection`
pub struct WebRtcHandle {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    shared: Arc<Shared>,
    senders: Mutex<HashMap<String, (SenderInfo, Arc<RTCRtpSender>)>>,
    receivers: Arc<Mutex<Vec<RemoteTrack>>>,
    events: TransportEventSink,
}

impl WebRtcHandle {
    fn install_handlers(&self) {
        let events = self.events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let events = events.clone();
                Box::pin(async move {
                    let state = match s {
                        RTCPeerConnectionState::New => ConnectivityState::New,
                        RTCPeerConnectionState::Connecting => ConnectivityState::Checking,
                        RTCPeerConnectionState::Connected => ConnectivityState::Connected,
                        RTCPeerConnectionState::Disconnected => ConnectivityState::Disconnected,
                        RTCPeerConnectionState::Failed => ConnectivityState::Failed,
                        RTCPeerConnectionState::Closed => ConnectivityState::Closed,
                        _ => return,
                    };
                    debug!("Peer {} connection state: {}", events.peer_id(), s);
                    events.emit(TransportEvent::Connectivity(state));
                })
            }));

        let events = self.events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                Box::pin(async move {
                    // `None` marks the end of gathering
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => events.emit(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        })),
                        Err(e) => warn!("Failed to serialize local candidate: {}", e),
                    }
                })
            }));

        let events = self.events.clone();
        let receivers = self.receivers.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = events.clone();
                let receivers = receivers.clone();
                Box::pin(async move {
                    let Some(kind) = track_kind(track.kind()) else {
                        return;
                    };
                    let remote = RemoteTrack {
                        id: track.id(),
                        kind,
                        stream_id: track.stream_id(),
                    };
                    info!(
                        "Remote track from {}: id={}, kind={}",
                        events.peer_id(),
                        remote.id,
                        kind
                    );
                    receivers.lock().push(remote.clone());
                    events.emit(TransportEvent::RemoteTrack(remote.clone()));

                    // Drain RTP until the track ends so the end can be reported
                    tokio::spawn(async move {
                        while track.read_rtp().await.is_ok() {}
                        receivers.lock().retain(|r| r.id != remote.id);
                        events.emit(TransportEvent::RemoteTrackEnded {
                            track_id: remote.id,
                        });
                    });
                })
            },
        ));

        let events = self.events.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let events = events.clone();
                Box::pin(async move {
                    debug!(
                        "Remote data channel from {}: label={}",
                        events.peer_id(),
                        dc.label()
                    );
                    let channel = WebRtcChannel::wrap(dc, events.clone());
                    events.emit(TransportEvent::RemoteChannel(channel));
                })
            }));
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let result = match description.kind {
        DescriptionKind::Offer => RTCSessionDescription::offer(description.sdp),
        DescriptionKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    result.map_err(|e| Error::SdpError(format!("Invalid session description: {}", e)))
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(Error::SdpError(format!(
            "Unexpected description type: {}",
            other
        ))),
    }
}

#[async_trait]
impl TransportHandle for WebRtcHandle {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn rollback(&self) -> Result<()> {
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        self.pc
            .set_local_description(rollback)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to roll back local offer: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn add_track(&self, track: &MediaTrack, stream_id: &str) -> Result<()> {
        if self.senders.lock().contains_key(&track.id) {
            return Err(Error::MediaTrackError(format!(
                "Track {} already has a sender",
                track.id
            )));
        }

        let local = self
            .shared
            .tracks
            .lock()
            .entry(track.id.clone())
            .or_insert_with(|| {
                Arc::new(TrackLocalStaticSample::new(
                    codec_for(track.kind),
                    track.id.clone(),
                    stream_id.to_string(),
                ))
            })
            .clone();

        let sender = self
            .pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to add track: {}", e)))?;

        // Read RTCP so interceptors keep working
        let rtcp_sender = sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        let info = SenderInfo {
            track_id: track.id.clone(),
            kind: track.kind,
            stream_id: stream_id.to_string(),
        };
        self.senders.lock().insert(track.id.clone(), (info, sender));
        debug!("Attached track {} to peer {}", track.id, self.peer_id);
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<bool> {
        let Some((_, sender)) = self.senders.lock().remove(track_id) else {
            return Ok(false);
        };
        self.pc
            .remove_track(&sender)
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to remove track: {}", e)))?;
        Ok(true)
    }

    async fn senders(&self) -> Vec<SenderInfo> {
        self.senders
            .lock()
            .values()
            .map(|(info, _)| info.clone())
            .collect()
    }

    async fn receivers(&self) -> Vec<RemoteTrack> {
        self.receivers.lock().clone()
    }

    async fn create_data_channel(
        &self,
        label: &str,
        config: &DataChannelConfig,
    ) -> Result<Arc<dyn ChannelHandle>> {
        let init = RTCDataChannelInit {
            ordered: Some(config.mode.ordered()),
            max_retransmits: config.mode.max_retransmits(),
            protocol: (!config.protocol.is_empty()).then(|| config.protocol.clone()),
            ..Default::default()
        };

        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| {
                Error::DataChannelError(format!("Failed to create data channel: {}", e))
            })?;

        Ok(WebRtcChannel::wrap(dc, self.events.clone()))
    }

    async fn apply_constraint(&self, track_id: &str, constraint: &TrackConstraint) -> Result<()> {
        if !self.senders.lock().contains_key(track_id) {
            return Err(Error::ConstraintError(format!(
                "No sender for track {} on peer {}",
                track_id, self.peer_id
            )));
        }
        if constraint.width == Some(0) || constraint.height == Some(0) {
            return Err(Error::ConstraintError(
                "width and height must be greater than 0".to_string(),
            ));
        }
        if matches!(constraint.frame_rate, Some(rate) if rate <= 0.0) {
            return Err(Error::ConstraintError(
                "frame_rate must be greater than 0".to_string(),
            ));
        }

        self.shared
            .constraints
            .lock()
            .insert(track_id.to_string(), constraint.clone());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.senders.lock().clear();
        self.pc
            .close()
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to close peer connection: {}", e)))
    }
}

/// Data channel backed by `RTCDataChannel`
pub struct WebRtcChannel {
    label: String,
    dc: Arc<RTCDataChannel>,
}

impl fmt::Debug for WebRtcChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebRtcChannel")
            .field("label", &self.label)
            .field("state", &self.dc.ready_state())
            .finish()
    }
}

impl WebRtcChannel {
    fn wrap(dc: Arc<RTCDataChannel>, events: TransportEventSink) -> Arc<dyn ChannelHandle> {
        let label = dc.label().to_string();

        let open_events = events.clone();
        let open_label = label.clone();
        dc.on_open(Box::new(move || {
            let events = open_events.clone();
            let label = open_label.clone();
            Box::pin(async move {
                debug!("Data channel '{}' opened", label);
                events.emit(TransportEvent::ChannelOpen { label });
            })
        }));

        let close_events = events.clone();
        let close_label = label.clone();
        dc.on_close(Box::new(move || {
            let events = close_events.clone();
            let label = close_label.clone();
            Box::pin(async move {
                debug!("Data channel '{}' closed", label);
                events.emit(TransportEvent::ChannelClosed { label });
            })
        }));

        let message_label = label.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = events.clone();
            let label = message_label.clone();
            Box::pin(async move {
                events.emit(TransportEvent::ChannelMessage {
                    label,
                    data: msg.data,
                });
            })
        }));

        let error_label = label.clone();
        dc.on_error(Box::new(move |err| {
            let label = error_label.clone();
            Box::pin(async move {
                warn!("Data channel '{}' error: {}", label, err);
            })
        }));

        Arc::new(Self { label, dc })
    }
}

#[async_trait]
impl ChannelHandle for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> ChannelState {
        match self.dc.ready_state() {
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            RTCDataChannelState::Closed => ChannelState::Closed,
            _ => ChannelState::Connecting,
        }
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| Error::DataChannelError(format!("Failed to send on '{}': {}", self.label, e)))
    }

    async fn close(&self) -> Result<()> {
        self.dc
            .close()
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to close '{}': {}", self.label, e)))
    }
}
