//! Transport Engine capability
//!
//! The orchestrator never performs ICE, DTLS or media delivery itself. It
//! drives a [`TransportEngine`] that hands out one [`TransportHandle`] per
//! remote peer and reports what happens on that handle through a
//! [`TransportEventSink`].
//!
//! Two engines ship with the crate:
//! - [`webrtc::WebRtcEngine`] backed by webrtc-rs
//! - [`mock::MockEngine`], deterministic and in-process, for tests and dry runs

pub mod mock;
pub mod webrtc;

use crate::config::{DataChannelConfig, IceServerConfig};
use crate::media::{MediaTrack, TrackConstraint, TrackKind};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    /// Session offer
    Offer,
    /// Session answer
    Answer,
}

/// Opaque session description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub kind: DescriptionKind,
    /// Opaque description body
    pub sdp: String,
}

impl SessionDescription {
    /// Wrap an offer body
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Wrap an answer body
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Opaque connectivity candidate, in the browser's JSON shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Media line index
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,

    /// ICE username fragment
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate with only the candidate line set
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

/// Transport-level connectivity, as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// Nothing started yet
    New,
    /// Connectivity checks running
    Checking,
    /// A working path exists
    Connected,
    /// Path lost, may come back
    Disconnected,
    /// Checks failed
    Failed,
    /// Handle closed
    Closed,
}

impl ConnectivityState {
    /// Disconnected or failed
    pub fn is_lost(&self) -> bool {
        matches!(
            self,
            ConnectivityState::Disconnected | ConnectivityState::Failed
        )
    }
}

/// Data channel ready state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Channel is being created
    Connecting,
    /// Channel is open and ready for messages
    Open,
    /// Channel is closing
    Closing,
    /// Channel is closed
    Closed,
}

/// Local track attached to a handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderInfo {
    /// Local track id
    pub track_id: String,
    /// Track kind
    pub kind: TrackKind,
    /// Parent stream id
    pub stream_id: String,
}

/// Track received from the remote peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    /// Remote track id
    pub id: String,
    /// Track kind
    pub kind: TrackKind,
    /// Remote stream id
    pub stream_id: String,
}

/// One data channel instance on one handle
#[async_trait]
pub trait ChannelHandle: fmt::Debug + Send + Sync {
    /// Channel label
    fn label(&self) -> &str;

    /// Current ready state
    fn state(&self) -> ChannelState;

    /// Send a binary message
    async fn send(&self, data: Bytes) -> Result<()>;

    /// Close the channel
    async fn close(&self) -> Result<()>;
}

/// Something that happened on a transport handle
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The engine gathered a local candidate to relay to the peer
    LocalCandidate(IceCandidate),
    /// Connectivity changed
    Connectivity(ConnectivityState),
    /// The peer started sending a track
    RemoteTrack(RemoteTrack),
    /// A remote track ended
    RemoteTrackEnded {
        /// Remote track id
        track_id: String,
    },
    /// The peer opened a data channel
    RemoteChannel(Arc<dyn ChannelHandle>),
    /// A channel became open
    ChannelOpen {
        /// Channel label
        label: String,
    },
    /// A channel closed
    ChannelClosed {
        /// Channel label
        label: String,
    },
    /// A message arrived on a channel
    ChannelMessage {
        /// Channel label
        label: String,
        /// Message payload
        data: Bytes,
    },
}

/// Transport event tagged with the session that produced it
#[derive(Debug, Clone)]
pub struct PeerTransportEvent {
    /// Remote peer id
    pub peer_id: String,
    /// Session instance id; stale events from a closed session don't match
    pub session_id: String,
    /// The event
    pub event: TransportEvent,
}

/// Per-handle event emitter given to the engine at creation time
#[derive(Debug, Clone)]
pub struct TransportEventSink {
    peer_id: String,
    session_id: String,
    tx: mpsc::UnboundedSender<PeerTransportEvent>,
}

impl TransportEventSink {
    /// Create a sink for one session
    pub fn new(
        peer_id: impl Into<String>,
        session_id: impl Into<String>,
        tx: mpsc::UnboundedSender<PeerTransportEvent>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            session_id: session_id.into(),
            tx,
        }
    }

    /// Remote peer id this sink reports for
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Report an event; dropped silently once the mesh has shut down
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(PeerTransportEvent {
            peer_id: self.peer_id.clone(),
            session_id: self.session_id.clone(),
            event,
        });
    }
}

/// Transport for one remote peer
#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// Generate an offer
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Generate an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply a local description
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    /// Apply a remote description
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Discard a pending local offer
    async fn rollback(&self) -> Result<()>;

    /// Apply a remote candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Attach a local track
    async fn add_track(&self, track: &MediaTrack, stream_id: &str) -> Result<()>;

    /// Detach a local track; `Ok(false)` if it had no sender
    async fn remove_track(&self, track_id: &str) -> Result<bool>;

    /// Enumerate attached local tracks
    async fn senders(&self) -> Vec<SenderInfo>;

    /// Enumerate tracks received from the peer
    async fn receivers(&self) -> Vec<RemoteTrack>;

    /// Create an outgoing data channel
    async fn create_data_channel(
        &self,
        label: &str,
        config: &DataChannelConfig,
    ) -> Result<Arc<dyn ChannelHandle>>;

    /// Apply a constraint to the attached local track
    async fn apply_constraint(&self, track_id: &str, constraint: &TrackConstraint) -> Result<()>;

    /// Release the handle
    async fn close(&self) -> Result<()>;
}

/// Factory for transport handles
#[async_trait]
pub trait TransportEngine: Send + Sync {
    /// Create a handle for `peer_id`; `events` receives everything the
    /// handle reports.
    async fn create_handle(
        &self,
        peer_id: &str,
        ice_servers: &[IceServerConfig],
        events: TransportEventSink,
    ) -> Result<Arc<dyn TransportHandle>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_json_shape() {
        let desc = SessionDescription::offer("v=0");
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json, serde_json::json!({"type": "offer", "sdp": "v=0"}));
    }

    #[test]
    fn test_candidate_browser_field_names() {
        let json = r#"{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
        let candidate: IceCandidate = serde_json::from_str(json).unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_m_line_index, Some(0));
        assert!(candidate.username_fragment.is_none());
    }

    #[test]
    fn test_connectivity_lost() {
        assert!(ConnectivityState::Failed.is_lost());
        assert!(ConnectivityState::Disconnected.is_lost());
        assert!(!ConnectivityState::Closed.is_lost());
    }

    #[tokio::test]
    async fn test_sink_tags_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = TransportEventSink::new("peer-b", "s-1", tx);
        sink.emit(TransportEvent::Connectivity(ConnectivityState::Checking));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.peer_id, "peer-b");
        assert_eq!(event.session_id, "s-1");
        assert!(matches!(
            event.event,
            TransportEvent::Connectivity(ConnectivityState::Checking)
        ));
    }
}
