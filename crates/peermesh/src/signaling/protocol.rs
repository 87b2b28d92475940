//! Signaling message types
//!
//! Two layers:
//! - the logical messages exchanged with the room service
//!   ([`BusCommand`] out, [`BusEvent`] in), used by every bus
//! - [`WireMessage`], the `{"method": ..., "params": ...}` JSON framing
//!   used by the WebSocket bus

use crate::transport::IceCandidate;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

fn is_false(value: &bool) -> bool {
    !*value
}

/// Peer-to-peer signal relayed verbatim by the bus
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    /// Peer that produced the signal
    pub sender: String,

    /// Peer the signal is addressed to
    pub recipient: String,

    /// JSON-encoded [`SignalMessage`]; opaque to the bus
    pub message: String,

    /// The offerer already attached its tracks; the answerer should not
    #[serde(default, skip_serializing_if = "is_false")]
    pub skip_local_tracks: bool,

    /// Description version of the sender
    #[serde(default)]
    pub version: u64,
}

/// Decoded contents of [`SignalEnvelope::message`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    /// Session offer
    Offer {
        /// Description body
        sdp: String,
    },
    /// Session answer
    Answer {
        /// Description body
        sdp: String,
    },
    /// Connectivity candidate
    Candidate {
        /// Candidate in browser JSON shape
        #[serde(rename = "iceCandidate")]
        ice_candidate: IceCandidate,
    },
}

impl SignalEnvelope {
    /// Build an envelope around an encoded message
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        message: &SignalMessage,
        version: u64,
        skip_local_tracks: bool,
    ) -> Result<Self> {
        Ok(Self {
            sender: sender.into(),
            recipient: recipient.into(),
            message: serde_json::to_string(message)?,
            skip_local_tracks,
            version,
        })
    }

    /// Decode the inner message
    pub fn decode(&self) -> Result<SignalMessage> {
        serde_json::from_str(&self.message).map_err(|e| Error::MalformedSignal {
            sender: self.sender.clone(),
            reason: e.to_string(),
        })
    }
}

/// Commands sent to the room service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextCommand {
    /// Leave the current context and join another
    ChangeContext {
        /// Target context id
        context: String,
    },
    /// Ask for the members of the current context
    ConnectContext,
}

/// Membership events produced by the room service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextEvent {
    /// First join: the service assigned our id and an initial context
    ContextCreated {
        /// Local peer id
        peer_id: String,
        /// Initial context id
        context: String,
    },
    /// A requested context change took effect
    ContextChanged {
        /// New context id
        context: String,
    },
    /// Peers in the context we should connect to
    ConnectTo {
        /// Remote peer ids
        peers: Vec<String>,
    },
    /// A member left the context
    PeerLeft {
        /// Remote peer id
        peer_id: String,
    },
}

/// Anything the mesh sends over the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusCommand {
    /// Context management
    Context(ContextCommand),
    /// Peer-to-peer signal
    Signal(SignalEnvelope),
}

/// Anything the bus delivers to the mesh
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// Membership event
    Context(ContextEvent),
    /// Peer-to-peer signal
    Signal(SignalEnvelope),
    /// Transport-level failure on the bus connection
    Error(String),
}

/// `context.change` parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeContextParams {
    /// Target context id
    pub context: String,
}

/// `context.connect` parameters (empty object)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectContextParams {}

/// `context.created` parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContextCreatedParams {
    /// Local peer id
    pub peer_id: String,
    /// Initial context id
    pub context: String,
}

/// `context.changed` parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextChangedParams {
    /// New context id
    pub context: String,
}

/// `context.connect_to` parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectToParams {
    /// Remote peer ids
    pub peers: Vec<String>,
}

/// `context.peer_left` parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerLeftParams {
    /// Remote peer id
    pub peer_id: String,
}

/// One JSON text frame on the WebSocket bus
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "method", content = "params")]
pub enum WireMessage {
    /// Client → server: change context
    #[serde(rename = "context.change")]
    Change(ChangeContextParams),

    /// Client → server: request members
    #[serde(rename = "context.connect")]
    Connect(ConnectContextParams),

    /// Both directions: relayed peer signal
    #[serde(rename = "context.signal")]
    Signal(SignalEnvelope),

    /// Server → client: initial context
    #[serde(rename = "context.created")]
    Created(ContextCreatedParams),

    /// Server → client: context change acknowledged
    #[serde(rename = "context.changed")]
    Changed(ContextChangedParams),

    /// Server → client: connect to these members
    #[serde(rename = "context.connect_to")]
    ConnectTo(ConnectToParams),

    /// Server → client: member left
    #[serde(rename = "context.peer_left")]
    PeerLeft(PeerLeftParams),
}

impl WireMessage {
    /// Serialize message to a JSON text frame
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::SerializationError(e.to_string()))
    }

    /// Parse message from a JSON text frame
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::SerializationError(e.to_string()))
    }

    /// Interpret a frame received by a client.
    /// Client → server methods yield `None`.
    pub fn into_event(self) -> Option<BusEvent> {
        let event = match self {
            WireMessage::Signal(envelope) => return Some(BusEvent::Signal(envelope)),
            WireMessage::Created(p) => ContextEvent::ContextCreated {
                peer_id: p.peer_id,
                context: p.context,
            },
            WireMessage::Changed(p) => ContextEvent::ContextChanged { context: p.context },
            WireMessage::ConnectTo(p) => ContextEvent::ConnectTo { peers: p.peers },
            WireMessage::PeerLeft(p) => ContextEvent::PeerLeft { peer_id: p.peer_id },
            WireMessage::Change(_) | WireMessage::Connect(_) => return None,
        };
        Some(BusEvent::Context(event))
    }
}

impl From<BusCommand> for WireMessage {
    fn from(command: BusCommand) -> Self {
        match command {
            BusCommand::Context(ContextCommand::ChangeContext { context }) => {
                WireMessage::Change(ChangeContextParams { context })
            }
            BusCommand::Context(ContextCommand::ConnectContext) => {
                WireMessage::Connect(ConnectContextParams::default())
            }
            BusCommand::Signal(envelope) => WireMessage::Signal(envelope),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_field_names() {
        let envelope = SignalEnvelope::new(
            "a",
            "b",
            &SignalMessage::Offer {
                sdp: "v=0".to_string(),
            },
            3,
            true,
        )
        .unwrap();

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["sender"], "a");
        assert_eq!(json["recipient"], "b");
        assert_eq!(json["skipLocalTracks"], true);
        assert_eq!(json["version"], 3);

        let inner: serde_json::Value =
            serde_json::from_str(json["message"].as_str().unwrap()).unwrap();
        assert_eq!(inner, serde_json::json!({"type": "offer", "sdp": "v=0"}));
    }

    #[test]
    fn test_envelope_optional_fields_default() {
        let json = r#"{"sender":"a","recipient":"b","message":"{\"type\":\"answer\",\"sdp\":\"x\"}"}"#;
        let envelope: SignalEnvelope = serde_json::from_str(json).unwrap();
        assert!(!envelope.skip_local_tracks);
        assert_eq!(envelope.version, 0);
        assert_eq!(
            envelope.decode().unwrap(),
            SignalMessage::Answer {
                sdp: "x".to_string()
            }
        );
    }

    #[test]
    fn test_candidate_message_shape() {
        let json = r#"{"type":"candidate","iceCandidate":{"candidate":"candidate:0","sdpMid":"0","sdpMLineIndex":0}}"#;
        let message: SignalMessage = serde_json::from_str(json).unwrap();
        match message {
            SignalMessage::Candidate { ice_candidate } => {
                assert_eq!(ice_candidate.candidate, "candidate:0");
                assert_eq!(ice_candidate.sdp_m_line_index, Some(0));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_type_is_malformed() {
        let envelope = SignalEnvelope {
            sender: "a".to_string(),
            recipient: "b".to_string(),
            message: r#"{"type":"renegotiate"}"#.to_string(),
            skip_local_tracks: false,
            version: 0,
        };
        assert!(matches!(
            envelope.decode(),
            Err(Error::MalformedSignal { .. })
        ));
    }

    #[test]
    fn test_wire_framing() {
        let frame = WireMessage::from(BusCommand::Context(ContextCommand::ConnectContext))
            .to_json()
            .unwrap();
        assert_eq!(frame, r#"{"method":"context.connect","params":{}}"#);

        let frame = WireMessage::from(BusCommand::Context(ContextCommand::ChangeContext {
            context: "room-1".to_string(),
        }))
        .to_json()
        .unwrap();
        assert_eq!(
            frame,
            r#"{"method":"context.change","params":{"context":"room-1"}}"#
        );
    }

    #[test]
    fn test_wire_server_events() {
        let msg = WireMessage::from_json(
            r#"{"method":"context.created","params":{"peerId":"p1","context":"c1"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg.into_event(),
            Some(BusEvent::Context(ContextEvent::ContextCreated {
                peer_id: "p1".to_string(),
                context: "c1".to_string(),
            }))
        );

        let msg =
            WireMessage::from_json(r#"{"method":"context.connect_to","params":{"peers":["a","b"]}}"#)
                .unwrap();
        assert_eq!(
            msg.into_event(),
            Some(BusEvent::Context(ContextEvent::ConnectTo {
                peers: vec!["a".to_string(), "b".to_string()],
            }))
        );

        let msg = WireMessage::from_json(r#"{"method":"context.connect","params":{}}"#).unwrap();
        assert_eq!(msg.into_event(), None);
    }

    #[test]
    fn test_wire_unknown_method_rejected() {
        assert!(WireMessage::from_json(r#"{"method":"room.join","params":{}}"#).is_err());
    }
}
