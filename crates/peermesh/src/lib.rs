//! Multi-peer connection orchestrator
//!
//! This crate keeps one negotiated peer connection per remote member of a
//! shared context (a room), over a pluggable signaling bus and a pluggable
//! transport engine.
//!
//! # Features
//!
//! - **Per-peer negotiation**: offer/answer state machine with glare
//!   resolution, stale-message rejection and a negotiation timeout
//! - **Candidate relay**: candidates are buffered until a remote
//!   description exists and applied in arrival order
//! - **Local resources**: streams, tracks and data channels replicated onto
//!   every current and future peer, with resource-only renegotiation
//! - **Contexts**: join, leave and room change over the signaling bus
//! - **Adapters**: WebRTC (`webrtc` crate) and an in-process mock engine;
//!   WebSocket and in-memory signaling buses
//!
//! # Example
//!
//! ```
//! use peermesh::MeshConfig;
//!
//! let config = MeshConfig {
//!     max_peers: 8,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use peermesh::signaling::WebSocketBus;
//! use peermesh::transport::webrtc::WebRtcEngine;
//! use peermesh::{Mesh, MeshConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> peermesh::Result<()> {
//! let bus = Arc::new(WebSocketBus::connect("ws://localhost:8080").await?);
//! let mesh = Mesh::new(MeshConfig::default(), bus, Arc::new(WebRtcEngine::new()))?;
//! mesh.start()?;
//!
//! mesh.wait_until_ready(Duration::from_secs(10)).await?;
//! mesh.change_context("room-42").await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod media;
pub mod mesh;
pub mod negotiation;
pub mod session;
pub mod signaling;
pub mod transport;

pub use config::{DataChannelConfig, DataChannelMode, IceServerConfig, MeshConfig};
pub use context::{ContextController, ContextState};
pub use error::{Error, Result};
pub use events::{EventHub, HandlerId, MeshEvent, Observers};
pub use media::{DataChannel, MediaStream, MediaTrack, TrackConstraint, TrackKind};
pub use mesh::Mesh;
pub use session::{NegotiationState, PeerInfo, PeerSession};
pub use signaling::SignalingBus;
pub use transport::{TransportEngine, TransportHandle};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get crate version
pub fn version() -> &'static str {
    VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
