//! Peer sessions and their store

pub mod peer;
pub mod store;

pub use peer::{NegotiationState, PeerInfo, PeerSession};
pub(crate) use peer::PeerCommand;
pub use store::PeerSessionStore;
