//! Signaling: the bus abstraction, its adapters, and the typed bridge

pub mod bridge;
pub mod memory;
pub mod protocol;
pub mod websocket;

pub use bridge::{InboundSignal, Signal, SignalKind, SignalingBridge};
pub use memory::{MemoryBus, MemoryHub};
pub use protocol::{
    BusCommand, BusEvent, ContextCommand, ContextEvent, SignalEnvelope, SignalMessage,
    WireMessage,
};
pub use websocket::WebSocketBus;

use crate::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Connection to the external room/relay service
///
/// Delivery is assumed reliable and ordered per sender.
#[async_trait]
pub trait SignalingBus: Send + Sync {
    /// Send a command or relay a signal
    async fn send(&self, command: BusCommand) -> Result<()>;

    /// Take the inbound event stream. Only one subscriber is supported;
    /// a second call fails.
    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<BusEvent>>;
}
