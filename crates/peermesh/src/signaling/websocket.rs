//! WebSocket signaling bus
//!
//! JSON text frames in the [`WireMessage`] format. A sender task drains an
//! outgoing channel into the socket and a receiver task turns incoming
//! frames into [`BusEvent`]s.

use super::protocol::{BusCommand, BusEvent, WireMessage};
use super::SignalingBus;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Signaling bus over a WebSocket connection
pub struct WebSocketBus {
    url: String,
    tx: mpsc::UnboundedSender<Message>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<BusEvent>>>,
}

impl WebSocketBus {
    /// Connect to the signaling server
    ///
    /// # Arguments
    ///
    /// * `url` - WebSocket signaling server URL (ws:// or wss://)
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to signaling server: {}", url);

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;

        info!("Connected to signaling server");

        let (write, read) = ws_stream.split();
        let (tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::sender_task(write, out_rx));
        tokio::spawn(Self::receiver_task(read, event_tx));

        Ok(Self {
            url: url.to_string(),
            tx,
            rx: Mutex::new(Some(event_rx)),
        })
    }

    /// Server URL this bus is connected to
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Sender task: sends messages from channel to WebSocket
    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = write.send(msg).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
        }

        debug!("Sender task terminated");
    }

    /// Receiver task: parses frames and forwards them as bus events
    async fn receiver_task(
        mut read: futures::stream::SplitStream<WsStream>,
        events: mpsc::UnboundedSender<BusEvent>,
    ) {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => match WireMessage::from_json(&text) {
                    Ok(msg) => match msg.into_event() {
                        Some(event) => {
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                        None => warn!("Ignoring client-only method from server: {}", text),
                    },
                    Err(e) => warn!("Failed to handle signaling message: {}", e),
                },
                Ok(Message::Close(_)) => {
                    info!("WebSocket connection closed");
                    let _ = events.send(BusEvent::Error("connection closed by server".into()));
                    break;
                }
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    let _ = events.send(BusEvent::Error(e.to_string()));
                    break;
                }
                _ => {}
            }
        }

        debug!("Receiver task terminated");
    }
}

#[async_trait]
impl SignalingBus for WebSocketBus {
    async fn send(&self, command: BusCommand) -> Result<()> {
        let json = WireMessage::from(command).to_json()?;
        debug!("Sending signaling message: {}", json);

        self.tx
            .send(Message::Text(json))
            .map_err(|e| Error::WebSocketError(format!("Failed to send message: {}", e)))
    }

    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<BusEvent>> {
        self.rx
            .lock()
            .take()
            .ok_or_else(|| Error::InvalidState("WebSocket bus already subscribed".to_string()))
    }
}
