//! Data channel aggregate over all sessions

use super::resources::FanoutReport;
use crate::config::DataChannelConfig;
use crate::session::PeerSessionStore;
use crate::transport::ChannelState;
use crate::{Error, Result};
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

/// One logical data channel, instantiated on every session
///
/// Cheap to clone. The per-session instances are owned by the sessions;
/// this handle only looks them up by label.
#[derive(Clone)]
pub struct DataChannel {
    label: String,
    config: DataChannelConfig,
    store: Arc<PeerSessionStore>,
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("label", &self.label)
            .field("config", &self.config)
            .finish()
    }
}

impl DataChannel {
    pub(crate) fn new(label: String, config: DataChannelConfig, store: Arc<PeerSessionStore>) -> Self {
        Self {
            label,
            config,
            store,
        }
    }

    /// Channel label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Channel definition
    pub fn config(&self) -> &DataChannelConfig {
        &self.config
    }

    /// Peers that currently have an instance of this channel, sorted
    pub async fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .store
            .all()
            .await
            .into_iter()
            .filter(|s| s.data_channel(&self.label).is_some())
            .map(|s| s.peer_id().to_string())
            .collect();
        peers.sort();
        peers
    }

    /// Broadcast to every peer whose instance is open
    ///
    /// Every open instance is tried. Returns the number of peers the
    /// message was sent to, or a `Fanout` error if any send failed.
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<usize> {
        let data = data.into();
        let mut report = FanoutReport::new("data_channel_send");
        let mut sent = 0;

        for session in self.store.all().await {
            let Some(channel) = session.data_channel(&self.label) else {
                continue;
            };
            if channel.state() != ChannelState::Open {
                continue;
            }
            let result = channel.send(data.clone()).await;
            if result.is_ok() {
                sent += 1;
            }
            report.record(session.peer_id(), result);
        }

        debug!("Sent {} bytes on '{}' to {} peers", data.len(), self.label, sent);
        match report.into_error() {
            Some(err) => Err(err),
            None => Ok(sent),
        }
    }

    /// Send to one peer
    pub async fn send_to(&self, peer_id: &str, data: impl Into<Bytes>) -> Result<()> {
        let session = self
            .store
            .get(peer_id)
            .await
            .ok_or_else(|| Error::PeerNotFound(peer_id.to_string()))?;
        let channel = session.data_channel(&self.label).ok_or_else(|| {
            Error::DataChannelError(format!(
                "Peer {} has no '{}' channel",
                peer_id, self.label
            ))
        })?;
        channel.send(data.into()).await
    }
}
