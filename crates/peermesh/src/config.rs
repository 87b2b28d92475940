//! Configuration types for the mesh orchestrator

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Upper bound for `max_peers`; a full mesh beyond this is not practical
pub const MAX_PEERS_LIMIT: u32 = 64;

/// Main configuration for [`Mesh`](crate::Mesh)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// STUN/TURN servers handed to every transport handle
    pub ice_servers: Vec<IceServerConfig>,

    /// Maximum simultaneous peer sessions (default: 16, max: 64)
    pub max_peers: u32,

    /// How long an offer may wait for its answer (default: 15000ms)
    pub negotiation_timeout_ms: u64,

    /// How long `wait_until_ready` waits for a context ack (default: 10000ms)
    pub context_ack_timeout_ms: u64,

    /// Send `connectContext` as soon as a context change is acknowledged
    pub auto_connect_on_context_change: bool,

    /// Channel settings used when a caller does not pass its own
    pub default_channel: DataChannelConfig,
}

/// A single ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// Server URLs (stun:, turn:, turns:)
    pub urls: Vec<String>,

    /// Username for TURN authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Credential for TURN authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// STUN server without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// TURN server with credentials
    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.urls.is_empty() {
            return Err(Error::InvalidConfig(
                "ICE server entry must have at least one URL".to_string(),
            ));
        }

        for url in &self.urls {
            let is_turn = url.starts_with("turn:") || url.starts_with("turns:");
            if !is_turn && !url.starts_with("stun:") && !url.starts_with("stuns:") {
                return Err(Error::InvalidConfig(format!(
                    "ICE server URL must start with stun:, stuns:, turn: or turns:, got {}",
                    url
                )));
            }
            if is_turn && (self.username.is_none() || self.credential.is_none()) {
                return Err(Error::InvalidConfig(format!(
                    "TURN server {} requires username and credential",
                    url
                )));
            }
        }

        Ok(())
    }
}

/// Data channel mode
///
/// Determines the reliability of message delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataChannelMode {
    /// Reliable, ordered delivery (default)
    #[default]
    Reliable,
    /// Unreliable, unordered delivery (low latency)
    Unreliable,
}

impl DataChannelMode {
    /// Get the ordered setting for webrtc-rs
    pub fn ordered(&self) -> bool {
        match self {
            DataChannelMode::Reliable => true,
            DataChannelMode::Unreliable => false,
        }
    }

    /// Get the max retransmits setting for webrtc-rs
    pub fn max_retransmits(&self) -> Option<u16> {
        match self {
            DataChannelMode::Reliable => None,
            DataChannelMode::Unreliable => Some(0),
        }
    }
}

/// Per-label data channel definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DataChannelConfig {
    /// Delivery mode
    pub mode: DataChannelMode,

    /// Sub-protocol name negotiated with the remote side
    #[serde(skip_serializing_if = "String::is_empty")]
    pub protocol: String,
}

impl DataChannelConfig {
    /// Unreliable, unordered channel
    pub fn unreliable() -> Self {
        Self {
            mode: DataChannelMode::Unreliable,
            protocol: String::new(),
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig::stun("stun:stun.l.google.com:19302")],
            max_peers: 16,
            negotiation_timeout_ms: 15_000,
            context_ack_timeout_ms: 10_000,
            auto_connect_on_context_change: true,
            default_channel: DataChannelConfig::default(),
        }
    }
}

impl MeshConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `max_peers` is 0 or greater than 64
    /// - either timeout is zero
    /// - an ICE server entry is malformed
    pub fn validate(&self) -> Result<()> {
        if self.max_peers == 0 || self.max_peers > MAX_PEERS_LIMIT {
            return Err(Error::InvalidConfig(format!(
                "max_peers must be in range 1-{}, got {}",
                MAX_PEERS_LIMIT, self.max_peers
            )));
        }

        if self.negotiation_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "negotiation_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.context_ack_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "context_ack_timeout_ms must be greater than 0".to_string(),
            ));
        }

        for server in &self.ice_servers {
            server.validate()?;
        }

        Ok(())
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: MeshConfig = serde_yaml::from_str(yaml)
            .map_err(|e| Error::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML config file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Negotiation timeout as a `Duration`
    pub fn negotiation_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.negotiation_timeout_ms)
    }

    /// Context ack timeout as a `Duration`
    pub fn context_ack_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.context_ack_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = MeshConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_peers, 16);
        assert!(config.auto_connect_on_context_change);
    }

    #[test]
    fn test_invalid_max_peers() {
        let mut config = MeshConfig::default();
        config.max_peers = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        config.max_peers = 65;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let mut config = MeshConfig::default();
        config.negotiation_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = MeshConfig::default();
        config.context_ack_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_turn_requires_credentials() {
        let mut config = MeshConfig::default();
        config.ice_servers.push(IceServerConfig {
            urls: vec!["turn:turn.example.com:3478".to_string()],
            username: None,
            credential: None,
        });
        assert!(config.validate().is_err());

        config.ice_servers.pop();
        config
            .ice_servers
            .push(IceServerConfig::turn("turn:turn.example.com:3478", "u", "p"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_ice_url_rejected() {
        let mut config = MeshConfig::default();
        config.ice_servers = vec![IceServerConfig::stun("http://example.com")];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_data_channel_mode() {
        assert!(DataChannelMode::Reliable.ordered());
        assert_eq!(DataChannelMode::Reliable.max_retransmits(), None);
        assert!(!DataChannelMode::Unreliable.ordered());
        assert_eq!(DataChannelMode::Unreliable.max_retransmits(), Some(0));
    }

    #[test]
    fn test_yaml_partial_override() {
        let yaml = r#"
max_peers: 4
negotiation_timeout_ms: 2500
default_channel:
  mode: unreliable
"#;
        let config = MeshConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.max_peers, 4);
        assert_eq!(config.negotiation_timeout_ms, 2500);
        assert_eq!(config.default_channel.mode, DataChannelMode::Unreliable);
        // untouched fields keep defaults
        assert_eq!(config.context_ack_timeout_ms, 10_000);
        assert_eq!(config.ice_servers.len(), 1);
    }

    #[test]
    fn test_yaml_file_validation_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_peers: 100").unwrap();
        let err = MeshConfig::from_yaml_file(file.path()).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
