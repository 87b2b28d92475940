//! PeerMesh node binary
//!
//! Joins a context over WebSocket signaling, meshes with every member over
//! WebRTC and bridges a text data channel to stdin/stdout.
//!
//! # Usage
//!
//! ```bash
//! # Join a room on a local signaling server
//! cargo run --bin peermesh-node -- \
//!   --signaling-url ws://localhost:8080 \
//!   --context room-42
//!
//! # Load settings from YAML, override STUN servers and peer limit
//! cargo run --bin peermesh-node -- \
//!   --config ./mesh.yaml \
//!   --stun-servers stun:stun.l.google.com:19302 \
//!   --max-peers 8
//! ```

use anyhow::Context as _;
use clap::Parser;
use peermesh::signaling::WebSocketBus;
use peermesh::transport::webrtc::WebRtcEngine;
use peermesh::{IceServerConfig, Mesh, MeshConfig, MeshEvent};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// PeerMesh node
///
/// Full-mesh peer connections for every member of a signaling context.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// WebSocket signaling URL
    #[arg(
        long,
        default_value = "ws://localhost:8080",
        env = "PEERMESH_SIGNALING_URL"
    )]
    signaling_url: String,

    /// Context to join once the signaling service has assigned our id
    #[arg(long, env = "PEERMESH_CONTEXT")]
    context: Option<String>,

    /// YAML configuration file
    #[arg(long, env = "PEERMESH_CONFIG")]
    config: Option<PathBuf>,

    /// STUN servers (comma-separated); replaces the configured ICE servers
    #[arg(long, value_delimiter = ',', env = "PEERMESH_STUN_SERVERS")]
    stun_servers: Vec<String>,

    /// Maximum concurrent peer sessions
    #[arg(long, env = "PEERMESH_MAX_PEERS")]
    max_peers: Option<u32>,

    /// How long an offer may stay unanswered, in milliseconds
    #[arg(long, env = "PEERMESH_NEGOTIATION_TIMEOUT_MS")]
    negotiation_timeout_ms: Option<u64>,

    /// Label of the text channel bridged to stdin/stdout
    #[arg(long, default_value = "chat", env = "PEERMESH_CHAT_LABEL")]
    chat_label: String,

    /// Log output format
    #[arg(long, default_value = "text", env = "PEERMESH_LOG_FORMAT")]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

/// Layer CLI overrides on top of the file (or default) configuration
fn build_config_from_args(args: &Args) -> anyhow::Result<MeshConfig> {
    let mut config = match &args.config {
        Some(path) => MeshConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => MeshConfig::default(),
    };

    if !args.stun_servers.is_empty() {
        config.ice_servers = args
            .stun_servers
            .iter()
            .map(|url| IceServerConfig::stun(url.clone()))
            .collect();
    }
    if let Some(max_peers) = args.max_peers {
        config.max_peers = max_peers;
    }
    if let Some(timeout_ms) = args.negotiation_timeout_ms {
        config.negotiation_timeout_ms = timeout_ms;
    }

    config.validate()?;
    Ok(config)
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

fn log_event(event: &MeshEvent) {
    match event {
        MeshEvent::ContextCreated { peer_id, context } => {
            info!("Assigned id {} in context {}", peer_id, context)
        }
        MeshEvent::ContextChanged { context } => info!("Now in context {}", context),
        MeshEvent::PeerConnected { peer_id } => info!("Connected to {}", peer_id),
        MeshEvent::PeerDisconnected { peer_id } => warn!("Lost connection to {}", peer_id),
        MeshEvent::PeerClosed { peer_id } => info!("Closed session with {}", peer_id),
        MeshEvent::RemoteTrack { peer_id, track } => {
            info!("Receiving {} track {} from {}", track.kind, track.id, peer_id)
        }
        MeshEvent::ChannelMessage {
            peer_id,
            label,
            data,
        } => {
            println!("[{}] {}: {}", label, peer_id, String::from_utf8_lossy(data));
        }
        MeshEvent::Error { peer_id, error } => match peer_id {
            Some(peer_id) => warn!("Error with {}: {}", peer_id, error),
            None => warn!("Mesh error: {}", error),
        },
        _ => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!(
        "Starting peermesh-node {} (signaling: {})",
        peermesh::version(),
        args.signaling_url
    );

    let config = build_config_from_args(&args)?;
    let ack_timeout = config.context_ack_timeout();

    let bus = Arc::new(
        WebSocketBus::connect(&args.signaling_url)
            .await
            .with_context(|| format!("connecting to {}", args.signaling_url))?,
    );
    let mesh = Mesh::new(config, bus, Arc::new(WebRtcEngine::new()))?;
    mesh.subscribe(log_event);
    mesh.start()?;

    let chat = mesh.create_data_channel(&args.chat_label, None).await?;

    let context = mesh.wait_until_ready(ack_timeout).await?;
    info!("Ready in context {}", context);
    if let Some(target) = args.context.as_deref() {
        if target != context {
            mesh.change_context(target).await?;
            mesh.wait_until_ready(ack_timeout).await?;
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) if !line.trim().is_empty() => {
                    if let Err(e) = chat.send(line.into_bytes()).await {
                        warn!("Failed to send: {}", e);
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    info!("stdin closed, shutting down");
                    break;
                }
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            },
        }
    }

    mesh.shutdown().await?;
    Ok(())
}
