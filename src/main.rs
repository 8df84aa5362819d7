//! Mesh Call CLI
//!
//! Tritt einem Raum bei und protokolliert alle Call-Events bis Ctrl+C.

use anyhow::Context;
use clap::Parser;
use mesh_call_lib::call_engine::{CallDependencies, CallEvent, CallSessionManager};
use mesh_call_lib::config::CallConfig;
use mesh_call_lib::media::{PlatformQuirks, SystemMediaDevices};
use mesh_call_lib::negotiation::WebRtcConnector;
use mesh_call_lib::signaling::{ConnectionEvent, WebSocketTransport};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "mesh-call")]
#[command(version, about = "Join a multi-party peer-to-peer call")]
struct Cli {
    /// Room to join
    #[arg(short, long)]
    room: String,

    /// Local participant id (random if omitted)
    #[arg(short, long)]
    user: Option<String>,

    /// Display name announced to the room
    #[arg(short, long)]
    name: Option<String>,

    /// Signaling relay URL (overrides SIGNALING_URL)
    #[arg(long)]
    signaling_url: Option<String>,

    /// Prefer the initiator role for every pair
    #[arg(long)]
    initiator: bool,

    /// Request a camera in addition to the microphone
    #[arg(long)]
    video: bool,

    /// Permission model of the host platform
    #[arg(long)]
    platform: Option<PlatformQuirks>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mesh_call_lib::init_logging();
    let cli = Cli::parse();

    let mut config = CallConfig::from_env();
    if let Some(url) = cli.signaling_url {
        config.signaling_url = url;
    }
    if let Some(platform) = cli.platform {
        config.platform = platform;
    }
    if cli.name.is_some() {
        config.display_name = cli.name;
    }
    config.media.video = cli.video;

    let user_id = cli
        .user
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let transport = Arc::new(WebSocketTransport::new(
        config.signaling_url.clone(),
        config.reconnect.clone(),
    ));
    transport
        .connect()
        .await
        .with_context(|| format!("cannot reach signaling relay {}", config.signaling_url))?;

    let mut connection_rx = transport.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = connection_rx.recv().await {
            match event {
                ConnectionEvent::Reconnecting { attempt, delay_ms } => {
                    tracing::warn!("Relay connection lost, retry #{} in {}ms", attempt, delay_ms)
                }
                ConnectionEvent::GaveUp => tracing::error!("Relay unreachable, giving up"),
                other => tracing::debug!("Relay: {:?}", other),
            }
        }
    });

    let connector = Arc::new(WebRtcConnector::new(&config.ice_servers));
    let deps = CallDependencies::full_mesh(
        Arc::new(SystemMediaDevices::new()),
        transport.clone(),
        connector,
        &config,
    );
    let manager = CallSessionManager::new(cli.room, user_id, config, deps);

    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event {
                CallEvent::ParticipantJoined(participant) => {
                    tracing::info!("{} joined", participant.display_name)
                }
                CallEvent::StreamReceived {
                    participant_id,
                    stream,
                } => tracing::info!(
                    "Receiving {} track(s) from {}",
                    stream.tracks().len(),
                    participant_id
                ),
                CallEvent::Error(e) => tracing::error!("{} ({})", e, e.user_message()),
                CallEvent::CallEnded => break,
                other => tracing::info!(
                    "{} {}",
                    other.name(),
                    other.participant_id().unwrap_or_default()
                ),
            }
        }
    });

    manager
        .start(cli.initiator)
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))
        .context("failed to join the call")?;
    tracing::info!(
        "In room {} as {}, press Ctrl+C to leave",
        manager.room_id(),
        manager.local_participant_id()
    );

    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for Ctrl+C")?;

    manager.end().await;
    transport.disconnect();
    Ok(())
}
