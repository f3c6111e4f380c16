//! Engine lifecycle for the headless node

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use metrosync_core::discovery::DiscoveryMode;
use metrosync_core::engine::{SyncConfig, SyncEngine, SyncEvent};
use metrosync_core::identity::IdentityStore;
use metrosync_core::protocol::DeviceType;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::Args;

/// Default identity file name
const IDENTITY_FILE: &str = "metrosync-identity";

/// Identity file next to the executable, or in the current dir
fn default_identity_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(IDENTITY_FILE)
}

/// Run one engine until Ctrl-C
pub async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let identity_path = args
        .identity_path
        .clone()
        .unwrap_or_else(default_identity_path);
    let identity = IdentityStore::new(identity_path).load_or_create()?;

    let discovery_mode = args.discovery_mode();
    let config = SyncConfig::new(args.name.clone(), DeviceType::Other)
        .with_port(args.port)
        .with_discovery_mode(discovery_mode);
    let engine = Arc::new(SyncEngine::new(config, identity));

    let mut peers = engine.discovered_peers();
    let mut playback = engine.current_playback_state();
    let mut commands = engine.inbound_commands();
    let mut events = engine.events();

    let addr = engine.start().await?;
    info!(
        "MetroSync node {} ({}) listening on {}",
        engine.local_identity(),
        args.name,
        addr
    );
    if discovery_mode == DiscoveryMode::Direct {
        warn!("Direct mode needs a platform feed; only manual connections will work");
    }

    for (host, port) in args.connect {
        let engine = engine.clone();
        tokio::spawn(async move {
            match engine.connect_to(&host, port).await {
                Ok(identity) => info!("Connected to {} at {}:{}", identity, host, port),
                Err(e) => warn!("Could not connect to {}:{}: {}", host, port, e),
            }
        });
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            Ok(()) = peers.changed() => {
                let list = peers.borrow_and_update().clone();
                info!("{} peers known", list.len());
                for peer in list {
                    match peer.address {
                        Some(address) => info!("  {} {} at {}", peer.identity, peer.display_name, address),
                        None => info!("  {} {}", peer.identity, peer.display_name),
                    }
                }
            }
            Ok(()) = playback.changed() => {
                let state = playback.borrow_and_update().clone();
                if let Some(state) = state {
                    let title = state
                        .current_track
                        .as_ref()
                        .map(|t| format!("{} - {}", t.artist, t.title))
                        .unwrap_or_else(|| "nothing".to_string());
                    info!(
                        "Playback: {} {} at {}ms",
                        if state.is_playing { "playing" } else { "paused on" },
                        title,
                        state.position_ms
                    );
                }
            }
            command = commands.recv() => match command {
                Ok(command) => info!(
                    "Command from {}: {:?} {}",
                    command.from,
                    command.command.action,
                    command.command.value.as_deref().unwrap_or("")
                ),
                Err(RecvError::Lagged(n)) => warn!("Missed {} commands", n),
                Err(RecvError::Closed) => break,
            },
            event = events.recv() => match event {
                Ok(event) => log_event(event),
                Err(RecvError::Lagged(n)) => warn!("Missed {} events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    engine.stop().await;
    Ok(())
}

fn log_event(event: SyncEvent) {
    match event {
        SyncEvent::PeerConnected {
            identity,
            device_name,
            device_type,
        } => info!("Peer connected: {} ({}, {:?})", identity, device_name, device_type),
        SyncEvent::PeerDisconnected { identity, reason } => match reason {
            Some(reason) => info!("Peer disconnected: {} ({})", identity, reason),
            None => info!("Peer disconnected: {}", identity),
        },
        SyncEvent::PeerStatus { identity, status } => {
            info!("{} reports {:?} {}", identity, status.state, status.message.unwrap_or_default())
        }
        SyncEvent::Advertised(true) => info!("Advertising on the network"),
        SyncEvent::Advertised(false) => warn!("Advertisement was rejected"),
        SyncEvent::DiscoveryFailed(reason) => warn!("Discovery failed: {}", reason),
    }
}
