//! Session implementation for FFI

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::discovery::{DirectPeerFeed, PeerAnnouncement};
use crate::engine::{SyncConfig, SyncEngine, SyncEvent};
use crate::identity::{IdentityStore, PeerIdentity};
use crate::logging;

use super::types::*;

/// One device's sync session, as seen by the app
#[derive(uniffi::Object)]
pub struct SyncSession {
    runtime: Runtime,
    engine: Arc<SyncEngine>,
    direct_feed: DirectPeerFeed,
    /// Task forwarding engine updates to the registered callback
    pump: Mutex<Option<AbortHandle>>,
}

#[uniffi::export]
impl SyncSession {
    /// Create a session. `listen_port` 0 picks a free port. Without an
    /// `identity_path` a fresh identity is generated for this session only.
    #[uniffi::constructor]
    pub fn new(
        device_name: String,
        device_type: DeviceType,
        listen_port: u16,
        identity_path: Option<String>,
    ) -> Result<Self, CoreError> {
        logging::init();

        let identity = match identity_path {
            Some(path) => IdentityStore::new(path).load_or_create()?,
            None => PeerIdentity::generate(),
        };
        info!("Initializing sync session for {}", identity);

        let runtime = Runtime::new().map_err(|e| CoreError::RuntimeError(e.to_string()))?;
        let config = SyncConfig::new(device_name, device_type.into()).with_port(listen_port);
        let engine = Arc::new(SyncEngine::new(config, identity));

        Ok(Self {
            runtime,
            direct_feed: engine.direct_feed(),
            engine,
            pump: Mutex::new(None),
        })
    }

    /// Set the event callback. The current peers, playback state and queue
    /// are delivered right away.
    pub fn set_callback(&self, callback: Box<dyn SyncCallback>) {
        let callback: Arc<dyn SyncCallback> = Arc::from(callback);
        let task = self.runtime.spawn(pump(self.engine.clone(), callback));

        if let Some(previous) = self.pump.lock().replace(task.abort_handle()) {
            previous.abort();
        }
    }

    pub fn clear_callback(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }

    pub fn local_identity(&self) -> String {
        self.engine.local_identity().to_string()
    }

    /// Start listening and discovering. Returns the bound port.
    pub fn start(&self) -> Result<u16, CoreError> {
        let addr = self.runtime.block_on(self.engine.start())?;
        Ok(addr.port())
    }

    pub fn stop(&self) {
        self.runtime.block_on(self.engine.stop());
    }

    pub fn is_running(&self) -> bool {
        self.runtime.block_on(self.engine.is_running())
    }

    pub fn publish_playback_state(&self, state: PlaybackState) -> Result<DeliveryReport, CoreError> {
        let report = self
            .runtime
            .block_on(self.engine.publish_local_state(state.into()))?;
        log_failures(&report);
        Ok(report.into())
    }

    pub fn publish_queue(
        &self,
        tracks: Vec<TrackInfo>,
        current_index: u64,
    ) -> Result<DeliveryReport, CoreError> {
        let tracks: Vec<crate::protocol::TrackInfo> = tracks.into_iter().map(Into::into).collect();
        let report = self
            .runtime
            .block_on(self.engine.publish_queue(tracks, current_index as usize))?;
        log_failures(&report);
        Ok(report.into())
    }

    pub fn send_command(&self, identity: String, command: PlaybackCommand) -> Result<(), CoreError> {
        let identity = PeerIdentity::new(identity);
        self.runtime
            .block_on(self.engine.send_command(&identity, command.into()))?;
        Ok(())
    }

    /// Connect to a peer by address. Returns the identity it announced.
    pub fn connect_to(&self, host: String, port: u16) -> Result<String, CoreError> {
        let identity = self.runtime.block_on(self.engine.connect_to(&host, port))?;
        Ok(identity.to_string())
    }

    pub fn disconnect(&self, identity: String) -> Result<(), CoreError> {
        let identity = PeerIdentity::new(identity);
        self.runtime.block_on(self.engine.disconnect(&identity))?;
        Ok(())
    }

    pub fn switch_discovery_mode(&self, mode: DiscoveryMode) -> Result<(), CoreError> {
        self.runtime
            .block_on(self.engine.switch_discovery_mode(mode.into()))?;
        Ok(())
    }

    pub fn discovered_peers(&self) -> Vec<PeerInfo> {
        self.engine
            .discovered_peers()
            .borrow()
            .iter()
            .map(PeerInfo::from)
            .collect()
    }

    pub fn current_playback_state(&self) -> Option<PlaybackState> {
        self.engine
            .current_playback_state()
            .borrow()
            .clone()
            .map(PlaybackState::from)
    }

    pub fn current_queue(&self) -> Option<QueueState> {
        self.engine
            .current_queue()
            .borrow()
            .clone()
            .map(QueueState::from)
    }

    pub fn connected_peers(&self) -> Vec<String> {
        self.runtime
            .block_on(self.engine.connected_peers())
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    /// Direct mode: the peers the platform service currently sees
    pub fn report_direct_peers(&self, peers: Vec<PeerInfo>) {
        let peers: Vec<PeerAnnouncement> = peers.into_iter().map(Into::into).collect();
        debug!("Platform reports {} direct peers", peers.len());
        self.direct_feed.update_peers(peers);
    }

    pub fn direct_group_formed(&self) {
        self.direct_feed.group_formed();
    }

    pub fn direct_group_failed(&self, reason: String) {
        self.direct_feed.group_failed(reason);
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.clear_callback();
    }
}

fn log_failures(report: &crate::transport::BroadcastReport) {
    for (identity, error) in &report.failed {
        warn!("Could not deliver to {}: {}", identity, error);
    }
}

/// Forward engine observables to the callback until aborted
async fn pump(engine: Arc<SyncEngine>, callback: Arc<dyn SyncCallback>) {
    let mut peers = engine.discovered_peers();
    let mut playback = engine.current_playback_state();
    let mut queue = engine.current_queue();
    let mut commands = engine.inbound_commands();
    let mut events = engine.events();

    // Deliver what is already known
    peers.mark_changed();
    playback.mark_changed();
    queue.mark_changed();

    loop {
        tokio::select! {
            Ok(()) = peers.changed() => {
                let list: Vec<PeerInfo> = peers.borrow_and_update().iter().map(PeerInfo::from).collect();
                callback.on_peers_changed(list);
            }
            Ok(()) = playback.changed() => {
                let state = playback.borrow_and_update().clone();
                if let Some(state) = state {
                    callback.on_playback_state_changed(state.into());
                }
            }
            Ok(()) = queue.changed() => {
                let current = queue.borrow_and_update().clone();
                if let Some(current) = current {
                    callback.on_queue_changed(current.into());
                }
            }
            command = commands.recv() => match command {
                Ok(command) => callback.on_command(command.into()),
                Err(RecvError::Lagged(n)) => warn!("Callback fell behind, dropped {} commands", n),
                Err(RecvError::Closed) => break,
            },
            event = events.recv() => match event {
                Ok(event) => deliver(callback.as_ref(), event),
                Err(RecvError::Lagged(n)) => warn!("Callback fell behind, dropped {} events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }
}

fn deliver(callback: &dyn SyncCallback, event: SyncEvent) {
    match event {
        SyncEvent::PeerConnected {
            identity,
            device_name,
            device_type,
        } => callback.on_peer_connected(identity.to_string(), device_name, device_type.into()),
        SyncEvent::PeerDisconnected { identity, reason } => {
            callback.on_peer_disconnected(identity.to_string(), reason)
        }
        SyncEvent::PeerStatus { identity, status } => {
            callback.on_peer_status(identity.to_string(), status.state.into(), status.message)
        }
        SyncEvent::Advertised(registered) => callback.on_advertised(registered),
        SyncEvent::DiscoveryFailed(reason) => callback.on_discovery_failed(reason),
    }
}
