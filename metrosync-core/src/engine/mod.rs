//! Sync Engine
//!
//! The façade the embedding application talks to. `start` binds the peer
//! listener and starts discovery; from then on a single event loop task
//! consumes everything the read loops, the registry and discovery report,
//! and is the only writer of the observable state.
//!
//! Remote playback commands are surfaced on `inbound_commands` and never
//! executed here.

mod config;
mod state;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use config::SyncConfig;
pub use state::{InboundCommand, SyncEvent};

use crate::discovery::{
    Advertisement, DirectPeerFeed, DiscoveryAdapter, DiscoveryError, DiscoveryEvent,
    DiscoveryMode, DiscoveryStreams, PeerAnnouncement,
};
use crate::identity::PeerIdentity;
use crate::protocol::{
    Announce, ConnectionStatus, EncodeError, LinkState, Message, MessageBody, PlaybackCommand,
    PlaybackState, QueueSync, TrackInfo,
};
use crate::transport::{
    handshake, listener, BroadcastReport, ConnectionEvent, ConnectionId, Direction, Handshake,
    HandshakeError, ListenerHandle, PeerConnection, RegistryError, RegistryEvent, RegistryHandle,
    RemovalReason, WriteError,
};
use state::EngineState;

/// Extra wait on top of the handshake timeout before `connect_to` gives up
/// on its own, in case the connection was never reported as removed
const HANDSHAKE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Failed to bind peer listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connecting to {addr} timed out after {after:?}")]
    ConnectTimeout { addr: String, after: Duration },

    #[error("Peer did not announce itself within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Not connected to {0}")]
    NotConnected(PeerIdentity),

    #[error("Sync engine is not running")]
    NotRunning,

    #[error("Sync engine is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("Send failed: {0}")]
    Write(#[from] WriteError),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl From<HandshakeError> for SyncError {
    fn from(e: HandshakeError) -> Self {
        match e {
            HandshakeError::Connect { addr, source } => SyncError::Connect { addr, source },
            HandshakeError::ConnectTimeout { addr, after } => {
                SyncError::ConnectTimeout { addr, after }
            }
            other => SyncError::HandshakeFailed(other.to_string()),
        }
    }
}

impl From<RegistryError> for SyncError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotConnected(identity) => SyncError::NotConnected(identity),
            RegistryError::Write { source, .. } => SyncError::Write(source),
            RegistryError::Encode(e) => SyncError::Encode(e),
            RegistryError::UnknownConnection(_) | RegistryError::Closed => SyncError::NotRunning,
        }
    }
}

/// Requests fed into the event loop from outside the transport
enum Control {
    Advertised(bool),
    Discovery(DiscoveryEvent),
    DialFinished(PeerIdentity),
    /// Discovery switched modes; peers only the old session saw are stale
    DiscoveryRestarted,
}

/// Everything that exists only while the engine runs
struct Running {
    local_addr: SocketAddr,
    advertisement: Advertisement,
    registry: RegistryHandle,
    handshake: Handshake,
    listener: ListenerHandle,
    discovery: DiscoveryAdapter,
    control_tx: mpsc::UnboundedSender<Control>,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Device sync engine
pub struct SyncEngine {
    config: Arc<SyncConfig>,
    identity: PeerIdentity,
    direct_feed: DirectPeerFeed,
    discovery_mode: Mutex<DiscoveryMode>,
    state: Arc<EngineState>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl SyncEngine {
    pub fn new(config: SyncConfig, identity: PeerIdentity) -> Self {
        info!(
            "Sync engine for {} ({}, {:?})",
            identity, config.device_name, config.device_type
        );

        Self {
            discovery_mode: Mutex::new(config.discovery_mode),
            config: Arc::new(config),
            identity,
            direct_feed: DirectPeerFeed::new(),
            state: Arc::new(EngineState::new()),
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn local_identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Feed for the platform's direct peer-to-peer service
    pub fn direct_feed(&self) -> DirectPeerFeed {
        self.direct_feed.clone()
    }

    /// Mode used by the running engine, or by the next `start`
    pub fn discovery_mode(&self) -> DiscoveryMode {
        *self.discovery_mode.lock()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Address the peer listener is bound to, while running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Bind the listener and start discovery. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, SyncError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(SyncError::AlreadyRunning);
        }

        let (registry_tx, registry_rx) = mpsc::unbounded_channel();
        let (connection_tx, connection_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let registry = RegistryHandle::spawn(registry_tx);
        let handshake = Handshake::new(
            registry.clone(),
            connection_tx,
            self.identity.clone(),
            self.config.announce(),
        )
        .with_limits(
            self.config.write_timeout,
            self.config.handshake_timeout,
            self.config.max_frame_len,
        );

        let listen_addr = self.config.listen_addr;
        let listener = listener::bind(listen_addr, handshake.clone())
            .await
            .map_err(|source| SyncError::Bind {
                addr: listen_addr,
                source,
            })?;
        let local_addr = listener.local_addr();

        let advertisement = Advertisement {
            identity: self.identity.clone(),
            name: self.config.device_name.clone(),
            port: local_addr.port(),
        };
        let mut discovery = DiscoveryAdapter::new(self.direct_feed.clone());
        let streams = match discovery.start(self.discovery_mode(), &advertisement).await {
            Ok(streams) => streams,
            Err(e) => {
                warn!("Discovery failed to start: {}", e);
                listener.shutdown().await;
                return Err(e.into());
            }
        };
        tokio::spawn(forward_discovery(streams, control_tx.clone()));

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let event_loop = EventLoop {
            identity: self.identity.clone(),
            config: self.config.clone(),
            registry: registry.clone(),
            handshake: handshake.clone(),
            state: self.state.clone(),
            control_tx: control_tx.clone(),
            dialing: HashSet::new(),
        };
        let task = tokio::spawn(event_loop.run(connection_rx, registry_rx, control_rx, shutdown_rx));

        info!("Sync engine started on {}", local_addr);
        *running = Some(Running {
            local_addr,
            advertisement,
            registry,
            handshake,
            listener,
            discovery,
            control_tx,
            shutdown_tx,
            task,
        });

        Ok(local_addr)
    }

    /// Close every connection, the listener and discovery. Calling it on a
    /// stopped engine does nothing.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            debug!("Sync engine already stopped");
            return;
        };
        let Running {
            registry,
            listener,
            mut discovery,
            shutdown_tx,
            task,
            ..
        } = running;

        listener.shutdown().await;
        discovery.stop().await;

        let goodbye = self.goodbye("Device stopped syncing");
        if let Err(e) = registry.broadcast(&goodbye).await {
            debug!("Goodbye broadcast failed: {}", e);
        }

        // Stop the loop first so the closes below are not reported twice
        let _ = shutdown_tx.send(());
        if let Err(e) = task.await {
            debug!("Engine loop ended abnormally: {}", e);
        }

        let peers = registry.identities().await;
        let closed = registry.clear().await;
        for identity in peers {
            self.state.emit(SyncEvent::PeerDisconnected {
                identity,
                reason: Some("engine stopped".to_string()),
            });
        }
        self.state.reset_session();

        info!("Sync engine stopped, closed {} connections", closed);
    }

    /// Peers seen through discovery or a completed handshake, sorted by identity
    pub fn discovered_peers(&self) -> watch::Receiver<Vec<PeerAnnouncement>> {
        self.state.discovered()
    }

    /// Last playback state from any source, local or remote
    pub fn current_playback_state(&self) -> watch::Receiver<Option<PlaybackState>> {
        self.state.playback()
    }

    pub fn current_queue(&self) -> watch::Receiver<Option<QueueSync>> {
        self.state.queue()
    }

    /// Playback commands from peers, for the application to execute
    pub fn inbound_commands(&self) -> broadcast::Receiver<InboundCommand> {
        self.state.commands()
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.state.events()
    }

    /// Identities with a live, identified connection
    pub async fn connected_peers(&self) -> Vec<PeerIdentity> {
        match self.registry().await {
            Some(registry) => registry.identities().await,
            None => Vec::new(),
        }
    }

    /// Record our playback state and send it to every connected peer.
    ///
    /// While stopped only the local state is updated.
    pub async fn publish_local_state(
        &self,
        state: PlaybackState,
    ) -> Result<BroadcastReport, SyncError> {
        self.state.set_playback(state.clone());
        self.broadcast(MessageBody::PlaybackState(state)).await
    }

    /// Record our queue and send it to every connected peer
    pub async fn publish_queue(
        &self,
        queue: Vec<TrackInfo>,
        current_index: usize,
    ) -> Result<BroadcastReport, SyncError> {
        let queue = QueueSync {
            queue,
            current_index,
        };
        self.state.set_queue(queue.clone());
        self.broadcast(MessageBody::QueueSync(queue)).await
    }

    pub async fn send_command(
        &self,
        identity: &PeerIdentity,
        command: PlaybackCommand,
    ) -> Result<(), SyncError> {
        let registry = self.registry().await.ok_or(SyncError::NotRunning)?;
        let message = self.message(MessageBody::PlaybackCommand(command));
        registry.send_to(identity, &message).await?;
        Ok(())
    }

    /// Connect to a peer by address. Resolves once the peer has announced
    /// itself, with the identity it announced.
    pub async fn connect_to(&self, host: &str, port: u16) -> Result<PeerIdentity, SyncError> {
        let handshake = self
            .running
            .lock()
            .await
            .as_ref()
            .map(|r| r.handshake.clone())
            .ok_or(SyncError::NotRunning)?;

        let identity = connect(&handshake, &self.state, &self.config, host, port).await?;
        info!("Connected to {} at {}:{}", identity, host, port);
        Ok(identity)
    }

    /// Say goodbye to one peer and close its connection
    pub async fn disconnect(&self, identity: &PeerIdentity) -> Result<(), SyncError> {
        let registry = self.registry().await.ok_or(SyncError::NotRunning)?;
        let connection = registry
            .connection_for(identity)
            .await
            .ok_or_else(|| SyncError::NotConnected(identity.clone()))?;

        if let Err(e) = connection.send(&self.goodbye("Disconnected")).await {
            debug!("Goodbye to {} failed: {}", identity, e);
        }
        registry
            .remove_connection(connection.id(), RemovalReason::Closed(None))
            .await;

        info!("Disconnected from {}", identity);
        Ok(())
    }

    /// Change discovery mode. On a running engine the current backend is
    /// fully stopped before the new one starts.
    pub async fn switch_discovery_mode(&self, mode: DiscoveryMode) -> Result<(), SyncError> {
        *self.discovery_mode.lock() = mode;

        let mut guard = self.running.lock().await;
        let Some(running) = guard.as_mut() else {
            return Ok(());
        };

        let streams = running
            .discovery
            .switch_mode(mode, &running.advertisement)
            .await?;
        let _ = running.control_tx.send(Control::DiscoveryRestarted);
        tokio::spawn(forward_discovery(streams, running.control_tx.clone()));
        Ok(())
    }

    async fn registry(&self) -> Option<RegistryHandle> {
        self.running.lock().await.as_ref().map(|r| r.registry.clone())
    }

    async fn broadcast(&self, body: MessageBody) -> Result<BroadcastReport, SyncError> {
        let Some(registry) = self.registry().await else {
            return Ok(BroadcastReport::default());
        };
        Ok(registry.broadcast(&self.message(body)).await?)
    }

    fn message(&self, body: MessageBody) -> Message {
        Message::new(self.identity.clone(), body)
    }

    fn goodbye(&self, reason: &str) -> Message {
        self.message(MessageBody::ConnectionStatus(ConnectionStatus {
            state: LinkState::Disconnected,
            message: Some(reason.to_string()),
        }))
    }
}

/// Dial, register, announce, and wait for the peer's Announce
async fn connect(
    handshake: &Handshake,
    state: &EngineState,
    config: &SyncConfig,
    host: &str,
    port: u16,
) -> Result<PeerIdentity, SyncError> {
    let stream = handshake::dial(host, port, config.connect_timeout).await?;
    let pending = handshake.register(stream, Direction::Outbound).await?;

    // Wait on the Announce before the read loop can deliver it
    let id = pending.id();
    let announced = state.await_handshake(id);
    if let Err(e) = handshake.begin(pending).await {
        state.abandon_handshake(id);
        return Err(e.into());
    }

    match tokio::time::timeout(config.handshake_timeout + HANDSHAKE_GRACE, announced).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(SyncError::HandshakeFailed("engine stopped".to_string())),
        Err(_) => {
            state.abandon_handshake(id);
            handshake
                .registry()
                .remove_connection(id, RemovalReason::HandshakeTimeout)
                .await;
            Err(SyncError::HandshakeTimeout(config.handshake_timeout))
        }
    }
}

/// Pump one discovery session into the event loop until it ends
async fn forward_discovery(mut streams: DiscoveryStreams, control: mpsc::UnboundedSender<Control>) {
    loop {
        let control_msg = tokio::select! {
            Some(registered) = streams.registrations.recv() => Control::Advertised(registered),
            Some(event) = streams.events.recv() => Control::Discovery(event),
            else => break,
        };
        if control.send(control_msg).is_err() {
            break;
        }
    }
    debug!("Discovery session ended");
}

/// Sole consumer of connection, registry and discovery events
struct EventLoop {
    identity: PeerIdentity,
    config: Arc<SyncConfig>,
    registry: RegistryHandle,
    handshake: Handshake,
    state: Arc<EngineState>,
    control_tx: mpsc::UnboundedSender<Control>,
    /// Auto-connects in flight
    dialing: HashSet<PeerIdentity>,
}

impl EventLoop {
    async fn run(
        mut self,
        mut connections: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut removals: mpsc::UnboundedReceiver<RegistryEvent>,
        mut control: mpsc::UnboundedReceiver<Control>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                Some(event) = connections.recv() => self.on_connection_event(event).await,
                Some(event) = removals.recv() => self.on_removed(event).await,
                Some(request) = control.recv() => self.on_control(request).await,
            }
        }
        debug!("Engine loop stopped");
    }

    async fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Received { id, message } => self.on_message(id, message).await,
            ConnectionEvent::Closed { id, error } => {
                let reason = RemovalReason::Closed(error);
                if self
                    .registry
                    .remove_connection(id, reason.clone())
                    .await
                    .is_none()
                {
                    // Already gone; make sure a pending connect_to hears about it
                    self.fail_handshake(id, &reason);
                }
            }
        }
    }

    async fn on_message(&mut self, id: ConnectionId, message: Message) {
        let Some(connection) = self.registry.get(id).await else {
            debug!("{} from unregistered connection {}", message.kind(), id);
            return;
        };

        match (connection.identity(), message.body) {
            (None, MessageBody::Announce(announce)) => {
                self.on_announce(&connection, message.device_id, announce).await
            }
            (None, body) => {
                debug!(
                    "Dropping {} from {} before its Announce",
                    body.kind(),
                    connection.remote_addr()
                );
            }
            (Some(identity), MessageBody::Announce(_)) => {
                debug!("Ignoring repeated Announce from {}", identity);
            }
            (Some(_), MessageBody::PlaybackState(playback)) => {
                debug!("Playback state from {}", message.device_id);
                self.state.set_playback(playback);
            }
            (Some(_), MessageBody::PlaybackCommand(command)) => {
                debug!("{:?} command from {}", command.action, message.device_id);
                self.state.emit_command(InboundCommand {
                    from: message.device_id,
                    timestamp: message.timestamp,
                    command,
                });
            }
            (Some(_), MessageBody::QueueSync(queue)) => {
                debug!(
                    "Queue of {} tracks from {}",
                    queue.queue.len(),
                    message.device_id
                );
                self.state.set_queue(queue);
            }
            (Some(identity), MessageBody::ConnectionStatus(status)) => {
                debug!("{} reports {:?}", identity, status.state);
                self.state.emit(SyncEvent::PeerStatus { identity, status });
            }
        }
    }

    async fn on_announce(
        &mut self,
        connection: &PeerConnection,
        identity: PeerIdentity,
        announce: Announce,
    ) {
        if identity == self.identity {
            warn!(
                "Connection {} with {} announced our own identity, closing",
                connection.id(),
                connection.remote_addr()
            );
            self.registry
                .remove_connection(
                    connection.id(),
                    RemovalReason::Closed(Some("connected to itself".to_string())),
                )
                .await;
            return;
        }

        if let Err(e) = self.registry.identify(connection.id(), identity.clone()).await {
            debug!("Could not identify connection {}: {}", connection.id(), e);
            return;
        }

        let mut peer = PeerAnnouncement::new(identity.clone(), announce.device_name.clone());
        peer.device_type = Some(announce.device_type);
        peer.capabilities = announce.capabilities;
        if connection.direction() == Direction::Outbound {
            peer = peer.with_address(connection.remote_addr());
        }
        self.state.upsert_peer(peer);
        self.state.complete_handshake(connection.id(), &identity);

        info!(
            "{} is {} ({:?})",
            identity, announce.device_name, announce.device_type
        );
        self.state.emit(SyncEvent::PeerConnected {
            identity,
            device_name: announce.device_name,
            device_type: announce.device_type,
        });
    }

    async fn on_removed(&mut self, event: RegistryEvent) {
        let RegistryEvent::Removed { connection, reason } = event;

        self.fail_handshake(connection.id(), &reason);

        if reason == RemovalReason::Superseded {
            return;
        }
        let Some(identity) = connection.identity() else {
            return;
        };
        if self.registry.connection_for(&identity).await.is_some() {
            return;
        }

        info!("Lost connection to {}: {}", identity, reason);
        self.state.remove_peer(&identity);
        self.state.emit(SyncEvent::PeerDisconnected {
            identity,
            reason: match reason {
                RemovalReason::Closed(None) => None,
                other => Some(other.to_string()),
            },
        });
    }

    async fn on_control(&mut self, request: Control) {
        match request {
            Control::Advertised(registered) => {
                if registered {
                    info!("Advertising as {}", self.identity);
                } else {
                    warn!("Advertisement was not registered");
                }
                self.state.emit(SyncEvent::Advertised(registered));
            }
            Control::Discovery(DiscoveryEvent::PeerFound(peer)) => self.on_peer_found(peer).await,
            Control::Discovery(DiscoveryEvent::PeerLost(identity)) => {
                // A live connection outranks discovery
                if self.registry.connection_for(&identity).await.is_none() {
                    debug!("Discovery lost {}", identity);
                    self.state.remove_peer(&identity);
                }
            }
            Control::Discovery(DiscoveryEvent::Failed(reason)) => {
                warn!("Discovery failed: {}", reason);
                self.state.emit(SyncEvent::DiscoveryFailed(reason));
            }
            Control::DialFinished(identity) => {
                self.dialing.remove(&identity);
            }
            Control::DiscoveryRestarted => {
                let connected: HashSet<PeerIdentity> =
                    self.registry.identities().await.into_iter().collect();
                self.state.retain_peers(|p| connected.contains(&p.identity));
            }
        }
    }

    async fn on_peer_found(&mut self, peer: PeerAnnouncement) {
        if peer.identity == self.identity {
            return;
        }
        self.state.upsert_peer(peer.clone());

        // Only the lower identity dials, so two peers never race to replace
        // each other's connection
        if !self.config.auto_connect || self.identity > peer.identity {
            return;
        }
        let Some(address) = peer.address else {
            return;
        };
        if self.dialing.contains(&peer.identity)
            || self.registry.connection_for(&peer.identity).await.is_some()
        {
            return;
        }

        self.dialing.insert(peer.identity.clone());
        let handshake = self.handshake.clone();
        let state = self.state.clone();
        let config = self.config.clone();
        let control = self.control_tx.clone();
        let identity = peer.identity;

        tokio::spawn(async move {
            info!("Auto-connecting to {} at {}", identity, address);
            let host = address.ip().to_string();
            match connect(&handshake, &state, &config, &host, address.port()).await {
                Ok(announced) if announced != identity => {
                    warn!("{} at {} announced itself as {}", identity, address, announced);
                }
                Ok(_) => {}
                Err(e) => warn!("Auto-connect to {} failed: {}", identity, e),
            }
            let _ = control.send(Control::DialFinished(identity));
        });
    }

    fn fail_handshake(&self, id: ConnectionId, reason: &RemovalReason) {
        let timeout = self.config.handshake_timeout;
        self.state.fail_handshake(id, || match reason {
            RemovalReason::HandshakeTimeout => SyncError::HandshakeTimeout(timeout),
            other => SyncError::HandshakeFailed(other.to_string()),
        });
    }
}
