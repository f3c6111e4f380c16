//! FFI types exposed via uniffi

use crate::discovery::{DiscoveryMode as InternalDiscoveryMode, PeerAnnouncement};
use crate::engine::{InboundCommand as InternalInboundCommand, SyncError};
use crate::identity::{IdentityError, PeerIdentity};
use crate::protocol::{
    self, Capability as InternalCapability, DeviceType as InternalDeviceType,
    LinkState as InternalLinkState, PlaybackAction as InternalPlaybackAction,
    RepeatMode as InternalRepeatMode,
};
use crate::transport::BroadcastReport;

/// Error types exposed via FFI
#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum CoreError {
    #[error("Could not open the peer listener: {0}")]
    BindFailed(String),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Not connected to {0}")]
    NotConnected(String),

    #[error("Sync is not running")]
    NotRunning,

    #[error("Sync is already running")]
    AlreadyRunning,

    #[error("Discovery error: {0}")]
    DiscoveryError(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Identity error: {0}")]
    IdentityError(String),

    #[error("Runtime error: {0}")]
    RuntimeError(String),
}

impl From<SyncError> for CoreError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Bind { .. } => CoreError::BindFailed(e.to_string()),
            SyncError::Connect { .. } => CoreError::ConnectFailed(e.to_string()),
            SyncError::ConnectTimeout { .. } | SyncError::HandshakeTimeout(_) => {
                CoreError::Timeout(e.to_string())
            }
            SyncError::HandshakeFailed(reason) => CoreError::HandshakeFailed(reason),
            SyncError::NotConnected(identity) => CoreError::NotConnected(identity.to_string()),
            SyncError::NotRunning => CoreError::NotRunning,
            SyncError::AlreadyRunning => CoreError::AlreadyRunning,
            SyncError::Discovery(e) => CoreError::DiscoveryError(e.to_string()),
            SyncError::Write(e) => CoreError::SendFailed(e.to_string()),
            SyncError::Encode(e) => CoreError::SendFailed(e.to_string()),
        }
    }
}

impl From<IdentityError> for CoreError {
    fn from(e: IdentityError) -> Self {
        CoreError::IdentityError(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum DeviceType {
    Phone,
    Tablet,
    Watch,
    Other,
}

impl From<InternalDeviceType> for DeviceType {
    fn from(t: InternalDeviceType) -> Self {
        match t {
            InternalDeviceType::Phone => DeviceType::Phone,
            InternalDeviceType::Tablet => DeviceType::Tablet,
            InternalDeviceType::Watch => DeviceType::Watch,
            InternalDeviceType::Other => DeviceType::Other,
        }
    }
}

impl From<DeviceType> for InternalDeviceType {
    fn from(t: DeviceType) -> Self {
        match t {
            DeviceType::Phone => InternalDeviceType::Phone,
            DeviceType::Tablet => InternalDeviceType::Tablet,
            DeviceType::Watch => InternalDeviceType::Watch,
            DeviceType::Other => InternalDeviceType::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum Capability {
    PlaybackControl,
    QueueManagement,
    LibrarySync,
    OfflineMode,
    VolumeControl,
    LyricsDisplay,
}

impl From<InternalCapability> for Capability {
    fn from(c: InternalCapability) -> Self {
        match c {
            InternalCapability::PlaybackControl => Capability::PlaybackControl,
            InternalCapability::QueueManagement => Capability::QueueManagement,
            InternalCapability::LibrarySync => Capability::LibrarySync,
            InternalCapability::OfflineMode => Capability::OfflineMode,
            InternalCapability::VolumeControl => Capability::VolumeControl,
            InternalCapability::LyricsDisplay => Capability::LyricsDisplay,
        }
    }
}

impl From<Capability> for InternalCapability {
    fn from(c: Capability) -> Self {
        match c {
            Capability::PlaybackControl => InternalCapability::PlaybackControl,
            Capability::QueueManagement => InternalCapability::QueueManagement,
            Capability::LibrarySync => InternalCapability::LibrarySync,
            Capability::OfflineMode => InternalCapability::OfflineMode,
            Capability::VolumeControl => InternalCapability::VolumeControl,
            Capability::LyricsDisplay => InternalCapability::LyricsDisplay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum RepeatMode {
    Off,
    All,
    One,
}

impl From<InternalRepeatMode> for RepeatMode {
    fn from(m: InternalRepeatMode) -> Self {
        match m {
            InternalRepeatMode::Off => RepeatMode::Off,
            InternalRepeatMode::All => RepeatMode::All,
            InternalRepeatMode::One => RepeatMode::One,
        }
    }
}

impl From<RepeatMode> for InternalRepeatMode {
    fn from(m: RepeatMode) -> Self {
        match m {
            RepeatMode::Off => InternalRepeatMode::Off,
            RepeatMode::All => InternalRepeatMode::All,
            RepeatMode::One => InternalRepeatMode::One,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum PlaybackAction {
    Play,
    Pause,
    Next,
    Previous,
    Seek,
    SetVolume,
    ToggleShuffle,
    ToggleRepeat,
    PlaySong,
}

impl From<InternalPlaybackAction> for PlaybackAction {
    fn from(a: InternalPlaybackAction) -> Self {
        match a {
            InternalPlaybackAction::Play => PlaybackAction::Play,
            InternalPlaybackAction::Pause => PlaybackAction::Pause,
            InternalPlaybackAction::Next => PlaybackAction::Next,
            InternalPlaybackAction::Previous => PlaybackAction::Previous,
            InternalPlaybackAction::Seek => PlaybackAction::Seek,
            InternalPlaybackAction::SetVolume => PlaybackAction::SetVolume,
            InternalPlaybackAction::ToggleShuffle => PlaybackAction::ToggleShuffle,
            InternalPlaybackAction::ToggleRepeat => PlaybackAction::ToggleRepeat,
            InternalPlaybackAction::PlaySong => PlaybackAction::PlaySong,
        }
    }
}

impl From<PlaybackAction> for InternalPlaybackAction {
    fn from(a: PlaybackAction) -> Self {
        match a {
            PlaybackAction::Play => InternalPlaybackAction::Play,
            PlaybackAction::Pause => InternalPlaybackAction::Pause,
            PlaybackAction::Next => InternalPlaybackAction::Next,
            PlaybackAction::Previous => InternalPlaybackAction::Previous,
            PlaybackAction::Seek => InternalPlaybackAction::Seek,
            PlaybackAction::SetVolume => InternalPlaybackAction::SetVolume,
            PlaybackAction::ToggleShuffle => InternalPlaybackAction::ToggleShuffle,
            PlaybackAction::ToggleRepeat => InternalPlaybackAction::ToggleRepeat,
            PlaybackAction::PlaySong => InternalPlaybackAction::PlaySong,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum LinkState {
    Connected,
    Disconnected,
    Reconnecting,
    Error,
}

impl From<InternalLinkState> for LinkState {
    fn from(s: InternalLinkState) -> Self {
        match s {
            InternalLinkState::Connected => LinkState::Connected,
            InternalLinkState::Disconnected => LinkState::Disconnected,
            InternalLinkState::Reconnecting => LinkState::Reconnecting,
            InternalLinkState::Error => LinkState::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum DiscoveryMode {
    /// mDNS on the local network
    LocalNetwork,
    /// Platform peer-to-peer service, fed through `report_direct_peers`
    Direct,
    Disabled,
}

impl From<DiscoveryMode> for InternalDiscoveryMode {
    fn from(m: DiscoveryMode) -> Self {
        match m {
            DiscoveryMode::LocalNetwork => InternalDiscoveryMode::LocalNetwork,
            DiscoveryMode::Direct => InternalDiscoveryMode::Direct,
            DiscoveryMode::Disabled => InternalDiscoveryMode::Disabled,
        }
    }
}

/// Track information exposed via FFI
#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct TrackInfo {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub thumbnail_url: Option<String>,
    pub duration_ms: u64,
}

impl From<protocol::TrackInfo> for TrackInfo {
    fn from(t: protocol::TrackInfo) -> Self {
        Self {
            id: t.id,
            title: t.title,
            artist: t.artist,
            album: t.album,
            thumbnail_url: t.thumbnail_url,
            duration_ms: t.duration_ms,
        }
    }
}

impl From<TrackInfo> for protocol::TrackInfo {
    fn from(t: TrackInfo) -> Self {
        Self {
            id: t.id,
            title: t.title,
            artist: t.artist,
            album: t.album,
            thumbnail_url: t.thumbnail_url,
            duration_ms: t.duration_ms,
        }
    }
}

/// Playback state exposed via FFI
#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct PlaybackState {
    pub is_playing: bool,
    pub position_ms: u64,
    pub duration_ms: u64,
    pub current_track: Option<TrackInfo>,
    pub repeat_mode: RepeatMode,
    pub shuffle_enabled: bool,
    pub volume: f32,
}

impl From<protocol::PlaybackState> for PlaybackState {
    fn from(p: protocol::PlaybackState) -> Self {
        Self {
            is_playing: p.is_playing,
            position_ms: p.position_ms,
            duration_ms: p.duration_ms,
            current_track: p.current_track.map(TrackInfo::from),
            repeat_mode: p.repeat_mode.into(),
            shuffle_enabled: p.shuffle_enabled,
            volume: p.volume,
        }
    }
}

impl From<PlaybackState> for protocol::PlaybackState {
    fn from(p: PlaybackState) -> Self {
        Self {
            is_playing: p.is_playing,
            position_ms: p.position_ms,
            duration_ms: p.duration_ms,
            current_track: p.current_track.map(protocol::TrackInfo::from),
            repeat_mode: p.repeat_mode.into(),
            shuffle_enabled: p.shuffle_enabled,
            volume: p.volume.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct PlaybackCommand {
    pub action: PlaybackAction,
    /// Seek position, volume level or song id, depending on `action`
    pub value: Option<String>,
}

impl From<protocol::PlaybackCommand> for PlaybackCommand {
    fn from(c: protocol::PlaybackCommand) -> Self {
        Self {
            action: c.action.into(),
            value: c.value,
        }
    }
}

impl From<PlaybackCommand> for protocol::PlaybackCommand {
    fn from(c: PlaybackCommand) -> Self {
        Self {
            action: c.action.into(),
            value: c.value,
        }
    }
}

/// A command a peer sent us
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct InboundCommand {
    pub from: String,
    pub timestamp_ms: u64,
    pub command: PlaybackCommand,
}

impl From<InternalInboundCommand> for InboundCommand {
    fn from(c: InternalInboundCommand) -> Self {
        Self {
            from: c.from.to_string(),
            timestamp_ms: c.timestamp,
            command: c.command.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct QueueState {
    pub tracks: Vec<TrackInfo>,
    pub current_index: u64,
}

impl From<protocol::QueueSync> for QueueState {
    fn from(q: protocol::QueueSync) -> Self {
        Self {
            tracks: q.queue.into_iter().map(TrackInfo::from).collect(),
            current_index: q.current_index as u64,
        }
    }
}

/// Peer as shown in the device list
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct PeerInfo {
    pub identity: String,
    pub display_name: String,
    pub device_type: Option<DeviceType>,
    pub capabilities: Vec<Capability>,
    /// `host:port`, when known
    pub address: Option<String>,
}

impl From<&PeerAnnouncement> for PeerInfo {
    fn from(p: &PeerAnnouncement) -> Self {
        Self {
            identity: p.identity.to_string(),
            display_name: p.display_name.clone(),
            device_type: p.device_type.map(DeviceType::from),
            capabilities: p.capabilities.iter().copied().map(Capability::from).collect(),
            address: p.address.map(|a| a.to_string()),
        }
    }
}

impl From<PeerInfo> for PeerAnnouncement {
    /// An unparseable address is dropped; the peer stays listed but cannot
    /// be dialed
    fn from(p: PeerInfo) -> Self {
        Self {
            identity: PeerIdentity::new(p.identity),
            display_name: p.display_name,
            device_type: p.device_type.map(InternalDeviceType::from),
            capabilities: p.capabilities.into_iter().map(InternalCapability::from).collect(),
            address: p.address.and_then(|a| a.parse().ok()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct FailedDelivery {
    pub identity: String,
    pub error: String,
}

/// Outcome of publishing to every connected peer
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct DeliveryReport {
    pub delivered: Vec<String>,
    pub failed: Vec<FailedDelivery>,
}

impl From<BroadcastReport> for DeliveryReport {
    fn from(r: BroadcastReport) -> Self {
        Self {
            delivered: r.delivered.iter().map(ToString::to_string).collect(),
            failed: r
                .failed
                .into_iter()
                .map(|(identity, error)| FailedDelivery {
                    identity: identity.to_string(),
                    error,
                })
                .collect(),
        }
    }
}

/// Callback interface for session events
#[uniffi::export(callback_interface)]
pub trait SyncCallback: Send + Sync {
    fn on_peers_changed(&self, peers: Vec<PeerInfo>);
    fn on_playback_state_changed(&self, state: PlaybackState);
    fn on_queue_changed(&self, queue: QueueState);
    /// A peer asked us to act on our player
    fn on_command(&self, command: InboundCommand);
    fn on_peer_connected(&self, identity: String, device_name: String, device_type: DeviceType);
    fn on_peer_disconnected(&self, identity: String, reason: Option<String>);
    fn on_peer_status(&self, identity: String, state: LinkState, message: Option<String>);
    fn on_advertised(&self, registered: bool);
    fn on_discovery_failed(&self, reason: String);
}
