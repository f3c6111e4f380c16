//! Sync Protocol Messages

use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::identity::PeerIdentity;

/// Information about a track. Two tracks are equal when their ids match.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    /// YouTube Music video ID
    pub id: String,
    pub title: String,
    pub artist: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

impl PartialEq for TrackInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TrackInfo {}

impl Hash for TrackInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Kind of device taking part in sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    Phone,
    Tablet,
    Watch,
    Other,
}

impl DeviceType {
    /// Capabilities a device of this kind advertises by default
    pub fn default_capabilities(self) -> BTreeSet<Capability> {
        match self {
            DeviceType::Watch => [Capability::PlaybackControl, Capability::VolumeControl]
                .into_iter()
                .collect(),
            _ => Capability::all(),
        }
    }
}

/// Feature advertised by a device. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Capability {
    PlaybackControl,
    QueueManagement,
    LibrarySync,
    OfflineMode,
    VolumeControl,
    LyricsDisplay,
}

impl Capability {
    pub fn all() -> BTreeSet<Capability> {
        [
            Capability::PlaybackControl,
            Capability::QueueManagement,
            Capability::LibrarySync,
            Capability::OfflineMode,
            Capability::VolumeControl,
            Capability::LyricsDisplay,
        ]
        .into_iter()
        .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RepeatMode {
    Off,
    All,
    One,
}

/// Handshake sent by both sides right after a connection opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announce {
    pub device_name: String,
    pub device_type: DeviceType,
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
}

/// Full playback snapshot. Last writer wins; no history is kept.
///
/// `current_track` is `None` only when nothing is playing and nothing is
/// queued for resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub is_playing: bool,
    pub position_ms: u64,
    pub duration_ms: u64,
    #[serde(default)]
    pub current_track: Option<TrackInfo>,
    pub repeat_mode: RepeatMode,
    pub shuffle_enabled: bool,
    /// Volume in the range `0.0..=1.0`
    pub volume: f32,
}

impl PlaybackState {
    /// Nothing playing, nothing queued
    pub fn idle() -> Self {
        Self {
            is_playing: false,
            position_ms: 0,
            duration_ms: 0,
            current_track: None,
            repeat_mode: RepeatMode::Off,
            shuffle_enabled: false,
            volume: 1.0,
        }
    }

    pub fn is_idle(&self) -> bool {
        !self.is_playing && self.current_track.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
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

/// Remote control request. The engine never executes these itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackCommand {
    pub action: PlaybackAction,
    /// Seek position, volume level or song id, depending on `action`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl PlaybackCommand {
    pub fn new(action: PlaybackAction) -> Self {
        Self { action, value: None }
    }

    pub fn with_value(action: PlaybackAction, value: impl Into<String>) -> Self {
        Self {
            action,
            value: Some(value.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSync {
    pub queue: Vec<TrackInfo>,
    pub current_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    Connected,
    Disconnected,
    Reconnecting,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: LinkState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Variant-specific part of a message
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Announce(Announce),
    PlaybackState(PlaybackState),
    PlaybackCommand(PlaybackCommand),
    QueueSync(QueueSync),
    ConnectionStatus(ConnectionStatus),
}

impl MessageBody {
    /// Discriminant written to the `type` field on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Announce(_) => "Announce",
            MessageBody::PlaybackState(_) => "PlaybackState",
            MessageBody::PlaybackCommand(_) => "PlaybackCommand",
            MessageBody::QueueSync(_) => "QueueSync",
            MessageBody::ConnectionStatus(_) => "ConnectionStatus",
        }
    }
}

/// A protocol message as exchanged between peers
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Originating device
    pub device_id: PeerIdentity,
    /// Sender-local time in milliseconds since the UNIX epoch.
    /// Only meaningful for ordering messages from the same sender.
    pub timestamp: u64,
    pub body: MessageBody,
}

impl Message {
    /// Stamp a body with our identity and the current time
    pub fn new(device_id: PeerIdentity, body: MessageBody) -> Self {
        Self {
            device_id,
            timestamp: current_time_ms(),
            body,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }
}

/// Get current time in milliseconds since UNIX epoch
pub fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracks_compare_by_id() {
        let a = TrackInfo {
            id: "abc".to_string(),
            title: "Song".to_string(),
            artist: "Artist".to_string(),
            album: None,
            thumbnail_url: None,
            duration_ms: 1000,
        };
        let mut b = a.clone();
        b.title = "Song (Remastered)".to_string();
        assert_eq!(a, b);

        b.id = "xyz".to_string();
        assert_ne!(a, b);
    }

    #[test]
    fn test_idle_state() {
        assert!(PlaybackState::idle().is_idle());
    }

    #[test]
    fn test_watch_capabilities_are_a_subset() {
        let watch = DeviceType::Watch.default_capabilities();
        assert!(watch.is_subset(&Capability::all()));
        assert!(watch.contains(&Capability::PlaybackControl));
        assert_eq!(DeviceType::Phone.default_capabilities(), Capability::all());
    }
}
