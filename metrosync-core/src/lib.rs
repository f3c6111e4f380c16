//! MetroSync - Core Library
//!
//! Keeps playback state and remote commands in sync between a phone, a
//! tablet and a watch. Peers find each other through mDNS or a platform
//! peer-to-peer service and talk over plain TCP with length-prefixed JSON
//! messages.

pub mod discovery;
pub mod engine;
pub mod ffi;
pub mod identity;
pub mod logging;
pub mod protocol;
pub mod transport;

// Re-exports for convenience
pub use discovery::{DirectPeerFeed, DiscoveryMode, PeerAnnouncement};
pub use engine::{InboundCommand, SyncConfig, SyncEngine, SyncError, SyncEvent};
pub use identity::{IdentityStore, PeerIdentity};
pub use protocol::{Message, MessageBody, PlaybackCommand, PlaybackState};

// Setup uniffi scaffolding
uniffi::setup_scaffolding!();
