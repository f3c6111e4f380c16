//! Peer Discovery
//!
//! Two interchangeable backends sit behind one adapter:
//! - `LocalNetwork`: mDNS browse/advertise over libp2p
//! - `Direct`: device-to-device groups whose peer list is pushed in by the
//!   platform through a [`DirectPeerFeed`]
//!
//! Only one backend runs at a time. Switching modes stops the running backend
//! and waits for its task to finish before the next one starts, so a stale
//! advertisement never outlives its mode.

mod direct;
mod lan;

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

use crate::identity::PeerIdentity;
use crate::protocol::{Capability, DeviceType};

pub use direct::{DirectPeerFeed, GroupState};

use direct::DirectDiscovery;
use lan::LanDiscovery;

/// Which discovery backend to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryMode {
    #[default]
    LocalNetwork,
    Direct,
    Disabled,
}

impl fmt::Display for DiscoveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryMode::LocalNetwork => write!(f, "local network"),
            DiscoveryMode::Direct => write!(f, "direct"),
            DiscoveryMode::Disabled => write!(f, "disabled"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Failed to start discovery: {0}")]
    Start(String),

    #[error("Discovery transport error: {0}")]
    Transport(String),
}

/// What we publish about ourselves
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub identity: PeerIdentity,
    pub name: String,
    /// Port of our peer listener
    pub port: u16,
}

/// A peer seen by discovery or through a completed handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAnnouncement {
    pub identity: PeerIdentity,
    pub display_name: String,
    /// Known once the peer has sent its Announce
    pub device_type: Option<DeviceType>,
    pub capabilities: BTreeSet<Capability>,
    /// Connectable address, when discovery resolved one
    pub address: Option<SocketAddr>,
}

impl PeerAnnouncement {
    pub fn new(identity: PeerIdentity, display_name: impl Into<String>) -> Self {
        Self {
            identity,
            display_name: display_name.into(),
            device_type: None,
            capabilities: BTreeSet::new(),
            address: None,
        }
    }

    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    /// Fold a newer sighting of the same peer into this one. Fields the
    /// newer one does not know keep their current value.
    pub fn merge(&mut self, newer: PeerAnnouncement) {
        self.display_name = newer.display_name;
        if newer.device_type.is_some() {
            self.device_type = newer.device_type;
        }
        if !newer.capabilities.is_empty() {
            self.capabilities = newer.capabilities;
        }
        if newer.address.is_some() {
            self.address = newer.address;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    PeerFound(PeerAnnouncement),
    PeerLost(PeerIdentity),
    /// The session ended with an error. Nothing more follows; the caller
    /// decides whether to start again.
    Failed(String),
}

/// Output of one discovery session. Both channels close when the backend
/// stops.
pub struct DiscoveryStreams {
    /// Outcome of advertising ourselves; `true` once registered
    pub registrations: mpsc::UnboundedReceiver<bool>,
    pub events: mpsc::UnboundedReceiver<DiscoveryEvent>,
}

impl DiscoveryStreams {
    fn channel() -> (StreamSenders, Self) {
        let (registrations_tx, registrations) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        (
            StreamSenders {
                registrations: registrations_tx,
                events: events_tx,
            },
            Self {
                registrations,
                events,
            },
        )
    }

    /// Streams that are already closed, for when discovery is disabled
    fn closed() -> Self {
        Self::channel().1
    }
}

/// Backend side of [`DiscoveryStreams`]
struct StreamSenders {
    registrations: mpsc::UnboundedSender<bool>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
}

enum ActiveDiscovery {
    LocalNetwork(LanDiscovery),
    Direct(DirectDiscovery),
}

impl ActiveDiscovery {
    fn mode(&self) -> DiscoveryMode {
        match self {
            ActiveDiscovery::LocalNetwork(_) => DiscoveryMode::LocalNetwork,
            ActiveDiscovery::Direct(_) => DiscoveryMode::Direct,
        }
    }

    fn is_live(&self) -> bool {
        match self {
            ActiveDiscovery::LocalNetwork(_) => true,
            ActiveDiscovery::Direct(direct) => direct.is_live(),
        }
    }

    async fn stop(self) {
        match self {
            ActiveDiscovery::LocalNetwork(lan) => lan.stop().await,
            ActiveDiscovery::Direct(direct) => direct.stop().await,
        }
    }
}

/// Runs at most one discovery backend
pub struct DiscoveryAdapter {
    direct_feed: DirectPeerFeed,
    active: Option<ActiveDiscovery>,
}

impl DiscoveryAdapter {
    pub fn new(direct_feed: DirectPeerFeed) -> Self {
        Self {
            direct_feed,
            active: None,
        }
    }

    /// Mode of the running backend, `Disabled` when none is running or the
    /// session has ended on its own
    pub fn mode(&self) -> DiscoveryMode {
        self.active
            .as_ref()
            .filter(|active| active.is_live())
            .map(ActiveDiscovery::mode)
            .unwrap_or(DiscoveryMode::Disabled)
    }

    /// Advertise ourselves and browse for peers in `mode`.
    ///
    /// A backend that is already running is stopped first.
    pub async fn start(
        &mut self,
        mode: DiscoveryMode,
        advertisement: &Advertisement,
    ) -> Result<DiscoveryStreams, DiscoveryError> {
        self.stop().await;

        let (senders, streams) = DiscoveryStreams::channel();
        self.active = match mode {
            DiscoveryMode::LocalNetwork => Some(ActiveDiscovery::LocalNetwork(
                LanDiscovery::start(advertisement, senders)?,
            )),
            DiscoveryMode::Direct => Some(ActiveDiscovery::Direct(DirectDiscovery::start(
                &self.direct_feed,
                advertisement,
                senders,
            ))),
            DiscoveryMode::Disabled => {
                info!("Discovery disabled");
                return Ok(DiscoveryStreams::closed());
            }
        };

        info!("Discovery started in {} mode", mode);
        Ok(streams)
    }

    /// Stop the running backend, then start `mode`
    pub async fn switch_mode(
        &mut self,
        mode: DiscoveryMode,
        advertisement: &Advertisement,
    ) -> Result<DiscoveryStreams, DiscoveryError> {
        info!("Switching discovery from {} to {}", self.mode(), mode);
        self.start(mode, advertisement).await
    }

    /// Stop the running backend and wait for it to tear down
    pub async fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            let mode = active.mode();
            active.stop().await;
            info!("Discovery stopped ({} mode)", mode);
        }
    }
}
