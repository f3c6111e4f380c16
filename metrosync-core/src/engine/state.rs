//! Engine-owned observable state
//!
//! Written only by the engine (its event loop, plus the local publish calls);
//! everyone else gets a `watch` or `broadcast` receiver and sees whole
//! snapshots.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot, watch};

use crate::discovery::PeerAnnouncement;
use crate::identity::PeerIdentity;
use crate::protocol::{ConnectionStatus, DeviceType, PlaybackCommand, PlaybackState, QueueSync};
use crate::transport::ConnectionId;

use super::SyncError;

type HandshakeWaiter = oneshot::Sender<Result<PeerIdentity, SyncError>>;

const COMMAND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 64;

/// A playback command received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCommand {
    /// Device that sent it
    pub from: PeerIdentity,
    /// Sender-local send time
    pub timestamp: u64,
    pub command: PlaybackCommand,
}

/// Connection lifecycle and discovery notifications
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    PeerConnected {
        identity: PeerIdentity,
        device_name: String,
        device_type: DeviceType,
    },
    PeerDisconnected {
        identity: PeerIdentity,
        reason: Option<String>,
    },
    /// A peer reported its connection status
    PeerStatus {
        identity: PeerIdentity,
        status: ConnectionStatus,
    },
    /// Our advertisement was registered (`true`) or rejected (`false`)
    Advertised(bool),
    /// The discovery session ended with an error and must be restarted
    DiscoveryFailed(String),
}

pub(crate) struct EngineState {
    discovered: watch::Sender<Vec<PeerAnnouncement>>,
    playback: watch::Sender<Option<PlaybackState>>,
    queue: watch::Sender<Option<QueueSync>>,
    commands: broadcast::Sender<InboundCommand>,
    events: broadcast::Sender<SyncEvent>,
    /// `connect_to` calls waiting for the remote Announce
    handshakes: Mutex<HashMap<ConnectionId, HandshakeWaiter>>,
}

impl EngineState {
    pub fn new() -> Self {
        let (discovered, _) = watch::channel(Vec::new());
        let (playback, _) = watch::channel(None);
        let (queue, _) = watch::channel(None);
        let (commands, _) = broadcast::channel(COMMAND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            discovered,
            playback,
            queue,
            commands,
            events,
            handshakes: Mutex::new(HashMap::new()),
        }
    }

    pub fn discovered(&self) -> watch::Receiver<Vec<PeerAnnouncement>> {
        self.discovered.subscribe()
    }

    pub fn playback(&self) -> watch::Receiver<Option<PlaybackState>> {
        self.playback.subscribe()
    }

    pub fn queue(&self) -> watch::Receiver<Option<QueueSync>> {
        self.queue.subscribe()
    }

    pub fn commands(&self) -> broadcast::Receiver<InboundCommand> {
        self.commands.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Insert a peer, or fold the announcement into the existing entry.
    /// The list stays sorted by identity with one entry per identity.
    pub fn upsert_peer(&self, peer: PeerAnnouncement) {
        self.discovered.send_if_modified(|peers| {
            match peers.binary_search_by(|p| p.identity.cmp(&peer.identity)) {
                Ok(index) => {
                    let before = peers[index].clone();
                    peers[index].merge(peer);
                    peers[index] != before
                }
                Err(index) => {
                    peers.insert(index, peer);
                    true
                }
            }
        });
    }

    pub fn remove_peer(&self, identity: &PeerIdentity) {
        self.discovered.send_if_modified(|peers| {
            let before = peers.len();
            peers.retain(|p| &p.identity != identity);
            peers.len() != before
        });
    }

    /// Keep only the peers for which `keep` returns true
    pub fn retain_peers(&self, keep: impl Fn(&PeerAnnouncement) -> bool) {
        self.discovered.send_if_modified(|peers| {
            let before = peers.len();
            peers.retain(|p| keep(p));
            peers.len() != before
        });
    }

    pub fn set_playback(&self, state: PlaybackState) {
        self.playback.send_replace(Some(state));
    }

    pub fn set_queue(&self, queue: QueueSync) {
        self.queue.send_replace(Some(queue));
    }

    pub fn emit_command(&self, command: InboundCommand) {
        // No subscribers is fine
        let _ = self.commands.send(command);
    }

    pub fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    pub fn await_handshake(
        &self,
        id: ConnectionId,
    ) -> oneshot::Receiver<Result<PeerIdentity, SyncError>> {
        let (tx, rx) = oneshot::channel();
        self.handshakes.lock().insert(id, tx);
        rx
    }

    pub fn complete_handshake(&self, id: ConnectionId, identity: &PeerIdentity) {
        if let Some(tx) = self.handshakes.lock().remove(&id) {
            let _ = tx.send(Ok(identity.clone()));
        }
    }

    pub fn fail_handshake(&self, id: ConnectionId, error: impl FnOnce() -> SyncError) {
        if let Some(tx) = self.handshakes.lock().remove(&id) {
            let _ = tx.send(Err(error()));
        }
    }

    pub fn abandon_handshake(&self, id: ConnectionId) {
        self.handshakes.lock().remove(&id);
    }

    /// Forget everything tied to a running session. Playback state and queue
    /// survive a restart.
    pub fn reset_session(&self) {
        self.discovered.send_replace(Vec::new());
        self.handshakes.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Capability;

    fn peer(id: &str, name: &str) -> PeerAnnouncement {
        PeerAnnouncement::new(PeerIdentity::from(id), name)
    }

    #[test]
    fn test_peers_are_deduplicated_and_sorted() {
        let state = EngineState::new();
        let peers = state.discovered();

        state.upsert_peer(peer("dev-C", "Watch"));
        state.upsert_peer(peer("dev-B", "Tablet"));
        state.upsert_peer(peer("dev-C", "Watch"));

        let listed: Vec<String> = peers
            .borrow()
            .iter()
            .map(|p| p.identity.to_string())
            .collect();
        assert_eq!(listed, vec!["dev-B", "dev-C"]);
    }

    #[test]
    fn test_unchanged_announcement_does_not_notify() {
        let state = EngineState::new();
        let mut peers = state.discovered();

        state.upsert_peer(peer("dev-B", "Tablet"));
        assert!(peers.has_changed().unwrap());
        let _ = peers.borrow_and_update();

        state.upsert_peer(peer("dev-B", "Tablet"));
        assert!(!peers.has_changed().unwrap());

        let mut richer = peer("dev-B", "Tablet");
        richer.capabilities.insert(Capability::QueueManagement);
        state.upsert_peer(richer);
        assert!(peers.has_changed().unwrap());
    }

    #[test]
    fn test_remove_and_reset() {
        let state = EngineState::new();
        state.upsert_peer(peer("dev-B", "Tablet"));
        state.upsert_peer(peer("dev-C", "Watch"));

        state.remove_peer(&PeerIdentity::from("dev-B"));
        assert_eq!(state.discovered().borrow().len(), 1);

        state.reset_session();
        assert!(state.discovered().borrow().is_empty());
    }
}
