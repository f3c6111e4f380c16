//! Direct peer-to-peer discovery
//!
//! Group formation and peer enumeration are platform services (Wi-Fi Direct
//! and friends). The platform layer pushes what it sees into a
//! [`DirectPeerFeed`]; the backend turns successive peer lists into found/lost
//! events.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Advertisement, DiscoveryEvent, PeerAnnouncement, StreamSenders};
use crate::identity::PeerIdentity;

/// Group formation status as reported by the platform
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GroupState {
    #[default]
    Pending,
    Formed,
    Failed(String),
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    group: GroupState,
    peers: Vec<PeerAnnouncement>,
}

struct FeedInner {
    snapshot: watch::Sender<Snapshot>,
    advertisement: Mutex<Option<Advertisement>>,
}

/// Handle the platform layer uses to report direct-mode peers
#[derive(Clone)]
pub struct DirectPeerFeed {
    inner: Arc<FeedInner>,
}

impl Default for DirectPeerFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectPeerFeed {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(Snapshot::default());
        Self {
            inner: Arc::new(FeedInner {
                snapshot,
                advertisement: Mutex::new(None),
            }),
        }
    }

    /// Replace the list of currently visible peers
    pub fn update_peers(&self, peers: Vec<PeerAnnouncement>) {
        self.inner.snapshot.send_modify(|s| s.peers = peers);
    }

    pub fn group_formed(&self) {
        self.inner.snapshot.send_modify(|s| s.group = GroupState::Formed);
    }

    /// Group formation failed. Ends the running discovery session.
    pub fn group_failed(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.inner
            .snapshot
            .send_modify(|s| s.group = GroupState::Failed(reason));
    }

    pub fn group_state(&self) -> GroupState {
        self.inner.snapshot.borrow().group.clone()
    }

    /// What the platform should publish for us, while direct mode runs
    pub fn advertisement(&self) -> Option<Advertisement> {
        self.inner.advertisement.lock().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.inner.snapshot.subscribe()
    }

    fn set_advertisement(&self, advertisement: Option<Advertisement>) {
        *self.inner.advertisement.lock() = advertisement;
    }
}

/// Running direct-mode backend
pub(super) struct DirectDiscovery {
    feed: DirectPeerFeed,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl DirectDiscovery {
    pub(super) fn start(
        feed: &DirectPeerFeed,
        advertisement: &Advertisement,
        senders: StreamSenders,
    ) -> Self {
        // A new session asks the platform to form a fresh group
        feed.inner
            .snapshot
            .send_modify(|s| s.group = GroupState::Pending);
        feed.set_advertisement(Some(advertisement.clone()));

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run(
            feed.clone(),
            advertisement.identity.clone(),
            senders,
            shutdown_rx,
        ));

        Self {
            feed: feed.clone(),
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    /// False once the session has ended on its own, e.g. after a failed group
    pub(super) fn is_live(&self) -> bool {
        self.feed.advertisement().is_some()
    }

    pub(super) async fn stop(mut self) {
        self.feed.set_advertisement(None);
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.task.await {
            debug!("Direct discovery task ended abnormally: {}", e);
        }
    }
}

async fn run(
    feed: DirectPeerFeed,
    local: PeerIdentity,
    senders: StreamSenders,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut snapshots = feed.subscribe();
    let mut known: BTreeMap<PeerIdentity, PeerAnnouncement> = BTreeMap::new();
    let mut registered = false;

    // Whatever the platform already reported counts as the first change
    snapshots.mark_changed();

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();

                match snapshot.group {
                    GroupState::Pending => {}
                    GroupState::Formed => {
                        if !registered {
                            info!("Direct group formed");
                            registered = true;
                            let _ = senders.registrations.send(true);
                        }
                    }
                    GroupState::Failed(reason) => {
                        warn!("Direct group formation failed: {}", reason);
                        // Nobody should dial a session that is gone
                        feed.set_advertisement(None);
                        let _ = senders.registrations.send(false);
                        let _ = senders.events.send(DiscoveryEvent::Failed(reason));
                        break;
                    }
                }

                let (found, lost) = diff(&known, &snapshot.peers, &local);
                for identity in lost {
                    debug!("Direct peer gone: {}", identity);
                    known.remove(&identity);
                    let _ = senders.events.send(DiscoveryEvent::PeerLost(identity));
                }
                for peer in found {
                    debug!("Direct peer visible: {} ({})", peer.identity, peer.display_name);
                    known.insert(peer.identity.clone(), peer.clone());
                    let _ = senders.events.send(DiscoveryEvent::PeerFound(peer));
                }
            }
        }
    }
}

/// Compare the previous peer set with the latest list. Returns peers that are
/// new or changed, and identities that are no longer listed.
fn diff(
    known: &BTreeMap<PeerIdentity, PeerAnnouncement>,
    current: &[PeerAnnouncement],
    local: &PeerIdentity,
) -> (Vec<PeerAnnouncement>, Vec<PeerIdentity>) {
    let mut latest: BTreeMap<&PeerIdentity, &PeerAnnouncement> = BTreeMap::new();
    for peer in current.iter().filter(|p| &p.identity != local) {
        latest.insert(&peer.identity, peer);
    }

    let found = latest
        .values()
        .copied()
        .filter(|peer| known.get(&peer.identity) != Some(*peer))
        .cloned()
        .collect();

    let lost = known
        .keys()
        .filter(|identity| !latest.contains_key(identity))
        .cloned()
        .collect();

    (found, lost)
}
