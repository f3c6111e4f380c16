//! Two or more engines talking over loopback TCP. Discovery is disabled
//! except where the direct-mode feed stands in for the platform.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrosync_core::discovery::{DiscoveryMode, PeerAnnouncement};
use metrosync_core::engine::{SyncConfig, SyncEngine, SyncError, SyncEvent};
use metrosync_core::identity::PeerIdentity;
use metrosync_core::protocol::{
    self, Announce, DeviceType, FrameReader, FrameWriter, Message, MessageBody, PlaybackAction,
    PlaybackCommand, PlaybackState, TrackInfo,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(3);

fn engine(id: &str) -> SyncEngine {
    let config = SyncConfig::new(format!("Device {}", id), DeviceType::Tablet)
        .with_listen_addr("127.0.0.1:0".parse().unwrap())
        .with_discovery_mode(DiscoveryMode::Disabled)
        .with_timeouts(
            Duration::from_secs(1),
            Duration::from_millis(500),
            Duration::from_secs(1),
        );
    SyncEngine::new(config, PeerIdentity::from(id))
}

/// An engine fed by its direct-mode peer feed
fn direct_engine(id: &str, auto_connect: bool) -> SyncEngine {
    let config = SyncConfig::new(format!("Device {}", id), DeviceType::Phone)
        .with_listen_addr("127.0.0.1:0".parse().unwrap())
        .with_discovery_mode(DiscoveryMode::Direct)
        .with_auto_connect(auto_connect)
        .with_timeouts(
            Duration::from_secs(1),
            Duration::from_millis(500),
            Duration::from_secs(1),
        );
    SyncEngine::new(config, PeerIdentity::from(id))
}

fn reachable(id: &str, addr: SocketAddr) -> PeerAnnouncement {
    PeerAnnouncement::new(PeerIdentity::from(id), format!("Device {}", id)).with_address(addr)
}

/// Wait until the discovered list holds exactly `expected`
async fn wait_listed(engine: &SyncEngine, expected: &[&str]) {
    let expected: Vec<PeerIdentity> = expected.iter().map(|id| PeerIdentity::from(*id)).collect();
    let mut peers = engine.discovered_peers();
    timeout(
        WAIT,
        peers.wait_for(|peers| {
            peers.iter().map(|p| p.identity.clone()).collect::<Vec<_>>() == expected
        }),
    )
    .await
    .expect("discovered peers never matched")
    .unwrap();
}

async fn wait_connected(engine: &SyncEngine, identity: &PeerIdentity) {
    timeout(WAIT, async {
        while !engine.connected_peers().await.contains(identity) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("peer never connected");
}

/// Connect `a` to `b` and wait until both sides see each other
async fn pair(a: &SyncEngine, b: &SyncEngine, b_addr: SocketAddr) {
    let announced = a.connect_to("127.0.0.1", b_addr.port()).await.unwrap();
    assert_eq!(&announced, b.local_identity());
    wait_connected(b, a.local_identity()).await;
}

/// A hand-driven peer speaking the wire protocol directly
struct RawPeer {
    reader: FrameReader<tokio::net::tcp::OwnedReadHalf>,
    writer: FrameWriter<tokio::net::tcp::OwnedWriteHalf>,
}

impl RawPeer {
    async fn connect(addr: SocketAddr) -> Self {
        let (read, write) = TcpStream::connect(addr).await.unwrap().into_split();
        Self {
            reader: FrameReader::new(read),
            writer: FrameWriter::new(write),
        }
    }

    async fn send(&mut self, id: &str, body: MessageBody) {
        let payload = protocol::encode(&Message::new(PeerIdentity::from(id), body)).unwrap();
        self.writer.write_frame(&payload).await.unwrap();
    }

    async fn announce(&mut self, id: &str) {
        self.send(
            id,
            MessageBody::Announce(Announce {
                device_name: "Raw".to_string(),
                device_type: DeviceType::Other,
                capabilities: Default::default(),
            }),
        )
        .await;
    }

    async fn next(&mut self) -> Option<Message> {
        let frame = timeout(WAIT, self.reader.read_frame())
            .await
            .expect("no frame in time")
            .ok()??;
        protocol::decode_frame(&frame).ok()
    }
}

fn playing(position_ms: u64) -> PlaybackState {
    PlaybackState {
        is_playing: true,
        position_ms,
        duration_ms: 215_000,
        current_track: Some(TrackInfo {
            id: "dQw4w9WgXcQ".to_string(),
            title: "Never Gonna Give You Up".to_string(),
            artist: "Rick Astley".to_string(),
            album: None,
            thumbnail_url: None,
            duration_ms: 215_000,
        }),
        ..PlaybackState::idle()
    }
}

#[tokio::test]
async fn test_published_state_reaches_peer() {
    let a = engine("dev-A");
    let b = engine("dev-B");
    a.start().await.unwrap();
    let b_addr = b.start().await.unwrap();
    pair(&a, &b, b_addr).await;

    let mut on_b = b.current_playback_state();
    let state = playing(42_000);
    let report = a.publish_local_state(state.clone()).await.unwrap();
    assert_eq!(report.delivered, vec![PeerIdentity::from("dev-B")]);
    assert!(report.failed.is_empty());

    timeout(WAIT, on_b.wait_for(|s| s.as_ref() == Some(&state)))
        .await
        .unwrap()
        .unwrap();

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_command_carries_sender_identity() {
    let a = engine("dev-A");
    let b = engine("dev-B");
    a.start().await.unwrap();
    let b_addr = b.start().await.unwrap();
    pair(&a, &b, b_addr).await;

    let mut commands = a.inbound_commands();
    b.send_command(
        &PeerIdentity::from("dev-A"),
        PlaybackCommand::new(PlaybackAction::Next),
    )
    .await
    .unwrap();

    let received = timeout(WAIT, commands.recv()).await.unwrap().unwrap();
    assert_eq!(received.from, PeerIdentity::from("dev-B"));
    assert_eq!(received.command.action, PlaybackAction::Next);

    // Commands are surfaced, never applied to our own state
    assert_eq!(*a.current_playback_state().borrow(), None);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_queue_sync_reaches_peer() {
    let a = engine("dev-A");
    let b = engine("dev-B");
    a.start().await.unwrap();
    let b_addr = b.start().await.unwrap();
    pair(&a, &b, b_addr).await;

    let mut queue = b.current_queue();
    let tracks = playing(0).current_track.into_iter().collect::<Vec<_>>();
    a.publish_queue(tracks.clone(), 0).await.unwrap();

    let received = timeout(WAIT, queue.wait_for(Option::is_some))
        .await
        .unwrap()
        .unwrap()
        .clone()
        .unwrap();
    assert_eq!(received.queue, tracks);
    assert_eq!(received.current_index, 0);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_second_announce_supersedes_first() {
    let a = engine("dev-A");
    let addr = a.start().await.unwrap();

    let mut first = RawPeer::connect(addr).await;
    first.announce("dev-X").await;
    wait_connected(&a, &PeerIdentity::from("dev-X")).await;

    let mut second = RawPeer::connect(addr).await;
    second.announce("dev-X").await;

    // The engine's own Announce, then the superseded socket is closed
    assert!(matches!(
        first.next().await.map(|m| m.body),
        Some(MessageBody::Announce(_))
    ));
    assert!(first.next().await.is_none());

    assert_eq!(a.connected_peers().await, vec![PeerIdentity::from("dev-X")]);
    assert_eq!(a.discovered_peers().borrow().len(), 1);

    a.stop().await;
}

#[tokio::test]
async fn test_messages_before_announce_are_dropped() {
    let a = engine("dev-A");
    let addr = a.start().await.unwrap();
    let mut playback = a.current_playback_state();

    let mut raw = RawPeer::connect(addr).await;
    raw.send("dev-X", MessageBody::PlaybackState(playing(1_000)))
        .await;
    raw.announce("dev-X").await;
    raw.send("dev-X", MessageBody::PlaybackState(playing(2_000)))
        .await;

    let state = timeout(WAIT, playback.wait_for(Option::is_some))
        .await
        .unwrap()
        .unwrap()
        .clone()
        .unwrap();
    assert_eq!(state.position_ms, 2_000);

    a.stop().await;
}

#[tokio::test]
async fn test_connect_to_refused_port() {
    let a = engine("dev-A");
    a.start().await.unwrap();

    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = unused.local_addr().unwrap().port();
    drop(unused);

    let result = a.connect_to("127.0.0.1", port).await;
    assert!(matches!(result, Err(SyncError::Connect { .. })), "{:?}", result);
    a.stop().await;
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let a = engine("dev-A");
    a.start().await.unwrap();

    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = silent.local_addr().unwrap().port();
    let _hold = tokio::spawn(async move {
        let (stream, _) = silent.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(stream);
    });

    let result = a.connect_to("127.0.0.1", port).await;
    assert!(
        matches!(result, Err(SyncError::HandshakeTimeout(_))),
        "{:?}",
        result
    );
    assert!(a.connected_peers().await.is_empty());
    a.stop().await;
}

#[tokio::test]
async fn test_connecting_to_self_fails() {
    let a = engine("dev-A");
    let addr = a.start().await.unwrap();

    let result = a.connect_to("127.0.0.1", addr.port()).await;
    assert!(result.is_err());
    assert!(a.connected_peers().await.is_empty());
    assert!(a.discovered_peers().borrow().is_empty());
    a.stop().await;
}

#[tokio::test]
async fn test_stop_notifies_peer_and_is_idempotent() {
    let a = engine("dev-A");
    let b = engine("dev-B");
    a.start().await.unwrap();
    let b_addr = b.start().await.unwrap();
    let mut events = b.events();
    pair(&a, &b, b_addr).await;

    a.stop().await;
    a.stop().await;
    assert!(!a.is_running().await);

    let disconnected = timeout(WAIT, async {
        loop {
            if let Ok(SyncEvent::PeerDisconnected { identity, .. }) = events.recv().await {
                break identity;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(disconnected, PeerIdentity::from("dev-A"));
    assert!(b.connected_peers().await.is_empty());

    // A stopped engine can start again
    a.start().await.unwrap();
    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_disconnect_one_peer() {
    let a = engine("dev-A");
    let b = engine("dev-B");
    let c = engine("dev-C");
    a.start().await.unwrap();
    let b_addr = b.start().await.unwrap();
    let c_addr = c.start().await.unwrap();
    pair(&a, &b, b_addr).await;
    pair(&a, &c, c_addr).await;

    assert_eq!(
        a.connected_peers().await,
        vec![PeerIdentity::from("dev-B"), PeerIdentity::from("dev-C")]
    );

    a.disconnect(&PeerIdentity::from("dev-B")).await.unwrap();
    assert_eq!(a.connected_peers().await, vec![PeerIdentity::from("dev-C")]);

    let report = a.publish_local_state(playing(5_000)).await.unwrap();
    assert_eq!(report.delivered, vec![PeerIdentity::from("dev-C")]);

    a.stop().await;
    b.stop().await;
    c.stop().await;
}

#[tokio::test]
async fn test_discovered_peer_is_dialed_by_lower_identity() {
    let a = direct_engine("dev-A", true);
    let b = direct_engine("dev-B", true);
    a.start().await.unwrap();
    let b_addr = b.start().await.unwrap();

    a.direct_feed().update_peers(vec![reachable("dev-B", b_addr)]);

    wait_connected(&a, &PeerIdentity::from("dev-B")).await;
    wait_connected(&b, &PeerIdentity::from("dev-A")).await;
    wait_listed(&b, &["dev-A"]).await;

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_higher_identity_waits_to_be_dialed() {
    let a = direct_engine("dev-A", true);
    let b = direct_engine("dev-B", true);
    let a_addr = a.start().await.unwrap();
    let b_addr = b.start().await.unwrap();

    b.direct_feed().update_peers(vec![reachable("dev-A", a_addr)]);
    wait_listed(&b, &["dev-A"]).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(b.connected_peers().await.is_empty());
    assert!(a.connected_peers().await.is_empty());

    // Once the lower side sees it, exactly one connection forms
    a.direct_feed().update_peers(vec![reachable("dev-B", b_addr)]);
    wait_connected(&b, &PeerIdentity::from("dev-A")).await;
    assert_eq!(a.connected_peers().await, vec![PeerIdentity::from("dev-B")]);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_repeated_discovery_dials_once() {
    let a = direct_engine("dev-A", true);
    a.start().await.unwrap();

    // Accepts and holds connections without ever announcing
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    let _hold = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = silent.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            held.push(stream);
        }
    });

    // Each rename is a fresh PeerFound while the first dial is still waiting
    for name in ["Watch", "Pixel Watch", "Wrist"] {
        let mut peer = reachable("dev-Z", silent_addr);
        peer.display_name = name.to_string();
        a.direct_feed().update_peers(vec![peer]);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    a.stop().await;
}

#[tokio::test]
async fn test_lost_peer_stays_listed_while_connected() {
    let a = direct_engine("dev-A", true);
    let b = direct_engine("dev-B", true);
    a.start().await.unwrap();
    let b_addr = b.start().await.unwrap();

    a.direct_feed().update_peers(vec![reachable("dev-B", b_addr)]);
    wait_connected(&a, &PeerIdentity::from("dev-B")).await;

    // dev-B drops out of the feed, dev-C appears without an address
    a.direct_feed()
        .update_peers(vec![PeerAnnouncement::new(PeerIdentity::from("dev-C"), "Tablet")]);
    wait_listed(&a, &["dev-B", "dev-C"]).await;

    // Unconnected peers do leave the list
    a.direct_feed().update_peers(Vec::new());
    wait_listed(&a, &["dev-B"]).await;
    assert_eq!(a.connected_peers().await, vec![PeerIdentity::from("dev-B")]);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_switching_mode_prunes_unconnected_peers() {
    let a = direct_engine("dev-A", true);
    let b = direct_engine("dev-B", true);
    a.start().await.unwrap();
    let b_addr = b.start().await.unwrap();

    a.direct_feed().update_peers(vec![
        reachable("dev-B", b_addr),
        PeerAnnouncement::new(PeerIdentity::from("dev-C"), "Tablet"),
    ]);
    wait_connected(&a, &PeerIdentity::from("dev-B")).await;
    wait_listed(&a, &["dev-B", "dev-C"]).await;

    a.switch_discovery_mode(DiscoveryMode::Disabled)
        .await
        .unwrap();
    wait_listed(&a, &["dev-B"]).await;
    assert_eq!(a.direct_feed().advertisement(), None);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_auto_connect_off_only_lists_peers() {
    let a = direct_engine("dev-A", false);
    let b = direct_engine("dev-B", true);
    a.start().await.unwrap();
    let b_addr = b.start().await.unwrap();

    a.direct_feed().update_peers(vec![reachable("dev-B", b_addr)]);
    wait_listed(&a, &["dev-B"]).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(a.connected_peers().await.is_empty());
    assert!(b.connected_peers().await.is_empty());

    a.stop().await;
    b.stop().await;
}
