//! Connection Registry
//!
//! Owns every live `PeerConnection`. The map lives inside a single actor task;
//! the accept path, the connect path and the broadcast path all talk to it
//! through a cloneable `RegistryHandle`, so none of them contend on a lock.
//!
//! Writes never happen inside the actor. `broadcast` takes a snapshot, writes
//! to every connection concurrently from the caller's task and then asks the
//! actor to drop the ones that failed.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::connection::{ConnectionId, ConnectionState, PeerConnection, WriteError};
use crate::identity::PeerIdentity;
use crate::protocol::{self, EncodeError, Message};

/// Registry key: remote address until the peer has announced itself
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionKey {
    Provisional(SocketAddr),
    Peer(PeerIdentity),
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKey::Provisional(addr) => write!(f, "{} (unidentified)", addr),
            ConnectionKey::Peer(identity) => write!(f, "{}", identity),
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("No connection to {0}")]
    NotConnected(PeerIdentity),

    #[error("Connection {0} is not registered")]
    UnknownConnection(ConnectionId),

    #[error("Failed to send to {identity}: {source}")]
    Write {
        identity: PeerIdentity,
        #[source]
        source: WriteError,
    },

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("Connection registry has shut down")]
    Closed,
}

/// Why a connection left the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalReason {
    /// Read loop ended, or the caller removed it
    Closed(Option<String>),
    /// A send to it failed
    WriteFailed(String),
    /// A newer connection announced the same identity
    Superseded,
    /// The peer never sent its Announce
    HandshakeTimeout,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemovalReason::Closed(None) => write!(f, "connection closed"),
            RemovalReason::Closed(Some(error)) => write!(f, "connection closed: {}", error),
            RemovalReason::WriteFailed(error) => write!(f, "write failed: {}", error),
            RemovalReason::Superseded => write!(f, "superseded by a newer connection"),
            RemovalReason::HandshakeTimeout => write!(f, "no Announce received"),
        }
    }
}

/// Notifications emitted by the registry actor
#[derive(Debug)]
pub enum RegistryEvent {
    Removed {
        connection: PeerConnection,
        reason: RemovalReason,
    },
}

/// Outcome of a broadcast
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: Vec<PeerIdentity>,
    pub failed: Vec<(PeerIdentity, String)>,
}

impl BroadcastReport {
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }
}

enum RegistryCommand {
    Insert {
        connection: PeerConnection,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    Identify {
        id: ConnectionId,
        identity: PeerIdentity,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    Remove {
        id: ConnectionId,
        reason: RemovalReason,
        reply: oneshot::Sender<Option<PeerConnection>>,
    },
    Lookup {
        identity: PeerIdentity,
        reply: oneshot::Sender<Option<PeerConnection>>,
    },
    LookupId {
        id: ConnectionId,
        reply: oneshot::Sender<Option<PeerConnection>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<PeerConnection>>,
    },
    Drain {
        reply: oneshot::Sender<Vec<PeerConnection>>,
    },
}

/// Handle to the running registry actor
#[derive(Clone)]
pub struct RegistryHandle {
    command_tx: mpsc::UnboundedSender<RegistryCommand>,
}

impl RegistryHandle {
    /// Spawn the registry actor. Removals are reported on `events`.
    pub fn spawn(events: mpsc::UnboundedSender<RegistryEvent>) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let registry = ConnectionRegistry {
            connections: HashMap::new(),
            events,
            closed: false,
        };
        tokio::spawn(registry.run(command_rx));

        Self { command_tx }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(command(reply))
            .map_err(|_| RegistryError::Closed)?;
        rx.await.map_err(|_| RegistryError::Closed)
    }

    /// Register a connection under its remote address. Fails with
    /// `Closed` once the registry has been cleared.
    pub async fn insert(&self, connection: PeerConnection) -> Result<(), RegistryError> {
        self.request(|reply| RegistryCommand::Insert { connection, reply })
            .await?
    }

    /// Re-key a connection under the identity it announced. Any older
    /// connection for the same identity is removed and closed.
    pub async fn identify(
        &self,
        id: ConnectionId,
        identity: PeerIdentity,
    ) -> Result<(), RegistryError> {
        self.request(|reply| RegistryCommand::Identify {
            id,
            identity,
            reply,
        })
        .await?
    }

    /// Remove one specific connection and close it
    pub async fn remove_connection(
        &self,
        id: ConnectionId,
        reason: RemovalReason,
    ) -> Option<PeerConnection> {
        self.request(|reply| RegistryCommand::Remove { id, reason, reply })
            .await
            .ok()
            .flatten()
    }

    pub async fn connection_for(&self, identity: &PeerIdentity) -> Option<PeerConnection> {
        let identity = identity.clone();
        self.request(|reply| RegistryCommand::Lookup { identity, reply })
            .await
            .ok()
            .flatten()
    }

    /// Look a connection up by id, identified or not
    pub async fn get(&self, id: ConnectionId) -> Option<PeerConnection> {
        self.request(|reply| RegistryCommand::LookupId { id, reply })
            .await
            .ok()
            .flatten()
    }

    /// Point-in-time copy of every registered connection
    pub async fn connections(&self) -> Vec<PeerConnection> {
        self.request(|reply| RegistryCommand::Snapshot { reply })
            .await
            .unwrap_or_default()
    }

    /// Identities with a completed handshake
    pub async fn identities(&self) -> Vec<PeerIdentity> {
        let mut identities: Vec<PeerIdentity> = self
            .connections()
            .await
            .iter()
            .filter_map(|c| c.identity())
            .collect();
        identities.sort();
        identities
    }

    pub async fn len(&self) -> usize {
        self.connections().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Send to one identified peer. A failed write removes that connection.
    pub async fn send_to(
        &self,
        identity: &PeerIdentity,
        message: &Message,
    ) -> Result<(), RegistryError> {
        let connection = self
            .connection_for(identity)
            .await
            .ok_or_else(|| RegistryError::NotConnected(identity.clone()))?;

        if let Err(e) = connection.send(message).await {
            warn!("Send of {} to {} failed: {}", message.kind(), identity, e);
            self.remove_connection(connection.id(), RemovalReason::WriteFailed(e.to_string()))
                .await;
            return Err(RegistryError::Write {
                identity: identity.clone(),
                source: e,
            });
        }
        Ok(())
    }

    /// Send to every identified peer. Unidentified connections are skipped.
    ///
    /// A failure on one connection removes that connection and does not stop
    /// delivery to the others.
    pub async fn broadcast(&self, message: &Message) -> Result<BroadcastReport, RegistryError> {
        let payload = protocol::encode(message)?;

        let targets: Vec<(PeerIdentity, PeerConnection)> = self
            .connections()
            .await
            .into_iter()
            .filter_map(|c| c.identity().map(|identity| (identity, c)))
            .collect();

        let results = join_all(targets.iter().map(|(_, connection)| {
            let payload = payload.as_str();
            async move { connection.send_payload(payload).await }
        }))
        .await;

        let mut report = BroadcastReport::default();
        for ((identity, connection), result) in targets.into_iter().zip(results) {
            match result {
                Ok(()) => report.delivered.push(identity),
                Err(e) => {
                    warn!("Broadcast of {} to {} failed: {}", message.kind(), identity, e);
                    self.remove_connection(
                        connection.id(),
                        RemovalReason::WriteFailed(e.to_string()),
                    )
                    .await;
                    report.failed.push((identity, e.to_string()));
                }
            }
        }

        debug!(
            "Broadcast {} to {}/{} peers",
            message.kind(),
            report.delivered.len(),
            report.attempted()
        );
        Ok(report)
    }

    /// Remove and close every connection. The registry accepts no new
    /// connections afterwards.
    pub async fn clear(&self) -> usize {
        let drained = self
            .request(|reply| RegistryCommand::Drain { reply })
            .await
            .unwrap_or_default();
        let count = drained.len();
        join_all(drained.iter().map(|c| c.close())).await;
        count
    }
}

/// The registry state, confined to its actor task
struct ConnectionRegistry {
    connections: HashMap<ConnectionKey, PeerConnection>,
    events: mpsc::UnboundedSender<RegistryEvent>,
    /// Set by `Drain`; late handshakes must not repopulate the map
    closed: bool,
}

impl ConnectionRegistry {
    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<RegistryCommand>) {
        while let Some(command) = command_rx.recv().await {
            match command {
                RegistryCommand::Insert { connection, reply } => {
                    let _ = reply.send(self.insert(connection));
                }
                RegistryCommand::Identify {
                    id,
                    identity,
                    reply,
                } => {
                    let _ = reply.send(self.identify(id, identity));
                }
                RegistryCommand::Remove { id, reason, reply } => {
                    let _ = reply.send(self.remove(id, reason));
                }
                RegistryCommand::Lookup { identity, reply } => {
                    let _ = reply.send(
                        self.connections
                            .get(&ConnectionKey::Peer(identity))
                            .cloned(),
                    );
                }
                RegistryCommand::LookupId { id, reply } => {
                    let found = self.connections.values().find(|c| c.id() == id).cloned();
                    let _ = reply.send(found);
                }
                RegistryCommand::Snapshot { reply } => {
                    let _ = reply.send(self.connections.values().cloned().collect());
                }
                RegistryCommand::Drain { reply } => {
                    self.closed = true;
                    let drained = self.connections.drain().map(|(_, c)| c).collect();
                    let _ = reply.send(drained);
                }
            }
        }
        debug!("Connection registry stopped");
    }

    fn insert(&mut self, connection: PeerConnection) -> Result<(), RegistryError> {
        if self.closed {
            debug!("Refusing connection {} after shutdown", connection.id());
            return Err(RegistryError::Closed);
        }
        let key = ConnectionKey::Provisional(connection.remote_addr());
        debug!("Registered connection {} from {}", connection.id(), key);
        if let Some(previous) = self.connections.insert(key, connection) {
            self.evict(previous, RemovalReason::Superseded);
        }
        Ok(())
    }

    fn identify(&mut self, id: ConnectionId, identity: PeerIdentity) -> Result<(), RegistryError> {
        let key = self
            .key_of(id)
            .ok_or(RegistryError::UnknownConnection(id))?;

        if key == ConnectionKey::Peer(identity.clone()) {
            return Ok(());
        }

        let connection = self
            .connections
            .remove(&key)
            .ok_or(RegistryError::UnknownConnection(id))?;
        connection.set_identity(identity.clone());
        connection.set_state(ConnectionState::Active);

        info!(
            "Connection {} from {} identified as {}",
            id,
            connection.remote_addr(),
            identity
        );

        if let Some(previous) = self
            .connections
            .insert(ConnectionKey::Peer(identity.clone()), connection)
        {
            info!(
                "Replacing connection {} for {} with {}",
                previous.id(),
                identity,
                id
            );
            self.evict(previous, RemovalReason::Superseded);
        }
        Ok(())
    }

    fn remove(&mut self, id: ConnectionId, reason: RemovalReason) -> Option<PeerConnection> {
        let key = self.key_of(id)?;
        let connection = self.connections.remove(&key)?;
        debug!("Removed connection {} ({}): {:?}", id, key, reason);
        self.evict(connection.clone(), reason);
        Some(connection)
    }

    fn key_of(&self, id: ConnectionId) -> Option<ConnectionKey> {
        self.connections
            .iter()
            .find(|(_, c)| c.id() == id)
            .map(|(key, _)| key.clone())
    }

    /// Close a connection that has left the map and report it
    fn evict(&self, connection: PeerConnection, reason: RemovalReason) {
        let closing = connection.clone();
        tokio::spawn(async move { closing.close().await });
        let _ = self.events.send(RegistryEvent::Removed { connection, reason });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameReader, MessageBody, PlaybackAction, PlaybackCommand};
    use crate::transport::connection::Direction;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    /// Open a loopback connection; returns our side and the remote stream
    async fn connect_pair(listener: &TcpListener) -> (PeerConnection, TcpStream) {
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (connection, _read_half) =
            PeerConnection::new(client.unwrap(), Direction::Outbound, Duration::from_secs(1))
                .unwrap();
        (connection, accepted.unwrap().0)
    }

    async fn identified(
        registry: &RegistryHandle,
        listener: &TcpListener,
        identity: &str,
    ) -> (PeerConnection, TcpStream) {
        let (connection, remote) = connect_pair(listener).await;
        registry.insert(connection.clone()).await.unwrap();
        registry
            .identify(connection.id(), PeerIdentity::from(identity))
            .await
            .unwrap();
        (connection, remote)
    }

    fn command() -> Message {
        Message::new(
            PeerIdentity::from("dev-local"),
            MessageBody::PlaybackCommand(PlaybackCommand::new(PlaybackAction::Pause)),
        )
    }

    #[tokio::test]
    async fn test_identify_migrates_key() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let registry = RegistryHandle::spawn(events_tx);

        let (connection, _remote) = connect_pair(&listener).await;
        registry.insert(connection.clone()).await.unwrap();
        assert!(registry.identities().await.is_empty());
        assert_eq!(registry.len().await, 1);

        registry
            .identify(connection.id(), PeerIdentity::from("dev-A"))
            .await
            .unwrap();
        assert_eq!(registry.identities().await, vec![PeerIdentity::from("dev-A")]);
        assert_eq!(connection.state(), ConnectionState::Active);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_newer_connection_supersedes_older() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let registry = RegistryHandle::spawn(events_tx);

        let (first, mut first_remote) = identified(&registry, &listener, "dev-A").await;
        let (second, _second_remote) = identified(&registry, &listener, "dev-A").await;

        assert_eq!(registry.len().await, 1);
        let current = registry
            .connection_for(&PeerIdentity::from("dev-A"))
            .await
            .unwrap();
        assert_eq!(current.id(), second.id());

        match events_rx.recv().await {
            Some(RegistryEvent::Removed { connection, reason }) => {
                assert_eq!(connection.id(), first.id());
                assert_eq!(reason, RemovalReason::Superseded);
            }
            None => panic!("registry stopped"),
        }

        // The superseded stream is closed: the remote end sees EOF
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), first_remote.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(first.is_closed());
    }

    #[tokio::test]
    async fn test_broadcast_isolates_failures() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let registry = RegistryHandle::spawn(events_tx);

        let (_a, remote_a) = identified(&registry, &listener, "dev-A").await;
        let (b, _remote_b) = identified(&registry, &listener, "dev-B").await;
        let (_c, remote_c) = identified(&registry, &listener, "dev-C").await;

        b.close().await;

        let report = registry.broadcast(&command()).await.unwrap();
        assert_eq!(report.delivered.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, PeerIdentity::from("dev-B"));

        assert_eq!(
            registry.identities().await,
            vec![PeerIdentity::from("dev-A"), PeerIdentity::from("dev-C")]
        );

        for remote in [remote_a, remote_c] {
            let mut reader = FrameReader::new(remote);
            let payload = reader.read_frame().await.unwrap().unwrap();
            let message = protocol::decode_frame(&payload).unwrap();
            assert_eq!(message.body, command().body);
        }
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let registry = RegistryHandle::spawn(events_tx);

        let err = registry
            .send_to(&PeerIdentity::from("dev-missing"), &command())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_remove_by_stale_id_keeps_replacement() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let registry = RegistryHandle::spawn(events_tx);

        let (first, _r1) = identified(&registry, &listener, "dev-A").await;
        let (_second, _r2) = identified(&registry, &listener, "dev-A").await;

        // The old connection's read loop reporting its end must not evict the new one
        assert!(registry
            .remove_connection(first.id(), RemovalReason::Closed(None))
            .await
            .is_none());
        assert_eq!(registry.identities().await.len(), 1);
    }

    #[tokio::test]
    async fn test_clear_closes_everything() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let registry = RegistryHandle::spawn(events_tx);

        let (a, _ra) = identified(&registry, &listener, "dev-A").await;
        let (unidentified, _ru) = connect_pair(&listener).await;
        registry.insert(unidentified.clone()).await.unwrap();

        assert_eq!(registry.clear().await, 2);
        assert!(registry.is_empty().await);
        assert!(a.is_closed());
        assert!(unidentified.is_closed());
        assert_eq!(registry.clear().await, 0);
    }

    #[tokio::test]
    async fn test_insert_after_clear_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let registry = RegistryHandle::spawn(events_tx);
        registry.clear().await;

        // A handshake that was still running when the engine stopped
        let (late, _remote) = connect_pair(&listener).await;
        let err = registry.insert(late.clone()).await.unwrap_err();
        assert!(matches!(err, RegistryError::Closed));
        assert!(registry.is_empty().await);
    }
}
