//! Announce handshake
//!
//! Both directions follow the same steps: register the connection under its
//! remote address, start the read loop, then send our `Announce`. The peer's
//! `Announce` arrives through the read loop and is handled by the engine,
//! which migrates the registry key to the announced identity.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::connection::{ConnectionEvent, ConnectionId, Direction, PeerConnection, WriteError};
use super::registry::{RegistryError, RegistryHandle, RemovalReason};
use crate::identity::PeerIdentity;
use crate::protocol::{Announce, Message, MessageBody};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connecting to {addr} timed out after {after:?}")]
    ConnectTimeout { addr: String, after: Duration },

    #[error("Socket setup failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Failed to send Announce: {0}")]
    Announce(#[source] WriteError),
}

/// Open a TCP connection to `host:port`, giving up after `timeout`
pub async fn dial(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, HandshakeError> {
    let addr = format!("{}:{}", host, port);
    debug!("Dialing {}", addr);

    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(HandshakeError::Connect { addr, source }),
        Err(_) => Err(HandshakeError::ConnectTimeout {
            addr,
            after: timeout,
        }),
    }
}

/// A registered connection whose read loop has not started yet
pub struct PendingConnection {
    connection: PeerConnection,
    read_half: OwnedReadHalf,
}

impl PendingConnection {
    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }
}

struct Settings {
    identity: PeerIdentity,
    announce: Announce,
    write_timeout: Duration,
    handshake_timeout: Duration,
    max_frame_len: usize,
}

/// Everything needed to bring a fresh stream into the registry
#[derive(Clone)]
pub struct Handshake {
    registry: RegistryHandle,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    settings: Arc<Settings>,
}

impl Handshake {
    pub fn new(
        registry: RegistryHandle,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        identity: PeerIdentity,
        announce: Announce,
    ) -> Self {
        Self {
            registry,
            events,
            settings: Arc::new(Settings {
                identity,
                announce,
                write_timeout: Duration::from_secs(5),
                handshake_timeout: Duration::from_secs(5),
                max_frame_len: crate::protocol::DEFAULT_MAX_FRAME_LEN,
            }),
        }
    }

    /// Override the write timeout, handshake timeout and frame limit
    pub fn with_limits(
        mut self,
        write_timeout: Duration,
        handshake_timeout: Duration,
        max_frame_len: usize,
    ) -> Self {
        let current = &self.settings;
        self.settings = Arc::new(Settings {
            identity: current.identity.clone(),
            announce: current.announce.clone(),
            write_timeout,
            handshake_timeout,
            max_frame_len,
        });
        self
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    /// Register and announce in one step
    pub async fn attach(
        &self,
        stream: TcpStream,
        direction: Direction,
    ) -> Result<PeerConnection, HandshakeError> {
        let pending = self.register(stream, direction).await?;
        self.begin(pending).await
    }

    /// Wrap the stream and register it under its remote address.
    ///
    /// Nothing is read from the stream until [`Handshake::begin`], so a
    /// caller can prepare for the peer's `Announce` in between.
    pub async fn register(
        &self,
        stream: TcpStream,
        direction: Direction,
    ) -> Result<PendingConnection, HandshakeError> {
        let (connection, read_half) =
            PeerConnection::new(stream, direction, self.settings.write_timeout)?;

        info!(
            "{:?} connection {} with {}",
            direction,
            connection.id(),
            connection.remote_addr()
        );

        if let Err(e) = self.registry.insert(connection.clone()).await {
            connection.close().await;
            return Err(e.into());
        }
        Ok(PendingConnection {
            connection,
            read_half,
        })
    }

    /// Start reading and send our `Announce`
    pub async fn begin(&self, pending: PendingConnection) -> Result<PeerConnection, HandshakeError> {
        let PendingConnection {
            connection,
            read_half,
        } = pending;

        connection.spawn_read_loop(read_half, self.settings.max_frame_len, self.events.clone());

        let announce = Message::new(
            self.settings.identity.clone(),
            MessageBody::Announce(self.settings.announce.clone()),
        );
        if let Err(e) = connection.send(&announce).await {
            self.registry
                .remove_connection(connection.id(), RemovalReason::WriteFailed(e.to_string()))
                .await;
            return Err(HandshakeError::Announce(e));
        }

        self.watch_for_announce(connection.clone());
        Ok(connection)
    }

    /// Drop the connection if the peer never announces itself
    fn watch_for_announce(&self, connection: PeerConnection) {
        let registry = self.registry.clone();
        let timeout = self.settings.handshake_timeout;

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if connection.identity().is_none() && !connection.is_closed() {
                info!(
                    "No Announce from {} within {:?}, closing",
                    connection.remote_addr(),
                    timeout
                );
                registry
                    .remove_connection(connection.id(), RemovalReason::HandshakeTimeout)
                    .await;
            }
        });
    }
}
