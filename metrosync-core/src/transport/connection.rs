//! Peer Connections
//!
//! A `PeerConnection` wraps one TCP stream. Writes go through a per-connection
//! lock so a length prefix is never interleaved with another frame's payload;
//! reads happen on a dedicated task that reports to the engine.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::identity::PeerIdentity;
use crate::protocol::{self, EncodeError, FrameReader, FrameWriter, Message};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id of a connection, stable across identity migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    AwaitingAnnounce,
    Identified,
    Active,
    Closed,
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("Connection is closed")]
    Closed,

    #[error("Write timed out after {0:?}")]
    Timeout(Duration),

    #[error("Write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// What a read loop reports back
#[derive(Debug)]
pub enum ConnectionEvent {
    Received {
        id: ConnectionId,
        message: Message,
    },
    Closed {
        id: ConnectionId,
        /// `None` for a clean end of stream
        error: Option<String>,
    },
}

struct Inner {
    id: ConnectionId,
    remote_addr: SocketAddr,
    direction: Direction,
    write_timeout: Duration,
    identity: Mutex<Option<PeerIdentity>>,
    state: Mutex<ConnectionState>,
    /// `None` once the connection has been closed locally
    writer: tokio::sync::Mutex<Option<FrameWriter<OwnedWriteHalf>>>,
    reader: Mutex<Option<AbortHandle>>,
}

/// Shared handle to one live peer connection
#[derive(Clone)]
pub struct PeerConnection {
    inner: Arc<Inner>,
}

impl PeerConnection {
    /// Wrap a connected stream. The read half is handed back so the caller
    /// can start the read loop once the connection is registered.
    pub fn new(
        stream: TcpStream,
        direction: Direction,
        write_timeout: Duration,
    ) -> std::io::Result<(Self, OwnedReadHalf)> {
        let remote_addr = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", remote_addr, e);
        }
        let (read_half, write_half) = stream.into_split();

        let initial_state = match direction {
            Direction::Inbound => ConnectionState::Accepted,
            Direction::Outbound => ConnectionState::AwaitingAnnounce,
        };

        let connection = Self {
            inner: Arc::new(Inner {
                id: ConnectionId::next(),
                remote_addr,
                direction,
                write_timeout,
                identity: Mutex::new(None),
                state: Mutex::new(initial_state),
                writer: tokio::sync::Mutex::new(Some(FrameWriter::new(write_half))),
                reader: Mutex::new(None),
            }),
        };

        Ok((connection, read_half))
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// Identity announced by the peer, once known
    pub fn identity(&self) -> Option<PeerIdentity> {
        self.inner.identity.lock().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn set_state(&self, state: ConnectionState) {
        let mut current = self.inner.state.lock();
        if *current != ConnectionState::Closed {
            *current = state;
        }
    }

    pub(crate) fn set_identity(&self, identity: PeerIdentity) {
        *self.inner.identity.lock() = Some(identity);
        self.set_state(ConnectionState::Identified);
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Start the read loop for this connection
    pub fn spawn_read_loop(
        &self,
        read_half: OwnedReadHalf,
        max_frame_len: usize,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        let id = self.inner.id;
        let remote_addr = self.inner.remote_addr;
        let reader = FrameReader::with_max_frame_len(read_half, max_frame_len);

        if self.inner.direction == Direction::Inbound {
            self.set_state(ConnectionState::AwaitingAnnounce);
        }

        let handle = tokio::spawn(read_loop(id, remote_addr, reader, events));
        *self.inner.reader.lock() = Some(handle.abort_handle());

        // Closed while the loop was being spawned
        if self.is_closed() {
            handle.abort();
        }
    }

    /// Encode and send one message
    pub async fn send(&self, message: &Message) -> Result<(), WriteError> {
        let payload = protocol::encode(message)?;
        self.send_payload(&payload).await
    }

    /// Send an already encoded payload, so a broadcast encodes only once
    pub async fn send_payload(&self, payload: &str) -> Result<(), WriteError> {
        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(WriteError::Closed)?;

        match tokio::time::timeout(self.inner.write_timeout, writer.write_frame(payload)).await {
            Ok(result) => result.map_err(WriteError::from),
            Err(_) => Err(WriteError::Timeout(self.inner.write_timeout)),
        }
    }

    /// Close the stream and stop the read loop. Safe to call more than once.
    pub async fn close(&self) {
        self.set_state(ConnectionState::Closed);

        if let Some(reader) = self.inner.reader.lock().take() {
            reader.abort();
        }

        let writer = self.inner.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!("Shutdown of {} failed: {}", self.inner.remote_addr, e);
            }
            debug!("Closed connection {} to {}", self.inner.id, self.inner.remote_addr);
        }
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("direction", &self.inner.direction)
            .field("identity", &self.identity())
            .field("state", &self.state())
            .finish()
    }
}

async fn read_loop(
    id: ConnectionId,
    remote_addr: SocketAddr,
    mut reader: FrameReader<OwnedReadHalf>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let error = loop {
        match reader.read_frame().await {
            Ok(Some(payload)) => match protocol::decode_frame(&payload) {
                Ok(message) => {
                    if events.send(ConnectionEvent::Received { id, message }).is_err() {
                        // Engine is gone
                        return;
                    }
                }
                Err(e) => {
                    warn!("Undecodable message from {}: {}", remote_addr, e);
                    break Some(e.to_string());
                }
            },
            Ok(None) => {
                debug!("Connection {} from {} ended", id, remote_addr);
                break None;
            }
            Err(e) => {
                if e.is_protocol_error() {
                    warn!("Framing error on {} from {}: {}", id, remote_addr, e);
                } else {
                    debug!("Read error on {} from {}: {}", id, remote_addr, e);
                }
                break Some(e.to_string());
            }
        }
    };

    let _ = events.send(ConnectionEvent::Closed { id, error });
}
