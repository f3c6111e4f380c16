//! Peer Transport
//!
//! Raw TCP connections between peers: the per-connection read loop and
//! writer, the registry that owns them, the accept loop and the Announce
//! handshake both directions go through.

mod connection;
pub mod handshake;
pub mod listener;
mod registry;

pub use connection::{
    ConnectionEvent, ConnectionId, ConnectionState, Direction, PeerConnection, WriteError,
};
pub use handshake::{dial, Handshake, HandshakeError, PendingConnection};
pub use listener::ListenerHandle;
pub use registry::{
    BroadcastReport, ConnectionKey, RegistryError, RegistryEvent, RegistryHandle, RemovalReason,
};
