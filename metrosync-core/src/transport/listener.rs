//! Listener Endpoint
//!
//! Accepts inbound peer connections for as long as the engine runs. Each
//! accepted stream is handed to the handshake on its own task so a slow peer
//! never holds up the accept loop.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::connection::Direction;
use super::handshake::Handshake;

/// Pause after a failed accept so a persistent error does not spin
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Handle to a running accept loop
pub struct ListenerHandle {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Address the listener is bound to, with the real port if 0 was requested
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait until the port has been released. Handshakes
    /// still in progress are aborted.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            debug!("Accept loop ended abnormally: {}", e);
        }
        info!("Listener on {} stopped", self.local_addr);
    }
}

/// Bind `addr` and start accepting connections
pub async fn bind(addr: SocketAddr, handshake: Handshake) -> std::io::Result<ListenerHandle> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!("Listening for peers on {}", local_addr);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(accept_loop(listener, handshake, shutdown_rx));

    Ok(ListenerHandle {
        local_addr,
        shutdown_tx: Some(shutdown_tx),
        task,
    })
}

async fn accept_loop(
    listener: TcpListener,
    handshake: Handshake,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut attaching = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!("Accept loop shutting down");
                break;
            }
            Some(_) = attaching.join_next() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, remote_addr)) => {
                    debug!("Accepted connection from {}", remote_addr);
                    let handshake = handshake.clone();
                    attaching.spawn(async move {
                        if let Err(e) = handshake.attach(stream, Direction::Inbound).await {
                            warn!("Handshake with {} failed: {}", remote_addr, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }

    if !attaching.is_empty() {
        debug!("Aborting {} pending handshakes", attaching.len());
    }
    attaching.shutdown().await;
}
