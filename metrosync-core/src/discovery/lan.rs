//! Local-network discovery over libp2p
//!
//! mDNS finds other MetroSync nodes on the LAN. We dial each one just long
//! enough for `identify` to carry its advertisement (identity, display name
//! and sync port) in the agent string; the host comes from the mDNS address.
//! The sync connection itself is plain TCP and never goes through libp2p.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use futures::StreamExt;
use libp2p::{
    identify, identity, mdns, multiaddr::Protocol, noise, swarm::NetworkBehaviour,
    swarm::SwarmEvent, tcp, yamux, Multiaddr, PeerId, Swarm,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Advertisement, DiscoveryError, DiscoveryEvent, PeerAnnouncement, StreamSenders};
use crate::identity::PeerIdentity;

/// Identify protocol version shared by every MetroSync node
const PROTOCOL_VERSION: &str = "/metrosync/1.0.0";

#[derive(NetworkBehaviour)]
struct LanBehaviour {
    mdns: mdns::tokio::Behaviour,
    identify: identify::Behaviour,
}

/// Running local-network backend
pub(super) struct LanDiscovery {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl LanDiscovery {
    pub(super) fn start(
        advertisement: &Advertisement,
        senders: StreamSenders,
    ) -> Result<Self, DiscoveryError> {
        let agent_version = serde_json::to_string(advertisement)
            .map_err(|e| DiscoveryError::Start(e.to_string()))?;

        let mut swarm = create_swarm(agent_version)?;

        let listen_addr: Multiaddr = "/ip4/0.0.0.0/tcp/0"
            .parse()
            .map_err(|e: libp2p::multiaddr::Error| DiscoveryError::Start(e.to_string()))?;
        swarm
            .listen_on(listen_addr)
            .map_err(|e| DiscoveryError::Start(e.to_string()))?;

        info!(
            "mDNS discovery started as {} for {}",
            swarm.local_peer_id(),
            advertisement.identity
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run(
            swarm,
            advertisement.identity.clone(),
            senders,
            shutdown_rx,
        ));

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    pub(super) async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.task.await {
            debug!("mDNS discovery task ended abnormally: {}", e);
        }
    }
}

fn create_swarm(agent_version: String) -> Result<Swarm<LanBehaviour>, DiscoveryError> {
    // Fresh libp2p identity per session; the sync identity travels in the agent string
    let keypair = identity::Keypair::generate_ed25519();

    let swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| DiscoveryError::Transport(e.to_string()))?
        .with_behaviour(|keypair| {
            let mdns = mdns::tokio::Behaviour::new(
                mdns::Config::default(),
                keypair.public().to_peer_id(),
            )
            .map_err(|e| e.to_string())?;

            let identify = identify::Behaviour::new(
                identify::Config::new(PROTOCOL_VERSION.to_string(), keypair.public())
                    .with_agent_version(agent_version),
            );

            Ok(LanBehaviour { mdns, identify })
        })
        .map_err(|e| DiscoveryError::Transport(e.to_string()))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    Ok(swarm)
}

async fn run(
    mut swarm: Swarm<LanBehaviour>,
    local: PeerIdentity,
    senders: StreamSenders,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut browser = Browser {
        local,
        hosts: HashMap::new(),
        identities: HashMap::new(),
        registered: false,
        senders,
    };

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!("mDNS discovery shutting down");
                break;
            }
            event = swarm.select_next_some() => {
                browser.handle_swarm_event(&mut swarm, event);
            }
        }
    }
}

/// Per-session browse state
struct Browser {
    local: PeerIdentity,
    /// Host each mDNS peer was seen at
    hosts: HashMap<PeerId, IpAddr>,
    /// Sync identity each identified libp2p peer advertised
    identities: HashMap<PeerId, PeerIdentity>,
    registered: bool,
    senders: StreamSenders,
}

impl Browser {
    fn handle_swarm_event(
        &mut self,
        swarm: &mut Swarm<LanBehaviour>,
        event: SwarmEvent<LanBehaviourEvent>,
    ) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                debug!("mDNS node listening on {}", address);
                // mDNS responds with our listen addresses from here on
                if !self.registered {
                    self.registered = true;
                    let _ = self.senders.registrations.send(true);
                }
            }

            SwarmEvent::ListenerError { error, .. } => {
                warn!("mDNS node listener error: {}", error);
            }

            SwarmEvent::Behaviour(LanBehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
                for (peer_id, addr) in peers {
                    let Some(host) = host_of(&addr) else {
                        continue;
                    };
                    if self.hosts.insert(peer_id, host).is_none() {
                        debug!("mDNS found {} at {}", peer_id, addr);
                    }
                    if let Err(e) = swarm.dial(addr.clone()) {
                        debug!("Failed to dial {} at {}: {}", peer_id, addr, e);
                    }
                }
            }

            SwarmEvent::Behaviour(LanBehaviourEvent::Mdns(mdns::Event::Expired(peers))) => {
                for (peer_id, _) in peers {
                    self.hosts.remove(&peer_id);
                    if let Some(identity) = self.identities.remove(&peer_id) {
                        info!("Peer {} left the local network", identity);
                        let _ = self.senders.events.send(DiscoveryEvent::PeerLost(identity));
                    }
                }
            }

            SwarmEvent::Behaviour(LanBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                let Some(advertisement) = parse_advertisement(&info.protocol_version, &info.agent_version)
                else {
                    debug!("Ignoring non-MetroSync peer {} ({})", peer_id, info.protocol_version);
                    return;
                };
                if advertisement.identity == self.local {
                    return;
                }

                let mut peer = PeerAnnouncement::new(advertisement.identity.clone(), advertisement.name);
                match self.hosts.get(&peer_id) {
                    Some(host) => peer = peer.with_address(SocketAddr::new(*host, advertisement.port)),
                    None => debug!("No mDNS host for {}, announcing without address", peer_id),
                }

                info!("Discovered {} ({})", peer.identity, peer.display_name);
                self.identities.insert(peer_id, advertisement.identity);
                let _ = self.senders.events.send(DiscoveryEvent::PeerFound(peer));
            }

            _ => {}
        }
    }
}

/// Decode the advertisement a MetroSync node puts in its identify info
fn parse_advertisement(protocol_version: &str, agent_version: &str) -> Option<Advertisement> {
    if protocol_version != PROTOCOL_VERSION {
        return None;
    }
    serde_json::from_str(agent_version).ok()
}

/// First IP component of a multiaddr
fn host_of(addr: &Multiaddr) -> Option<IpAddr> {
    addr.iter().find_map(|protocol| match protocol {
        Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
        Protocol::Ip6(ip) => Some(IpAddr::V6(ip)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_advertisement() {
        let advertisement = Advertisement {
            identity: PeerIdentity::from("dev-B"),
            name: "Pixel Tablet".to_string(),
            port: 45678,
        };
        let agent = serde_json::to_string(&advertisement).unwrap();

        assert_eq!(
            parse_advertisement(PROTOCOL_VERSION, &agent),
            Some(advertisement)
        );
        assert_eq!(parse_advertisement("/ipfs/0.1.0", &agent), None);
        assert_eq!(parse_advertisement(PROTOCOL_VERSION, "rust-libp2p/0.56"), None);
    }

    #[test]
    fn test_host_of() {
        let v4: Multiaddr = "/ip4/192.168.1.7/tcp/4001".parse().unwrap();
        assert_eq!(host_of(&v4), Some("192.168.1.7".parse().unwrap()));

        let v6: Multiaddr = "/ip6/fe80::1/tcp/4001".parse().unwrap();
        assert_eq!(host_of(&v6), Some("fe80::1".parse().unwrap()));

        let dns: Multiaddr = "/dns4/example.com/tcp/4001".parse().unwrap();
        assert_eq!(host_of(&dns), None);
    }
}
