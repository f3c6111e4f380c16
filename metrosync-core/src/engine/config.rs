//! Engine configuration

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::discovery::DiscoveryMode;
use crate::protocol::{Announce, Capability, DeviceType, DEFAULT_MAX_FRAME_LEN, DEFAULT_PORT};

/// Sync engine configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Name shown to other devices
    pub device_name: String,
    pub device_type: DeviceType,
    /// Advertised in our Announce. Informational only.
    pub capabilities: BTreeSet<Capability>,
    /// Address for the peer listener. Port 0 picks a free port.
    pub listen_addr: SocketAddr,
    pub discovery_mode: DiscoveryMode,
    /// Dial discovered peers automatically
    pub auto_connect: bool,
    pub connect_timeout: Duration,
    /// How long a new connection may stay silent before its Announce
    pub handshake_timeout: Duration,
    /// Upper bound for a single frame write
    pub write_timeout: Duration,
    pub max_frame_len: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            device_name: "MetroSync Device".to_string(),
            device_type: DeviceType::Phone,
            capabilities: DeviceType::Phone.default_capabilities(),
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            discovery_mode: DiscoveryMode::LocalNetwork,
            auto_connect: true,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl SyncConfig {
    /// Config for a device, with that device type's default capabilities
    pub fn new(device_name: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            device_name: device_name.into(),
            device_type,
            capabilities: device_type.default_capabilities(),
            ..Self::default()
        }
    }

    pub fn with_listen_addr(mut self, listen_addr: SocketAddr) -> Self {
        self.listen_addr = listen_addr;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.listen_addr.set_port(port);
        self
    }

    pub fn with_discovery_mode(mut self, mode: DiscoveryMode) -> Self {
        self.discovery_mode = mode;
        self
    }

    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn with_capabilities(mut self, capabilities: BTreeSet<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_timeouts(
        mut self,
        connect_timeout: Duration,
        handshake_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        self.connect_timeout = connect_timeout;
        self.handshake_timeout = handshake_timeout;
        self.write_timeout = write_timeout;
        self
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// The Announce we send on every new connection
    pub fn announce(&self) -> Announce {
        Announce {
            device_name: self.device_name.clone(),
            device_type: self.device_type,
            capabilities: self.capabilities.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.listen_addr.port(), 45678);
        assert!(config.listen_addr.ip().is_unspecified());
        assert_eq!(config.discovery_mode, DiscoveryMode::LocalNetwork);
        assert!(config.auto_connect);
        assert_eq!(config.max_frame_len, 1024 * 1024);
    }

    #[test]
    fn test_watch_config() {
        let config = SyncConfig::new("Wrist", DeviceType::Watch).with_port(0);
        let announce = config.announce();
        assert_eq!(announce.device_name, "Wrist");
        assert_eq!(announce.capabilities, DeviceType::Watch.default_capabilities());
        assert_eq!(config.listen_addr.port(), 0);
    }
}
