//! MetroSync - Headless Node
//!
//! Runs one sync engine with plain logging. Handy for pairing checks and
//! for watching what a phone or watch puts on the wire.
//!
//! Usage:
//!   cargo run --release -- --name "Desk"
//!   cargo run --release -- --no-discovery --connect 192.168.1.20:45678
//!   cargo run --release -- --direct          # Wait for a direct-mode feed

mod node;

use std::error::Error;
use std::path::PathBuf;

use clap::{command, Parser, ValueHint};
use metrosync_core::discovery::DiscoveryMode;
use metrosync_core::protocol::DEFAULT_PORT;

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, PartialEq, Eq, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Name shown to other devices
    #[arg(short, long, default_value_t = String::from("MetroSync Node"))]
    pub name: String,

    /// TCP port to listen on, 0 for any free port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Take peers from a direct-mode feed instead of the local network
    #[arg(long, default_value_t = false, conflicts_with = "no_discovery")]
    pub direct: bool,

    /// Only connect to peers given with --connect
    #[arg(long, default_value_t = false)]
    pub no_discovery: bool,

    /// Peer to dial once started, as HOST:PORT. May be repeated.
    #[arg(short, long, value_name = "HOST:PORT", value_hint = ValueHint::Hostname, value_parser = parse_target)]
    pub connect: Vec<(String, u16)>,

    /// Identity file
    ///
    /// Created on first run. [default: next to the executable]
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath, env = "METROSYNC_IDENTITY_PATH")]
    pub identity_path: Option<PathBuf>,
}

impl Args {
    pub fn discovery_mode(&self) -> DiscoveryMode {
        if self.direct {
            DiscoveryMode::Direct
        } else if self.no_discovery {
            DiscoveryMode::Disabled
        } else {
            DiscoveryMode::LocalNetwork
        }
    }
}

fn parse_target(value: &str) -> Result<(String, u16), String> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("expected host:port, got {}", value))?;
    let port = port
        .parse()
        .map_err(|_| format!("invalid port in {}", value))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(format!("missing host in {}", value));
    }
    Ok((host.to_string(), port))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();

    metrosync_core::logging::init_with(&["metrosync_node=info"]);
    node::run(args).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(list: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("metrosync-node").chain(list.iter().copied()))
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]).unwrap();
        assert_eq!(args.name, "MetroSync Node");
        assert_eq!(args.port, DEFAULT_PORT);
        assert_eq!(args.discovery_mode(), DiscoveryMode::LocalNetwork);
        assert!(args.connect.is_empty());
    }

    #[test]
    fn test_flags() {
        let args = parse(&[
            "--name",
            "Desk",
            "--port",
            "0",
            "--no-discovery",
            "--connect",
            "192.168.1.20:45678",
            "--connect",
            "[::1]:4000",
            "--identity-path",
            "/tmp/desk-identity",
        ])
        .unwrap();

        assert_eq!(args.name, "Desk");
        assert_eq!(args.port, 0);
        assert_eq!(args.discovery_mode(), DiscoveryMode::Disabled);
        assert_eq!(
            args.connect,
            vec![
                ("192.168.1.20".to_string(), 45678),
                ("::1".to_string(), 4000)
            ]
        );
        assert_eq!(args.identity_path, Some(PathBuf::from("/tmp/desk-identity")));
    }

    #[test]
    fn test_direct_mode() {
        assert_eq!(
            parse(&["--direct"]).unwrap().discovery_mode(),
            DiscoveryMode::Direct
        );
        assert!(parse(&["--direct", "--no-discovery"]).is_err());
    }

    #[test]
    fn test_bad_flags() {
        assert!(parse(&["--port", "http"]).is_err());
        assert!(parse(&["--connect", "nohost"]).is_err());
        assert!(parse(&["--connect", ":45678"]).is_err());
        assert!(parse(&["--verbose"]).is_err());
    }

    #[test]
    fn test_cli_is_consistent() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
