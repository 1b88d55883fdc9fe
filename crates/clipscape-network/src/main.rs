//! ClipScape node: a small interactive front end for the peer network.
//!
//! Runs one [`PeerNetworkService`], prints peer and message events as they
//! arrive, and reads commands from stdin.  Useful for trying the network
//! between two machines without the clipboard application.
//!
//! # Usage
//!
//! ```text
//! clipscape-node [OPTIONS]
//!
//! Options:
//!   --config <PATH>   Config file [default: platform config dir]
//!   --port <PORT>     Shared UDP/TCP port (overrides NETWORK_PORT)
//!   --name <NAME>     Device name announced to peers
//!   --bind <IP>       Local address to bind both sockets to
//!   --seed <IP:PORT>  Extra discovery target, repeatable
//!   --save-config     Write the resolved config back to --config and exit
//! ```
//!
//! # Configuration order
//!
//! Defaults, then the config file, then `NETWORK_PORT`, then CLI flags.
//!
//! # Commands
//!
//! | Command              | Effect                                     |
//! |----------------------|--------------------------------------------|
//! | `discover`           | Run a discovery pass now                   |
//! | `peers`              | List connected peers                       |
//! | `send <text>`        | Broadcast text to every connected peer     |
//! | `to <ip:port> <text>`| Send text to one peer                      |
//! | `connect <ip> <port>`| Connect to a known address                 |
//! | `quit`               | Stop the node and exit                     |

use std::io::BufRead;
use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use clipscape_core::PeerId;
use clipscape_network::infrastructure::storage::config::{config_file_path, load_config, save_config};
use clipscape_network::{NodeConfig, PeerNetworkService};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// ClipScape peer network node.
#[derive(Debug, Parser)]
#[command(
    name = "clipscape-node",
    about = "Discover LAN peers and exchange text over ClipScape data channels",
    version
)]
struct Cli {
    /// Config file to load.  Missing files yield defaults.
    #[arg(long, env = "CLIPSCAPE_CONFIG")]
    config: Option<PathBuf>,

    /// Port used for both UDP discovery and TCP signaling.
    #[arg(long)]
    port: Option<u16>,

    /// Device name announced to peers.
    #[arg(long, env = "CLIPSCAPE_NAME")]
    name: Option<String>,

    /// Local address both sockets bind to.
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Extra unicast discovery target (`ip:port`).  May be repeated.
    #[arg(long = "seed")]
    seeds: Vec<String>,

    /// Write the resolved config to the config path and exit.
    #[arg(long)]
    save_config: bool,
}

impl Cli {
    fn apply_to(&self, config: &mut NodeConfig) {
        if let Some(port) = self.port {
            config.node.port = port;
        }
        if let Some(name) = &self.name {
            config.node.device_name = name.clone();
        }
        if let Some(bind) = self.bind {
            config.node.bind_address = bind.to_string();
        }
        config.discovery.seeds.extend(self.seeds.iter().cloned());
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Discover,
    Peers,
    Send(String),
    SendTo(PeerId, String),
    Connect(IpAddr, u16),
    Help,
    Quit,
}

fn parse_input(line: &str) -> Result<Input, String> {
    let line = line.trim();
    let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    match word {
        "discover" => Ok(Input::Discover),
        "peers" => Ok(Input::Peers),
        "send" if !rest.is_empty() => Ok(Input::Send(rest.to_string())),
        "to" => {
            let (peer, text) = rest.split_once(' ').ok_or("usage: to <ip:port> <text>")?;
            let peer = peer.parse::<PeerId>().map_err(|e| e.to_string())?;
            Ok(Input::SendTo(peer, text.trim().to_string()))
        }
        "connect" => {
            let mut parts = rest.split_whitespace();
            let ip = parts.next().and_then(|s| s.parse().ok());
            let port = parts.next().and_then(|s| s.parse().ok());
            match (ip, port) {
                (Some(ip), Some(port)) => Ok(Input::Connect(ip, port)),
                _ => Err("usage: connect <ip> <port>".to_string()),
            }
        }
        "help" | "?" => Ok(Input::Help),
        "quit" | "exit" => Ok(Input::Quit),
        _ => Err(format!("unknown command {line:?}, try `help`")),
    }
}

const HELP: &str = "commands: discover | peers | send <text> | to <ip:port> <text> | connect <ip> <port> | quit";

fn run_input(service: &PeerNetworkService, input: Input) -> anyhow::Result<()> {
    match input {
        Input::Discover => {
            let peers = service.discover_now(None)?;
            println!("{} peer(s) connected", peers.len());
            for peer in peers {
                println!("  {} ({})", peer.id, peer.display_name);
            }
        }
        Input::Peers => {
            for peer in service.connected_peers()? {
                println!("  {} ({})", peer.id, peer.display_name);
            }
        }
        Input::Send(text) => {
            let sent = service.broadcast(&text)?;
            println!("sent to {sent} peer(s)");
        }
        Input::SendTo(peer, text) => {
            if !service.send_to_peer(peer, &text)? {
                println!("{peer} is not connected");
            }
        }
        Input::Connect(ip, port) => {
            let connected = service.connect_to_peer(ip, port)?;
            println!("{}", if connected { "connected" } else { "connection failed" });
        }
        Input::Help => println!("{HELP}"),
        Input::Quit => {}
    }
    Ok(())
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let path = match &cli.config {
        Some(path) => path.clone(),
        None => config_file_path().context("cannot locate the config directory")?,
    };
    let mut config = load_config(&path).with_context(|| format!("cannot load {}", path.display()))?;
    config.apply_env_overrides();
    cli.apply_to(&mut config);

    // RUST_LOG wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.node.log_level)),
        )
        .init();

    if cli.save_config {
        save_config(&path, &config).with_context(|| format!("cannot write {}", path.display()))?;
        println!("wrote {}", path.display());
        return Ok(());
    }

    let service = PeerNetworkService::new(config);
    service.on_peer_connected(|peer| println!("+ {} ({})", peer.id, peer.display_name));
    service.on_peer_disconnected(|id| println!("- {id}"));
    service.on_message(|peer, text| println!("[{peer}] {text}"));

    let local_id = service.start().context("cannot start the peer network")?;
    info!("ClipScape node running as {local_id}");
    println!("{HELP}");

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("cannot read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_input(&line) {
            Ok(Input::Quit) => break,
            Ok(input) => {
                if let Err(e) = run_input(&service, input) {
                    println!("error: {e}");
                }
            }
            Err(msg) => println!("{msg}"),
        }
    }

    service.stop();
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_flags_override_config() {
        // Arrange
        let cli = Cli::parse_from([
            "clipscape-node",
            "--port",
            "7000",
            "--name",
            "desk",
            "--seed",
            "10.0.0.5:7000",
            "--seed",
            "10.0.0.6:7000",
        ]);
        let mut config = NodeConfig::default();

        // Act
        cli.apply_to(&mut config);

        // Assert
        assert_eq!(config.node.port, 7000);
        assert_eq!(config.node.device_name, "desk");
        assert_eq!(config.discovery.seeds, vec!["10.0.0.5:7000", "10.0.0.6:7000"]);
    }

    #[test]
    fn test_cli_without_flags_keeps_config() {
        let cli = Cli::parse_from(["clipscape-node"]);
        let mut config = NodeConfig::default();
        let before = config.clone();

        cli.apply_to(&mut config);

        assert_eq!(config, before);
    }

    #[test]
    fn test_parse_input_commands() {
        assert_eq!(parse_input("discover"), Ok(Input::Discover));
        assert_eq!(parse_input("  peers "), Ok(Input::Peers));
        assert_eq!(parse_input("send hello world"), Ok(Input::Send("hello world".to_string())));
        assert_eq!(
            parse_input("connect 10.0.0.5 9999"),
            Ok(Input::Connect("10.0.0.5".parse().unwrap(), 9999))
        );
        assert_eq!(
            parse_input("to 10.0.0.5:9999 hi there"),
            Ok(Input::SendTo("10.0.0.5:9999".parse().unwrap(), "hi there".to_string()))
        );
        assert_eq!(parse_input("quit"), Ok(Input::Quit));
    }

    #[test]
    fn test_parse_input_rejects_malformed() {
        assert!(parse_input("send").is_err());
        assert!(parse_input("connect 10.0.0.5").is_err());
        assert!(parse_input("to nowhere hi").is_err());
        assert!(parse_input("dance").is_err());
    }
}
