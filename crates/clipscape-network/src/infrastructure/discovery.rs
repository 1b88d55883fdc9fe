//! UDP discovery: the always-on responder and the time-bounded discovery pass.
//!
//! # How discovery works (for beginners)
//!
//! Every node listens for UDP datagrams on its shared port.  A node that wants
//! to find peers sends the literal bytes `CLIPSCAPE_DISCOVER` to the LAN
//! broadcast address on that port.  Every node that receives it answers
//! directly to the sender with:
//!
//! ```text
//! CLIPSCAPE_ANNOUNCE:<display name>:<signaling port>
//! ```
//!
//! The asking node collects replies for a fixed window, drops its own reply
//! and duplicates, and ends up with a list of [`DiscoveryRecord`]s.  The reply
//! source IP plus the announced port becomes the peer's identifier.
//!
//! Networks that filter broadcasts can still be covered with unicast seeds
//! from the config; seeds are probed exactly like broadcast targets.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use clipscape_core::protocol::discovery::{
    broadcast_targets, encode_announcement, is_discover_request, Admission, MAX_DATAGRAM,
};
use clipscape_core::protocol::DISCOVER_TOKEN;
use clipscape_core::{DiscoveryCollector, DiscoveryRecord};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use crate::infrastructure::storage::config::NodeConfig;

/// Pause after a receive error so a broken socket cannot spin the loop.
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Error type for discovery socket setup.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The UDP socket could not be bound.
    #[error("failed to bind discovery socket on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Everything one discovery pass needs.
#[derive(Debug, Clone)]
pub struct DiscoveryProbe {
    /// Where the discover request is sent.
    pub targets: Vec<SocketAddr>,
    /// Replies from this IP are our own and are ignored.
    pub local_ip: IpAddr,
    /// How long replies are collected.
    pub timeout: Duration,
}

impl DiscoveryProbe {
    /// Builds the probe for a node: broadcast targets (if enabled) plus seeds.
    pub fn from_config(config: &NodeConfig, local_ip: IpAddr) -> Self {
        let mut targets = Vec::new();
        if config.discovery.broadcast {
            targets.extend(broadcast_targets(local_ip, config.node.port));
        }
        for seed in config.seed_addrs() {
            if !targets.contains(&seed) {
                targets.push(seed);
            }
        }

        Self {
            targets,
            local_ip,
            timeout: config.discovery_timeout(),
        }
    }

    /// Same probe with a different collection window.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Runs one discovery pass.
///
/// Sends the discover request to every target, then collects announcements
/// until the timeout elapses.  Any socket failure ends the pass early with
/// whatever was collected; an unusable socket yields an empty list.
pub async fn discover(probe: &DiscoveryProbe) -> Vec<DiscoveryRecord> {
    let socket = match UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await {
        Ok(s) => s,
        Err(e) => {
            warn!("discovery pass skipped, cannot bind probe socket: {e}");
            return Vec::new();
        }
    };
    if let Err(e) = socket.set_broadcast(true) {
        debug!("cannot enable broadcast on probe socket: {e}");
    }

    let mut sent = 0usize;
    for target in &probe.targets {
        match socket.send_to(DISCOVER_TOKEN, target).await {
            Ok(_) => sent += 1,
            Err(e) => debug!("discover request to {target} failed: {e}"),
        }
    }
    if sent == 0 {
        debug!("discovery pass sent no requests");
        return Vec::new();
    }

    let deadline = Instant::now() + probe.timeout;
    let mut collector = DiscoveryCollector::new(probe.local_ip);
    let mut buf = [0u8; MAX_DATAGRAM];

    loop {
        let (len, src) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_elapsed) => break,
            Ok(Err(e)) => {
                debug!("discovery receive failed: {e}");
                break;
            }
            Ok(Ok(pair)) => pair,
        };

        match collector.offer(src.ip(), &buf[..len]) {
            Admission::Accepted => trace!("announcement from {src}"),
            Admission::OwnAddress | Admission::Duplicate => {}
            Admission::Rejected(e) => debug!("ignoring datagram from {src}: {e}"),
        }
    }

    let records = collector.finish();
    debug!("discovery pass found {} peer(s)", records.len());
    records
}

/// Address the responder binds to for a node configured with `bind_ip`.
///
/// A UDP socket bound to a unicast address never sees broadcast datagrams, so
/// with broadcast discovery on the responder listens on every interface of
/// `bind_ip`'s family.  The signaling listener keeps `bind_ip`.
pub fn responder_bind_ip(bind_ip: IpAddr, broadcast: bool) -> IpAddr {
    match (broadcast, bind_ip) {
        (false, ip) => ip,
        (true, IpAddr::V4(_)) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        (true, IpAddr::V6(_)) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

/// Binds the responder socket on `bind_ip:port`.
///
/// # Errors
///
/// Returns [`DiscoveryError::BindFailed`] if the port is unavailable.
pub async fn bind_responder(bind_ip: IpAddr, port: u16) -> Result<UdpSocket, DiscoveryError> {
    let addr = SocketAddr::new(bind_ip, port);
    let socket = UdpSocket::bind(addr)
        .await
        .map_err(|source| DiscoveryError::BindFailed { addr, source })?;
    info!("discovery responder listening on UDP {addr}");
    Ok(socket)
}

/// Answers discover requests until the task is cancelled.
///
/// Only datagrams that are exactly the discover token get a reply; anything
/// else is ignored.
pub async fn run_responder(socket: UdpSocket, device_name: String, signaling_port: u16) {
    let reply = encode_announcement(&device_name, signaling_port);
    let mut buf = [0u8; MAX_DATAGRAM];

    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                // Windows reports ICMP port-unreachable as a receive error.
                trace!("discovery responder receive error: {e}");
                tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                continue;
            }
        };

        if !is_discover_request(&buf[..len]) {
            trace!("ignoring {len}-byte datagram from {src}");
            continue;
        }

        if let Err(e) = socket.send_to(&reply, src).await {
            warn!("failed to answer discover request from {src}: {e}");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
