//! Peer identity and session lifecycle types.
//!
//! # Identity (for beginners)
//!
//! A peer is identified by the pair `(ip, signaling_port)` and written as the
//! canonical string `"ip:port"`, e.g. `"192.168.1.20:9999"`.  The port is the
//! one the peer *announces* for signaling, never the ephemeral source port of
//! a TCP connection it opened to us.  Two devices on the same host can
//! therefore coexist as long as they listen on different ports.
//!
//! The display name a peer reports about itself is informational only.  It is
//! never used as a key and never trusted for identity.
//!
//! # Session lifecycle
//!
//! ```text
//! New ──► Negotiating ──► Connected ──► Closed
//!              │               │
//!              └──► Failed ◄───┘
//! ```
//!
//! States only move forward.  `Closed` and `Failed` are terminal: a session
//! that reaches either is discarded, and a later reconnection creates a brand
//! new session.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── PeerId ────────────────────────────────────────────────────────────────────

/// Canonical identifier of a remote device: its IP plus announced signaling port.
///
/// Ordering compares the IP first and the port second.  The ordering is used
/// as a deterministic tie-break when two peers try to connect to each other
/// at the same moment.
///
/// # Examples
///
/// ```rust
/// use clipscape_core::PeerId;
///
/// let id: PeerId = "192.168.1.20:9999".parse().unwrap();
/// assert_eq!(id.port(), 9999);
/// assert_eq!(id.to_string(), "192.168.1.20:9999");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PeerId {
    ip: IpAddr,
    port: u16,
}

/// Error returned when a string is not a valid `"ip:port"` identifier.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid peer identifier {0:?}: expected \"ip:port\"")]
pub struct PeerIdParseError(pub String);

impl PeerId {
    /// Creates an identifier from an IP address and signaling port.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// The peer's IP address.
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// The peer's announced signaling port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The address to open a signaling connection to.
    pub fn signaling_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // SocketAddr formatting gives "ip:port" for IPv4 and "[ip]:port" for IPv6.
        write!(f, "{}", self.signaling_addr())
    }
}

impl FromStr for PeerId {
    type Err = PeerIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(|addr| Self::new(addr.ip(), addr.port()))
            .map_err(|_| PeerIdParseError(s.to_string()))
    }
}

impl From<SocketAddr> for PeerId {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for PeerId {
    type Error = PeerIdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ── PeerInfo ──────────────────────────────────────────────────────────────────

/// Read-only snapshot of a connected peer handed out to other threads.
///
/// Snapshots are copies; holding one never keeps a session alive or blocks
/// the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub display_name: String,
}

// ── DiscoveryRecord ───────────────────────────────────────────────────────────

/// One reply collected during a single discovery pass.
///
/// Records are ephemeral: they live only until the pass that produced them has
/// either started a handshake or skipped the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRecord {
    /// Source IP of the announcement datagram.
    pub ip: IpAddr,
    /// Signaling port the peer announced.
    pub port: u16,
    /// Self-reported device name.
    pub display_name: String,
}

impl DiscoveryRecord {
    /// The canonical identifier this record would register under.
    pub fn peer_id(&self) -> PeerId {
        PeerId::new(self.ip, self.port)
    }
}

// ── Session role and state ────────────────────────────────────────────────────

/// Which side of the offer/answer handshake this device played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// We opened the signaling connection and sent the offer.
    Offerer,
    /// We accepted the signaling connection and sent the answer.
    Answerer,
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionRole::Offerer => f.write_str("offerer"),
            SessionRole::Answerer => f.write_str("answerer"),
        }
    }
}

/// Lifecycle stage of a peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, nothing sent yet.
    New,
    /// Offer/answer exchange in progress.
    Negotiating,
    /// Data channel open; messages and heartbeats flow.
    Connected,
    /// Closed locally or by the remote side.
    Closed,
    /// Handshake or liveness failure.
    Failed,
}

/// Error returned for a backwards or post-terminal state change.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid session transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

impl SessionState {
    /// Position along the lifecycle.  Terminal states share the last rank.
    fn rank(self) -> u8 {
        match self {
            SessionState::New => 0,
            SessionState::Negotiating => 1,
            SessionState::Connected => 2,
            SessionState::Closed | SessionState::Failed => 3,
        }
    }

    /// `true` for `Closed` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Returns `true` if a session in `self` may move to `next`.
    ///
    /// Transitions must move strictly forward and never leave a terminal state.
    /// Skipping stages is allowed (`New -> Failed` when a handshake dies before
    /// it starts).
    pub fn can_transition_to(self, next: SessionState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    /// Validates the transition and returns the new state.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] when [`can_transition_to`](Self::can_transition_to)
    /// is `false`.
    pub fn transition(self, next: SessionState) -> Result<SessionState, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
