//! UDP discovery wire format and reply collection.
//!
//! # How discovery works (for beginners)
//!
//! 1. The discovering node sends the fixed token `CLIPSCAPE_DISCOVER` to the
//!    global broadcast address `255.255.255.255` and to its own /24 subnet
//!    broadcast address (e.g. `192.168.1.255`) on the shared port.
//!
//! 2. Every node listening on that port answers the sender directly with
//!    `CLIPSCAPE_ANNOUNCE:<device_name>:<signaling_port>`.
//!
//! 3. The discovering node keeps collecting answers until its timeout expires.
//!    The pass is time-bounded, not count-bounded: we never know how many
//!    peers exist, so we simply listen for a fixed window.
//!
//! The [`DiscoveryCollector`] applies the two collection rules: replies from
//! our own IP are ignored, and only the first reply per IP is kept.
//!
//! The device name may itself contain `:` characters; the port is always the
//! text after the *last* colon.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::domain::peer::DiscoveryRecord;
use crate::protocol::error::ProtocolError;

/// Request datagram broadcast by a discovering node.
pub const DISCOVER_TOKEN: &[u8] = b"CLIPSCAPE_DISCOVER";

/// Prefix of every announcement reply.
pub const ANNOUNCE_PREFIX: &str = "CLIPSCAPE_ANNOUNCE:";

/// Receive buffer size for discovery datagrams.
pub const MAX_DATAGRAM: usize = 1024;

/// Parsed content of an announcement reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub display_name: String,
    pub signaling_port: u16,
}

/// Returns `true` if `datagram` is exactly the discovery request token.
pub fn is_discover_request(datagram: &[u8]) -> bool {
    datagram == DISCOVER_TOKEN
}

/// Builds the announcement reply for this node.
///
/// # Examples
///
/// ```rust
/// use clipscape_core::protocol::discovery::encode_announcement;
///
/// assert_eq!(encode_announcement("desk", 9999), b"CLIPSCAPE_ANNOUNCE:desk:9999".to_vec());
/// ```
pub fn encode_announcement(display_name: &str, signaling_port: u16) -> Vec<u8> {
    format!("{ANNOUNCE_PREFIX}{display_name}:{signaling_port}").into_bytes()
}

/// Parses an announcement reply.
///
/// # Errors
///
/// - [`ProtocolError::InvalidUtf8`] if the datagram is not UTF-8.
/// - [`ProtocolError::NotAnAnnouncement`] if the prefix is missing.
/// - [`ProtocolError::InvalidField`] if the port is missing or not a `u16`.
pub fn decode_announcement(datagram: &[u8]) -> Result<Announcement, ProtocolError> {
    let text = std::str::from_utf8(datagram).map_err(|_| ProtocolError::InvalidUtf8)?;
    let payload = text
        .strip_prefix(ANNOUNCE_PREFIX)
        .ok_or(ProtocolError::NotAnAnnouncement)?;

    let (name, port) = payload
        .rsplit_once(':')
        .ok_or_else(|| ProtocolError::InvalidField {
            field: "signaling_port",
            reason: "missing".to_string(),
        })?;

    let signaling_port = port
        .trim()
        .parse::<u16>()
        .map_err(|e| ProtocolError::InvalidField {
            field: "signaling_port",
            reason: e.to_string(),
        })?;

    Ok(Announcement {
        display_name: name.to_string(),
        signaling_port,
    })
}

/// Computes where discovery requests are sent.
///
/// Always includes the global broadcast address.  For an IPv4 `local_ip` that
/// is not loopback, the /24 subnet broadcast address (`a.b.c.255`) is added.
pub fn broadcast_targets(local_ip: IpAddr, port: u16) -> Vec<SocketAddr> {
    let mut targets = vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port)];

    if let IpAddr::V4(v4) = local_ip {
        if !v4.is_loopback() && !v4.is_unspecified() {
            let [a, b, c, _] = v4.octets();
            let subnet = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(a, b, c, 255)), port);
            if !targets.contains(&subnet) {
                targets.push(subnet);
            }
        }
    }

    targets
}

/// Outcome of offering one reply to a [`DiscoveryCollector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// New peer recorded.
    Accepted,
    /// The reply came from our own IP.
    OwnAddress,
    /// A reply from this IP was already recorded in this pass.
    Duplicate,
    /// Not a valid announcement (request echoes, garbage).
    Rejected(ProtocolError),
}

/// Accumulates the replies of one discovery pass.
///
/// Guarantees that the local IP never appears in the result and that each IP
/// appears at most once, with the first reply winning.
#[derive(Debug)]
pub struct DiscoveryCollector {
    local_ip: IpAddr,
    seen: HashSet<IpAddr>,
    records: Vec<DiscoveryRecord>,
}

impl DiscoveryCollector {
    /// Creates an empty collector that filters out `local_ip`.
    pub fn new(local_ip: IpAddr) -> Self {
        Self {
            local_ip,
            seen: HashSet::new(),
            records: Vec::new(),
        }
    }

    /// Offers one received datagram from `source`.
    pub fn offer(&mut self, source: IpAddr, datagram: &[u8]) -> Admission {
        if source == self.local_ip {
            return Admission::OwnAddress;
        }

        let announcement = match decode_announcement(datagram) {
            Ok(a) => a,
            Err(e) => return Admission::Rejected(e),
        };

        if !self.seen.insert(source) {
            return Admission::Duplicate;
        }

        self.records.push(DiscoveryRecord {
            ip: source,
            port: announcement.signaling_port,
            display_name: announcement.display_name,
        });
        Admission::Accepted
    }

    /// Number of distinct peers collected so far.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// `true` when nothing has been collected.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Consumes the collector and returns the records in arrival order.
    pub fn finish(self) -> Vec<DiscoveryRecord> {
        self.records
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_is_discover_request_requires_exact_token() {
        assert!(is_discover_request(b"CLIPSCAPE_DISCOVER"));
        assert!(!is_discover_request(b"CLIPSCAPE_DISCOVER\n"));
        assert!(!is_discover_request(b"CLIPSCAPE_ANNOUNCE:x:1"));
    }

    #[test]
    fn test_decode_announcement_parses_name_and_port() {
        // Arrange
        let datagram = encode_announcement("office-pc", 9999);

        // Act
        let parsed = decode_announcement(&datagram).unwrap();

        // Assert
        assert_eq!(parsed.display_name, "office-pc");
        assert_eq!(parsed.signaling_port, 9999);
    }

    #[test]
    fn test_decode_announcement_allows_colons_in_name() {
        let parsed = decode_announcement(b"CLIPSCAPE_ANNOUNCE:host:with:colons:4000").unwrap();
        assert_eq!(parsed.display_name, "host:with:colons");
        assert_eq!(parsed.signaling_port, 4000);
    }

    #[test]
    fn test_decode_announcement_rejects_missing_prefix() {
        let result = decode_announcement(b"HELLO:desk:9999");
        assert_eq!(result, Err(ProtocolError::NotAnAnnouncement));
    }

    #[test]
    fn test_decode_announcement_rejects_bad_port() {
        let result = decode_announcement(b"CLIPSCAPE_ANNOUNCE:desk:99999");
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidField {
                field: "signaling_port",
                ..
            })
        ));
    }

    #[test]
    fn test_decode_announcement_rejects_invalid_utf8() {
        let result = decode_announcement(&[0xFF, 0xFE, 0x00]);
        assert_eq!(result, Err(ProtocolError::InvalidUtf8));
    }

    #[test]
    fn test_broadcast_targets_include_global_and_subnet() {
        // Act
        let targets = broadcast_targets(ip("192.168.1.37"), 9999);

        // Assert
        assert_eq!(
            targets,
            vec![
                "255.255.255.255:9999".parse::<SocketAddr>().unwrap(),
                "192.168.1.255:9999".parse::<SocketAddr>().unwrap(),
            ]
        );
    }

    #[test]
    fn test_broadcast_targets_skip_subnet_for_loopback() {
        let targets = broadcast_targets(ip("127.0.0.1"), 9999);
        assert_eq!(targets.len(), 1);
    }

    #[test]
    fn test_collector_never_records_local_ip() {
        // Arrange
        let local = ip("192.168.1.10");
        let mut collector = DiscoveryCollector::new(local);

        // Act
        let admission = collector.offer(local, &encode_announcement("me", 9999));

        // Assert
        assert_eq!(admission, Admission::OwnAddress);
        assert!(collector.is_empty());
    }

    #[test]
    fn test_collector_keeps_first_reply_per_ip() {
        // Arrange
        let mut collector = DiscoveryCollector::new(ip("192.168.1.10"));
        let peer = ip("192.168.1.20");

        // Act
        let first = collector.offer(peer, &encode_announcement("first", 9999));
        let second = collector.offer(peer, &encode_announcement("second", 7777));

        // Assert
        assert_eq!(first, Admission::Accepted);
        assert_eq!(second, Admission::Duplicate);
        let records = collector.finish();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].display_name, "first");
        assert_eq!(records[0].port, 9999);
    }

    #[test]
    fn test_collector_malformed_reply_does_not_claim_ip() {
        // A garbage reply must not block a later valid one from the same IP.
        let mut collector = DiscoveryCollector::new(ip("192.168.1.10"));
        let peer = ip("192.168.1.21");

        let bad = collector.offer(peer, b"CLIPSCAPE_DISCOVER");
        let good = collector.offer(peer, &encode_announcement("peer", 9999));

        assert!(matches!(bad, Admission::Rejected(_)));
        assert_eq!(good, Admission::Accepted);
        assert_eq!(collector.len(), 1);
    }

    #[test]
    fn test_rejected_admission_can_be_kept_for_reporting() {
        let mut collector = DiscoveryCollector::new(ip("192.168.1.10"));

        let rejected = collector.offer(ip("192.168.1.21"), b"garbage");
        let kept = rejected.clone();

        assert_eq!(kept, rejected);
        assert!(matches!(kept, Admission::Rejected(ProtocolError::NotAnAnnouncement)));
    }

    #[test]
    fn test_collector_preserves_arrival_order() {
        let mut collector = DiscoveryCollector::new(ip("10.0.0.1"));
        collector.offer(ip("10.0.0.3"), &encode_announcement("c", 1));
        collector.offer(ip("10.0.0.2"), &encode_announcement("b", 2));

        let names: Vec<_> = collector
            .finish()
            .into_iter()
            .map(|r| r.display_name)
            .collect();
        assert_eq!(names, vec!["c", "b"]);
    }
}
