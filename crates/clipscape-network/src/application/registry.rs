//! PeerRegistry: the coordinator's map of peer identifier to [`PeerSession`].
//!
//! The registry is owned by the coordinator actor and never shared, so it
//! needs no lock.  Other threads only ever see copies from
//! [`PeerRegistry::connected`].
//!
//! # Tickets
//!
//! Handshakes run concurrently with the actor.  When one finishes, the result
//! must be applied only if the session it started is still the current one
//! for that peer.  Every session therefore gets a fresh attempt number, and
//! handshakes carry a [`SessionTicket`] `(id, attempt)`.  A result whose
//! ticket no longer matches is stale and is discarded.
//!
//! # Simultaneous offers
//!
//! When A and B offer to each other at the same moment, each side sees an
//! inbound offer for a peer it is already offering to.  The side whose own
//! identifier (as the remote sees it) sorts lower keeps the offerer role and
//! refuses the inbound offer; the other side abandons its offer and answers.
//! Both sides compute the same comparison, so exactly one session survives.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clipscape_core::{PeerId, PeerInfo, SessionRole, SessionState};
use tracing::debug;

use crate::application::session::PeerSession;
use crate::application::transport::DataChannel;

/// Identifies one handshake attempt for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionTicket {
    pub id: PeerId,
    pub attempt: u64,
}

/// Outcome of admitting an inbound offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundDecision {
    /// Answer it under this ticket.
    Accept(SessionTicket),
    /// A connected session already exists for this identifier.
    RejectConnected,
    /// We are already answering an offer from this identifier.
    RejectInFlight,
    /// We are offering to this peer and our identifier sorts lower.
    RejectTieBreak,
    /// The offer came from ourselves.
    RejectSelf,
}

impl InboundDecision {
    /// Short reason used in logs when the offer is refused.
    pub fn reason(&self) -> &'static str {
        match self {
            InboundDecision::Accept(_) => "accepted",
            InboundDecision::RejectConnected => "already connected",
            InboundDecision::RejectInFlight => "handshake already in flight",
            InboundDecision::RejectTieBreak => "simultaneous offer, keeping offerer role",
            InboundDecision::RejectSelf => "offer from self",
        }
    }
}

/// Result of applying a finished handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Establishment {
    /// The session is now connected.
    Connected(PeerInfo),
    /// The ticket no longer matches a negotiating session.
    Stale,
}

/// In-memory map of every session this node currently knows about.
#[derive(Debug)]
pub struct PeerRegistry {
    local_id: PeerId,
    sessions: HashMap<PeerId, PeerSession>,
    next_attempt: u64,
}

impl PeerRegistry {
    /// Creates an empty registry for the node identified by `local_id`.
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            sessions: HashMap::new(),
            next_attempt: 1,
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerSession> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &PeerId) -> Option<&mut PeerSession> {
        self.sessions.get_mut(id)
    }

    pub fn is_connected(&self, id: &PeerId) -> bool {
        self.sessions.get(id).is_some_and(PeerSession::is_connected)
    }

    /// `true` while a handshake with `id` is still running.
    pub fn is_negotiating(&self, id: &PeerId) -> bool {
        self.sessions
            .get(id)
            .is_some_and(|s| matches!(s.state(), SessionState::New | SessionState::Negotiating))
    }

    fn insert_negotiating(&mut self, id: PeerId, display_name: String, role: SessionRole) -> SessionTicket {
        let attempt = self.next_attempt;
        self.next_attempt += 1;

        let mut session = PeerSession::new(id, display_name, role, attempt);
        // A brand-new session is always allowed to start negotiating.
        let _ = session.begin_negotiation();
        self.sessions.insert(id, session);
        SessionTicket { id, attempt }
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    /// Reserves an offerer session for a discovered peer.
    ///
    /// Returns `None` when the peer is ourselves, already connected, or a
    /// handshake with it is in flight.  A leftover session in any other state
    /// is discarded and replaced.
    pub fn plan_offer(&mut self, id: PeerId, display_name: impl Into<String>) -> Option<SessionTicket> {
        if id == self.local_id {
            return None;
        }

        if let Some(existing) = self.sessions.get(&id) {
            match existing.state() {
                SessionState::Connected => return None,
                SessionState::New | SessionState::Negotiating => {
                    debug!(peer = %id, "handshake already in flight, not offering");
                    return None;
                }
                SessionState::Closed | SessionState::Failed => {
                    debug!(peer = %id, "replacing stale session");
                    self.sessions.remove(&id);
                }
            }
        }

        Some(self.insert_negotiating(id, display_name.into(), SessionRole::Offerer))
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    /// Decides whether to answer an inbound offer from `id`.
    ///
    /// `local_seen` is our own identifier as the remote addressed us (the
    /// local address of the signaling connection plus our port).  It is used
    /// for self-detection and the simultaneous-offer tie-break.
    pub fn decide_inbound(
        &mut self,
        id: PeerId,
        display_name: impl Into<String>,
        local_seen: PeerId,
    ) -> InboundDecision {
        if id == local_seen || id == self.local_id {
            return InboundDecision::RejectSelf;
        }

        if let Some(existing) = self.sessions.get(&id) {
            match (existing.state(), existing.role()) {
                (SessionState::Connected, _) => return InboundDecision::RejectConnected,
                (SessionState::New | SessionState::Negotiating, SessionRole::Answerer) => {
                    return InboundDecision::RejectInFlight
                }
                (SessionState::New | SessionState::Negotiating, SessionRole::Offerer) => {
                    if local_seen < id {
                        return InboundDecision::RejectTieBreak;
                    }
                    debug!(peer = %id, "simultaneous offer, yielding offerer role");
                    self.sessions.remove(&id);
                }
                (SessionState::Closed | SessionState::Failed, _) => {
                    self.sessions.remove(&id);
                }
            }
        }

        InboundDecision::Accept(self.insert_negotiating(id, display_name.into(), SessionRole::Answerer))
    }

    // ── Handshake results ─────────────────────────────────────────────────────

    /// Looks up the session a ticket refers to, if it is still current.
    pub fn session_for(&mut self, ticket: SessionTicket) -> Option<&mut PeerSession> {
        self.sessions
            .get_mut(&ticket.id)
            .filter(|s| s.attempt() == ticket.attempt)
    }

    /// Marks the ticket's session connected with its open channel.
    ///
    /// `display_name` replaces the name recorded at planning time when the
    /// remote reported one during the handshake.
    pub fn establish(
        &mut self,
        ticket: SessionTicket,
        display_name: Option<String>,
        channel: Arc<dyn DataChannel>,
        now: Instant,
    ) -> Establishment {
        let Some(session) = self.session_for(ticket) else {
            return Establishment::Stale;
        };
        if session.state() != SessionState::Negotiating {
            return Establishment::Stale;
        }
        if let Some(name) = display_name {
            session.set_display_name(name);
        }
        match session.mark_connected(channel, now) {
            Ok(()) => Establishment::Connected(session.info()),
            Err(_) => Establishment::Stale,
        }
    }

    /// Drops the ticket's session after a failed handshake.
    ///
    /// Returns `false` if the ticket is stale or the session already
    /// connected through another path.
    pub fn fail(&mut self, ticket: SessionTicket) -> bool {
        let removable = self
            .session_for(ticket)
            .is_some_and(|session| !session.is_connected());
        if removable {
            self.sessions.remove(&ticket.id);
        }
        removable
    }

    // ── Bulk access ───────────────────────────────────────────────────────────

    pub fn remove(&mut self, id: &PeerId) -> Option<PeerSession> {
        self.sessions.remove(id)
    }

    /// Copies of every connected peer, ordered by identifier.
    pub fn connected(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .sessions
            .values()
            .filter(|s| s.is_connected())
            .map(PeerSession::info)
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    /// Mutable access to every connected session.
    pub fn connected_sessions_mut(&mut self) -> impl Iterator<Item = &mut PeerSession> {
        self.sessions.values_mut().filter(|s| s.is_connected())
    }

    /// Connected peers whose last pong is older than `timeout`.
    pub fn stale_peers(&self, now: Instant, timeout: Duration) -> Vec<PeerId> {
        self.sessions
            .values()
            .filter(|s| s.is_stale(now, timeout))
            .map(PeerSession::id)
            .collect()
    }

    /// Removes and returns every session.
    pub fn drain(&mut self) -> Vec<PeerSession> {
        self.sessions.drain().map(|(_, s)| s).collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::transport::MockDataChannel;

    fn id(s: &str) -> PeerId {
        s.parse().unwrap()
    }

    fn local() -> PeerId {
        id("192.168.1.10:9999")
    }

    fn channel() -> Arc<dyn DataChannel> {
        Arc::new(MockDataChannel::new())
    }

    fn connect(registry: &mut PeerRegistry, peer: PeerId, now: Instant) -> SessionTicket {
        let ticket = registry.plan_offer(peer, "peer").unwrap();
        assert!(matches!(
            registry.establish(ticket, None, channel(), now),
            Establishment::Connected(_)
        ));
        ticket
    }

    // ── plan_offer ────────────────────────────────────────────────────────────

    #[test]
    fn test_plan_offer_creates_negotiating_offerer() {
        // Arrange
        let mut registry = PeerRegistry::new(local());
        let peer = id("192.168.1.20:9999");

        // Act
        let ticket = registry.plan_offer(peer, "desk").unwrap();

        // Assert
        let session = registry.get(&peer).unwrap();
        assert_eq!(ticket.id, peer);
        assert_eq!(session.state(), SessionState::Negotiating);
        assert_eq!(session.role(), SessionRole::Offerer);
    }

    #[test]
    fn test_plan_offer_skips_self() {
        let mut registry = PeerRegistry::new(local());
        assert_eq!(registry.plan_offer(local(), "me"), None);
    }

    #[test]
    fn test_plan_offer_skips_connected_peer() {
        let mut registry = PeerRegistry::new(local());
        let peer = id("192.168.1.20:9999");
        connect(&mut registry, peer, Instant::now());

        assert_eq!(registry.plan_offer(peer, "desk"), None);
        assert_eq!(registry.connected().len(), 1);
    }

    #[test]
    fn test_is_negotiating_tracks_handshake_lifetime() {
        // Arrange
        let mut registry = PeerRegistry::new(local());
        let peer = id("192.168.1.20:9999");

        // Act
        let ticket = registry.plan_offer(peer, "desk").unwrap();
        let during = registry.is_negotiating(&peer);
        registry.establish(ticket, None, channel(), Instant::now());

        // Assert
        assert!(during);
        assert!(!registry.is_negotiating(&peer));
        assert!(!registry.is_negotiating(&id("192.168.1.99:9999")));
    }

    #[test]
    fn test_plan_offer_skips_in_flight_handshake() {
        let mut registry = PeerRegistry::new(local());
        let peer = id("192.168.1.20:9999");
        registry.plan_offer(peer, "desk").unwrap();

        assert_eq!(registry.plan_offer(peer, "desk"), None);
    }

    #[test]
    fn test_each_plan_gets_a_new_attempt() {
        // Arrange
        let mut registry = PeerRegistry::new(local());
        let peer = id("192.168.1.20:9999");
        let first = registry.plan_offer(peer, "desk").unwrap();
        registry.fail(first);

        // Act
        let second = registry.plan_offer(peer, "desk").unwrap();

        // Assert
        assert_ne!(first.attempt, second.attempt);
    }

    // ── decide_inbound ────────────────────────────────────────────────────────

    #[test]
    fn test_inbound_offer_accepted_for_unknown_peer() {
        let mut registry = PeerRegistry::new(local());
        let peer = id("192.168.1.20:9999");

        let decision = registry.decide_inbound(peer, "desk", local());

        assert!(matches!(decision, InboundDecision::Accept(t) if t.id == peer));
        assert_eq!(registry.get(&peer).unwrap().role(), SessionRole::Answerer);
    }

    #[test]
    fn test_inbound_offer_rejected_when_connected() {
        // Arrange
        let mut registry = PeerRegistry::new(local());
        let peer = id("192.168.1.20:9999");
        connect(&mut registry, peer, Instant::now());

        // Act
        let decision = registry.decide_inbound(peer, "desk", local());

        // Assert
        assert_eq!(decision, InboundDecision::RejectConnected);
        assert!(registry.is_connected(&peer), "existing session must survive");
    }

    #[test]
    fn test_duplicate_inbound_offer_rejected() {
        let mut registry = PeerRegistry::new(local());
        let peer = id("192.168.1.20:9999");
        registry.decide_inbound(peer, "desk", local());

        assert_eq!(
            registry.decide_inbound(peer, "desk", local()),
            InboundDecision::RejectInFlight
        );
    }

    #[test]
    fn test_inbound_offer_from_self_rejected() {
        let mut registry = PeerRegistry::new(local());
        let seen = id("127.0.0.1:9999");
        assert_eq!(
            registry.decide_inbound(seen, "me", seen),
            InboundDecision::RejectSelf
        );
    }

    #[test]
    fn test_tie_break_lower_side_keeps_offer() {
        // Arrange: we (…10) sort lower than the peer (…20).
        let mut registry = PeerRegistry::new(local());
        let peer = id("192.168.1.20:9999");
        let offer = registry.plan_offer(peer, "desk").unwrap();

        // Act
        let decision = registry.decide_inbound(peer, "desk", local());

        // Assert
        assert_eq!(decision, InboundDecision::RejectTieBreak);
        assert!(registry.session_for(offer).is_some());
    }

    #[test]
    fn test_tie_break_higher_side_yields_and_answers() {
        // Arrange: we (…30) sort higher than the peer (…20).
        let me = id("192.168.1.30:9999");
        let mut registry = PeerRegistry::new(me);
        let peer = id("192.168.1.20:9999");
        let offer = registry.plan_offer(peer, "desk").unwrap();

        // Act
        let decision = registry.decide_inbound(peer, "desk", me);

        // Assert
        let InboundDecision::Accept(answer) = decision else {
            panic!("expected accept, got {decision:?}");
        };
        assert!(registry.session_for(offer).is_none(), "offer must be superseded");
        assert_eq!(registry.get(&peer).unwrap().role(), SessionRole::Answerer);
        assert_ne!(offer.attempt, answer.attempt);
    }

    #[test]
    fn test_both_sides_agree_on_tie_break() {
        // Arrange
        let a = id("10.0.0.1:9999");
        let b = id("10.0.0.2:9999");
        let mut reg_a = PeerRegistry::new(a);
        let mut reg_b = PeerRegistry::new(b);
        reg_a.plan_offer(b, "b").unwrap();
        reg_b.plan_offer(a, "a").unwrap();

        // Act
        let at_a = reg_a.decide_inbound(b, "b", a);
        let at_b = reg_b.decide_inbound(a, "a", b);

        // Assert: exactly one side answers.
        assert_eq!(at_a, InboundDecision::RejectTieBreak);
        assert!(matches!(at_b, InboundDecision::Accept(_)));
    }

    // ── establish / fail ──────────────────────────────────────────────────────

    #[test]
    fn test_establish_stale_ticket_is_ignored() {
        // Arrange
        let me = id("192.168.1.30:9999");
        let mut registry = PeerRegistry::new(me);
        let peer = id("192.168.1.20:9999");
        let offer = registry.plan_offer(peer, "desk").unwrap();
        registry.decide_inbound(peer, "desk", me);

        // Act
        let result = registry.establish(offer, None, channel(), Instant::now());

        // Assert
        assert_eq!(result, Establishment::Stale);
        assert!(!registry.is_connected(&peer));
    }

    #[test]
    fn test_establish_updates_display_name() {
        let mut registry = PeerRegistry::new(local());
        let peer = id("192.168.1.20:9999");
        let ticket = registry.plan_offer(peer, "from-discovery").unwrap();

        let result = registry.establish(ticket, Some("from-answer".to_string()), channel(), Instant::now());

        assert_eq!(
            result,
            Establishment::Connected(PeerInfo {
                id: peer,
                display_name: "from-answer".to_string()
            })
        );
    }

    #[test]
    fn test_establish_twice_is_stale() {
        let mut registry = PeerRegistry::new(local());
        let peer = id("192.168.1.20:9999");
        let ticket = connect(&mut registry, peer, Instant::now());

        assert_eq!(
            registry.establish(ticket, None, channel(), Instant::now()),
            Establishment::Stale
        );
    }

    #[test]
    fn test_fail_with_stale_ticket_keeps_current_session() {
        // Arrange
        let me = id("192.168.1.30:9999");
        let mut registry = PeerRegistry::new(me);
        let peer = id("192.168.1.20:9999");
        let offer = registry.plan_offer(peer, "desk").unwrap();
        registry.decide_inbound(peer, "desk", me);

        // Act
        let removed = registry.fail(offer);

        // Assert
        assert!(!removed);
        assert!(registry.get(&peer).is_some());
    }

    #[test]
    fn test_fail_never_removes_connected_session() {
        let mut registry = PeerRegistry::new(local());
        let peer = id("192.168.1.20:9999");
        let ticket = connect(&mut registry, peer, Instant::now());

        assert!(!registry.fail(ticket));
        assert!(registry.is_connected(&peer));
    }

    // ── snapshots / liveness ──────────────────────────────────────────────────

    #[test]
    fn test_connected_snapshot_excludes_negotiating_and_is_sorted() {
        // Arrange
        let mut registry = PeerRegistry::new(local());
        let now = Instant::now();
        connect(&mut registry, id("192.168.1.40:9999"), now);
        connect(&mut registry, id("192.168.1.20:9999"), now);
        registry.plan_offer(id("192.168.1.30:9999"), "pending");

        // Act
        let peers: Vec<PeerId> = registry.connected().into_iter().map(|p| p.id).collect();

        // Assert
        assert_eq!(peers, vec![id("192.168.1.20:9999"), id("192.168.1.40:9999")]);
    }

    #[test]
    fn test_stale_peers_reports_only_silent_sessions() {
        // Arrange
        let mut registry = PeerRegistry::new(local());
        let start = Instant::now();
        let quiet = id("192.168.1.20:9999");
        let chatty = id("192.168.1.21:9999");
        connect(&mut registry, quiet, start);
        connect(&mut registry, chatty, start);
        let later = start + Duration::from_secs(21);
        registry.get_mut(&chatty).unwrap().record_pong(later);

        // Act
        let stale = registry.stale_peers(later, Duration::from_secs(20));

        // Assert
        assert_eq!(stale, vec![quiet]);
    }

    #[test]
    fn test_drain_empties_registry() {
        let mut registry = PeerRegistry::new(local());
        connect(&mut registry, id("192.168.1.20:9999"), Instant::now());
        registry.plan_offer(id("192.168.1.21:9999"), "x");

        let drained = registry.drain();

        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }
}
