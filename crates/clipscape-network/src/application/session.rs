//! PeerSession: one negotiated connection to a remote device.
//!
//! A session owns the open [`DataChannel`], the heartbeat timestamps, and the
//! chunk reassembly buffer for that peer.  It is mutated only by the
//! coordinator, so none of its fields need locking.
//!
//! # Inbound dispatch
//!
//! Every raw string from the channel goes through [`PeerSession::handle_text`]:
//!
//! | Wire message   | Effect                                       |
//! |----------------|----------------------------------------------|
//! | `__PING__`     | reply `__PONG__` immediately                 |
//! | `__PONG__`     | advance `last_pong_received_at`              |
//! | `__CHUNK__...` | buffer; return the message once complete     |
//! | anything else  | return as-is                                 |
//!
//! Only returned strings reach the application.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clipscape_core::protocol::channel::{split_message, PING, PONG};
use clipscape_core::{
    ChannelMessage, ChunkReassembler, InvalidTransition, PeerId, PeerInfo, SessionRole,
    SessionState,
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::application::transport::DataChannel;

/// Live state of the connection to one peer.
pub struct PeerSession {
    id: PeerId,
    display_name: String,
    role: SessionRole,
    state: SessionState,
    attempt: u64,
    channel: Option<Arc<dyn DataChannel>>,
    last_ping_sent_at: Option<Instant>,
    last_pong_received_at: Option<Instant>,
    reassembler: ChunkReassembler,
    /// Raw messages that arrived before the session was marked connected.
    backlog: Vec<String>,
}

impl PeerSession {
    /// Creates a session in the `New` state.
    ///
    /// `attempt` distinguishes this session from earlier or later sessions
    /// with the same peer; handshake results carrying another attempt number
    /// are ignored.
    pub fn new(id: PeerId, display_name: impl Into<String>, role: SessionRole, attempt: u64) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            role,
            state: SessionState::New,
            attempt,
            channel: None,
            last_ping_sent_at: None,
            last_pong_received_at: None,
            reassembler: ChunkReassembler::new(),
            backlog: Vec::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn set_display_name(&mut self, name: impl Into<String>) {
        self.display_name = name.into();
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn last_ping_sent_at(&self) -> Option<Instant> {
        self.last_ping_sent_at
    }

    pub fn last_pong_received_at(&self) -> Option<Instant> {
        self.last_pong_received_at
    }

    /// Snapshot handed to other threads.
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            display_name: self.display_name.clone(),
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// `New -> Negotiating`.
    pub fn begin_negotiation(&mut self) -> Result<(), InvalidTransition> {
        self.state = self.state.transition(SessionState::Negotiating)?;
        Ok(())
    }

    /// Moves to `Connected` with an open channel.
    ///
    /// The pong clock starts at `now` so the session survives until its first
    /// heartbeat round.
    pub fn mark_connected(
        &mut self,
        channel: Arc<dyn DataChannel>,
        now: Instant,
    ) -> Result<(), InvalidTransition> {
        self.state = self.state.transition(SessionState::Connected)?;
        self.channel = Some(channel);
        self.last_pong_received_at = Some(now);
        Ok(())
    }

    /// Closes the session normally.
    pub async fn close(&mut self) {
        self.finish(SessionState::Closed).await;
    }

    /// Closes the session after a handshake or liveness failure.
    pub async fn fail(&mut self) {
        self.finish(SessionState::Failed).await;
    }

    async fn finish(&mut self, terminal: SessionState) {
        if let Ok(next) = self.state.transition(terminal) {
            self.state = next;
        }
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        self.reassembler.clear();
        self.backlog.clear();
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    /// Sends one logical message, chunking it if needed.
    ///
    /// Returns `false` if the session is not connected or any piece fails to
    /// send.
    pub async fn send_message(&self, message: &str) -> bool {
        let Some(channel) = self.open_channel() else {
            debug!(peer = %self.id, "cannot send: session not connected");
            return false;
        };

        for piece in split_message(message) {
            if let Err(e) = channel.send_text(piece).await {
                warn!(peer = %self.id, "send failed: {e}");
                return false;
            }
        }
        true
    }

    /// Serializes `value` as JSON and sends it like any other message.
    pub async fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(text) => self.send_message(&text).await,
            Err(e) => {
                warn!(peer = %self.id, "cannot serialize JSON payload: {e}");
                false
            }
        }
    }

    /// Sends a heartbeat request.
    pub async fn ping(&mut self, now: Instant) {
        let Some(channel) = self.open_channel() else {
            return;
        };
        match channel.send_text(PING.to_string()).await {
            Ok(()) => self.last_ping_sent_at = Some(now),
            Err(e) => debug!(peer = %self.id, "ping failed: {e}"),
        }
    }

    fn open_channel(&self) -> Option<Arc<dyn DataChannel>> {
        if self.is_connected() {
            self.channel.clone()
        } else {
            None
        }
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    /// Processes one raw inbound string and returns the application message,
    /// if any.
    pub async fn handle_text(&mut self, text: &str, now: Instant) -> Option<String> {
        let message = match ChannelMessage::decode(text) {
            Ok(m) => m,
            Err(e) => {
                debug!(peer = %self.id, "dropping malformed channel message: {e}");
                return None;
            }
        };

        match message {
            ChannelMessage::Ping => {
                if let Some(channel) = self.open_channel() {
                    if let Err(e) = channel.send_text(PONG.to_string()).await {
                        debug!(peer = %self.id, "pong failed: {e}");
                    }
                }
                None
            }
            ChannelMessage::Pong => {
                self.record_pong(now);
                None
            }
            ChannelMessage::Chunk(envelope) => match self.reassembler.accept_at(envelope, now) {
                Ok(complete) => complete,
                Err(e) => {
                    debug!(peer = %self.id, "dropping chunk: {e}");
                    None
                }
            },
            ChannelMessage::Plain(text) => Some(text),
        }
    }

    /// Advances the pong clock.  Never moves it backwards.
    pub fn record_pong(&mut self, now: Instant) {
        if !self.is_connected() {
            return;
        }
        self.last_pong_received_at = Some(match self.last_pong_received_at {
            Some(previous) => previous.max(now),
            None => now,
        });
    }

    /// `true` when connected and no pong arrived for longer than `timeout`.
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        match (self.is_connected(), self.last_pong_received_at) {
            (true, Some(last)) => now.saturating_duration_since(last) > timeout,
            _ => false,
        }
    }

    /// Drops incomplete chunk sets older than `max_age`.
    pub fn prune_chunks(&mut self, now: Instant, max_age: Duration) -> usize {
        self.reassembler.prune_stale(now, max_age)
    }

    pub fn pending_chunk_sets(&self) -> usize {
        self.reassembler.pending()
    }

    /// Holds a raw message that arrived while still negotiating.
    pub fn push_backlog(&mut self, text: String) {
        self.backlog.push(text);
    }

    /// Takes all held messages in arrival order.
    pub fn take_backlog(&mut self) -> Vec<String> {
        std::mem::take(&mut self.backlog)
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("attempt", &self.attempt)
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::transport::{MockDataChannel, TransportError};
    use clipscape_core::protocol::channel::{split_message_with, CHUNK_PREFIX};
    use clipscape_core::CHUNK_SIZE;
    use std::sync::Mutex;

    fn peer() -> PeerId {
        "192.168.1.20:9999".parse().unwrap()
    }

    fn connected_session(channel: MockDataChannel, now: Instant) -> PeerSession {
        let mut session = PeerSession::new(peer(), "desk", SessionRole::Offerer, 1);
        session.begin_negotiation().unwrap();
        session.mark_connected(Arc::new(channel), now).unwrap();
        session
    }

    /// A mock channel that records every wire string it is asked to send.
    fn recording_channel(sent: Arc<Mutex<Vec<String>>>) -> MockDataChannel {
        let mut channel = MockDataChannel::new();
        channel.expect_send_text().returning(move |text| {
            sent.lock().unwrap().push(text);
            Ok(())
        });
        channel.expect_close().returning(|| ());
        channel
    }

    #[test]
    fn test_new_session_starts_in_new_state() {
        let session = PeerSession::new(peer(), "desk", SessionRole::Answerer, 7);
        assert_eq!(session.state(), SessionState::New);
        assert_eq!(session.role(), SessionRole::Answerer);
        assert_eq!(session.attempt(), 7);
        assert!(session.last_pong_received_at().is_none());
    }

    #[test]
    fn test_mark_connected_initialises_pong_clock() {
        // Arrange
        let now = Instant::now();

        // Act
        let session = connected_session(MockDataChannel::new(), now);

        // Assert
        assert!(session.is_connected());
        assert_eq!(session.last_pong_received_at(), Some(now));
        assert!(!session.is_stale(now + Duration::from_secs(20), Duration::from_secs(20)));
    }

    #[test]
    fn test_mark_connected_from_new_skips_nothing_illegal() {
        // New -> Connected is a forward move and allowed.
        let mut session = PeerSession::new(peer(), "desk", SessionRole::Offerer, 1);
        assert!(session
            .mark_connected(Arc::new(MockDataChannel::new()), Instant::now())
            .is_ok());
    }

    #[tokio::test]
    async fn test_small_message_is_sent_as_one_piece() {
        // Arrange
        let sent = Arc::new(Mutex::new(Vec::new()));
        let session = connected_session(recording_channel(Arc::clone(&sent)), Instant::now());

        // Act
        let ok = session.send_message("hello").await;

        // Assert
        assert!(ok);
        assert_eq!(*sent.lock().unwrap(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_large_message_is_chunked() {
        // Arrange
        let sent = Arc::new(Mutex::new(Vec::new()));
        let session = connected_session(recording_channel(Arc::clone(&sent)), Instant::now());
        let message = "z".repeat(CHUNK_SIZE * 2 + 1);

        // Act
        assert!(session.send_message(&message).await);

        // Assert
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|s| s.starts_with(CHUNK_PREFIX)));
    }

    #[tokio::test]
    async fn test_send_fails_when_not_connected() {
        // The mock has no expectations: any send would panic.
        let session = PeerSession::new(peer(), "desk", SessionRole::Offerer, 1);
        assert!(!session.send_message("hello").await);
    }

    #[tokio::test]
    async fn test_send_reports_transport_failure() {
        // Arrange
        let mut channel = MockDataChannel::new();
        channel
            .expect_send_text()
            .returning(|_| Err(TransportError::NotOpen));
        let session = connected_session(channel, Instant::now());

        // Act / Assert
        assert!(!session.send_message("hello").await);
    }

    #[tokio::test]
    async fn test_send_json_serializes_value() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let session = connected_session(recording_channel(Arc::clone(&sent)), Instant::now());

        assert!(session.send_json(&serde_json::json!({"kind": "text"})).await);

        assert_eq!(*sent.lock().unwrap(), vec![r#"{"kind":"text"}"#.to_string()]);
    }

    #[tokio::test]
    async fn test_ping_is_answered_with_pong_and_not_delivered() {
        // Arrange
        let mut channel = MockDataChannel::new();
        channel
            .expect_send_text()
            .withf(|text| text == PONG)
            .times(1)
            .returning(|_| Ok(()));
        let mut session = connected_session(channel, Instant::now());

        // Act
        let delivered = session.handle_text(PING, Instant::now()).await;

        // Assert
        assert_eq!(delivered, None);
    }

    #[tokio::test]
    async fn test_pong_advances_clock_monotonically() {
        // Arrange
        let start = Instant::now();
        let mut session = connected_session(MockDataChannel::new(), start);
        let later = start + Duration::from_secs(10);

        // Act
        session.handle_text(PONG, later).await;
        session.record_pong(start + Duration::from_secs(5));

        // Assert
        assert_eq!(session.last_pong_received_at(), Some(later));
    }

    #[tokio::test]
    async fn test_plain_text_is_delivered() {
        let mut session = connected_session(MockDataChannel::new(), Instant::now());
        let delivered = session.handle_text("clipboard", Instant::now()).await;
        assert_eq!(delivered, Some("clipboard".to_string()));
    }

    #[tokio::test]
    async fn test_chunks_are_reassembled_before_delivery() {
        // Arrange
        let mut session = connected_session(MockDataChannel::new(), Instant::now());
        let original = "abcdefghij".repeat(10);
        let pieces = split_message_with(&original, "feedbeef", 30);

        // Act
        let mut delivered = Vec::new();
        for piece in pieces.iter().rev() {
            if let Some(m) = session.handle_text(piece, Instant::now()).await {
                delivered.push(m);
            }
        }

        // Assert
        assert_eq!(delivered, vec![original]);
        assert_eq!(session.pending_chunk_sets(), 0);
    }

    #[tokio::test]
    async fn test_malformed_chunk_is_dropped() {
        let mut session = connected_session(MockDataChannel::new(), Instant::now());
        let delivered = session.handle_text("__CHUNK__{broken", Instant::now()).await;
        assert_eq!(delivered, None);
        assert_eq!(session.pending_chunk_sets(), 0);
    }

    #[test]
    fn test_is_stale_after_timeout() {
        let now = Instant::now();
        let session = connected_session(MockDataChannel::new(), now);
        let timeout = Duration::from_secs(20);

        assert!(!session.is_stale(now + timeout, timeout));
        assert!(session.is_stale(now + timeout + Duration::from_millis(1), timeout));
    }

    #[tokio::test]
    async fn test_close_releases_channel_and_is_terminal() {
        // Arrange
        let mut channel = MockDataChannel::new();
        channel.expect_close().times(1).returning(|| ());
        let mut session = connected_session(channel, Instant::now());
        session.push_backlog("held".to_string());

        // Act
        session.close().await;
        session.close().await;

        // Assert
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.take_backlog().is_empty());
        assert!(!session.send_message("x").await);
    }

    #[tokio::test]
    async fn test_fail_from_negotiating() {
        let mut session = PeerSession::new(peer(), "desk", SessionRole::Offerer, 1);
        session.begin_negotiation().unwrap();
        session.fail().await;
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_backlog_preserves_arrival_order() {
        let mut session = PeerSession::new(peer(), "desk", SessionRole::Answerer, 1);
        session.push_backlog("one".to_string());
        session.push_backlog("two".to_string());
        assert_eq!(session.take_backlog(), vec!["one", "two"]);
        assert!(session.take_backlog().is_empty());
    }
}
