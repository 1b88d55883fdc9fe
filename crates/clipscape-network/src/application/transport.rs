//! The negotiation seam between the coordinator and a data-channel transport.
//!
//! # Roles (for beginners)
//!
//! Opening a data channel takes two steps on each side:
//!
//! ```text
//! offerer                                   answerer
//! ───────                                   ────────
//! Negotiator::create_offer ──offer sdp──►   Negotiator::create_answer
//! apply_remote_answer      ◄─answer sdp──
//! wait_open                                 wait_open
//! ```
//!
//! The session descriptions are opaque strings; the signaling layer carries
//! them over TCP.  Once `wait_open` returns, the caller owns an open
//! [`DataChannel`] and every inbound message or close notification arrives
//! through the [`ChannelSink`] supplied at creation time.
//!
//! Two implementations exist: WebRTC data channels for real networks and an
//! in-process loopback used by tests.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Error type for negotiation and channel operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Creating or applying a session description failed.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// The channel did not open in time.
    #[error("data channel did not open within {0:?}")]
    OpenTimeout(Duration),

    /// The channel is closed or was never opened.
    #[error("data channel is not open")]
    NotOpen,

    /// The transport rejected an outbound message.
    #[error("send failed: {0}")]
    Send(String),
}

/// Something that happened on an open (or opening) data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// One raw text message, before control-token and chunk decoding.
    Message(String),
    /// The remote side or the transport closed the channel.
    Closed,
}

/// Callback through which a transport reports [`ChannelEvent`]s.
///
/// Transports may call [`deliver`](Self::deliver) from any thread or task.
#[derive(Clone)]
pub struct ChannelSink(Arc<dyn Fn(ChannelEvent) + Send + Sync>);

impl ChannelSink {
    pub fn new(f: impl Fn(ChannelEvent) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn deliver(&self, event: ChannelEvent) {
        (self.0)(event)
    }
}

impl fmt::Debug for ChannelSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChannelSink")
    }
}

/// Factory for negotiations.  One instance serves every handshake of a node.
#[async_trait]
pub trait Negotiator: Send + Sync {
    /// Starts an offerer-side negotiation and produces the local offer.
    async fn create_offer(&self, sink: ChannelSink) -> Result<Box<dyn Negotiation>, TransportError>;

    /// Starts an answerer-side negotiation from the remote offer.
    async fn create_answer(
        &self,
        offer_sdp: &str,
        sink: ChannelSink,
    ) -> Result<Box<dyn Negotiation>, TransportError>;
}

/// One in-progress negotiation.
#[async_trait]
pub trait Negotiation: Send {
    /// The description to send to the other side (offer or answer).
    fn local_description(&self) -> &str;

    /// Offerer only: applies the answer received from the remote side.
    async fn apply_remote_answer(&mut self, sdp: &str) -> Result<(), TransportError>;

    /// Waits until the data channel is open.  Releases transport resources on
    /// failure.
    async fn wait_open(self: Box<Self>, limit: Duration) -> Result<Arc<dyn DataChannel>, TransportError>;

    /// Abandons the negotiation and releases transport resources.
    async fn abort(self: Box<Self>);
}

/// An open, bidirectional text channel to one peer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Sends one raw wire string.
    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    /// Closes the channel.  Safe to call more than once.
    async fn close(&self);
}

// ── Tests ─────────────────────────────────────────────────────────────────────
