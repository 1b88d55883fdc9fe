//! In-process negotiator: both ends of every channel live in this process.
//!
//! Session descriptions are tokens (`loopback:offer:<n>` / `loopback:answer:<n>`)
//! that index a shared table, so two nodes built with clones of the same
//! [`LoopbackNegotiator`] can complete the real TCP signaling exchange and
//! then talk over a channel that is nothing more than a pair of sinks.
//!
//! The channel opens when the offerer applies the answer, which mirrors the
//! ordering of a real data channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::application::transport::{
    ChannelEvent, ChannelSink, DataChannel, Negotiation, Negotiator, TransportError,
};

const OFFER_PREFIX: &str = "loopback:offer:";
const ANSWER_PREFIX: &str = "loopback:answer:";

/// Negotiator whose channels never leave the process.
///
/// Clones share the same offer table.
#[derive(Clone, Default)]
pub struct LoopbackNegotiator {
    offers: Arc<Mutex<HashMap<u64, PendingOffer>>>,
    next_token: Arc<AtomicU64>,
}

struct PendingOffer {
    offerer_sink: ChannelSink,
    answered: Option<Answered>,
}

struct Answered {
    offerer_channel: Arc<LoopbackChannel>,
    open: oneshot::Sender<()>,
}

impl LoopbackNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers created but not yet completed or aborted.
    pub fn pending_offers(&self) -> usize {
        self.table().len()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<u64, PendingOffer>> {
        self.offers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for LoopbackNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackNegotiator")
            .field("pending_offers", &self.pending_offers())
            .finish()
    }
}

fn parse_token(sdp: &str, prefix: &str) -> Result<u64, TransportError> {
    sdp.strip_prefix(prefix)
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| TransportError::Negotiation(format!("not a loopback description: {sdp:?}")))
}

#[async_trait]
impl Negotiator for LoopbackNegotiator {
    async fn create_offer(&self, sink: ChannelSink) -> Result<Box<dyn Negotiation>, TransportError> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.table().insert(
            token,
            PendingOffer {
                offerer_sink: sink,
                answered: None,
            },
        );

        Ok(Box::new(OfferSide {
            negotiator: self.clone(),
            token,
            description: format!("{OFFER_PREFIX}{token}"),
            channel: None,
        }))
    }

    async fn create_answer(
        &self,
        offer_sdp: &str,
        sink: ChannelSink,
    ) -> Result<Box<dyn Negotiation>, TransportError> {
        let token = parse_token(offer_sdp, OFFER_PREFIX)?;
        let mut table = self.table();
        let pending = table
            .get_mut(&token)
            .filter(|p| p.answered.is_none())
            .ok_or_else(|| TransportError::Negotiation(format!("offer {token} is unknown or already answered")))?;

        let closed = Arc::new(AtomicBool::new(false));
        let offerer_channel = Arc::new(LoopbackChannel {
            peer_sink: sink,
            closed: Arc::clone(&closed),
        });
        let answerer_channel = Arc::new(LoopbackChannel {
            peer_sink: pending.offerer_sink.clone(),
            closed,
        });
        let (open_tx, open_rx) = oneshot::channel();
        pending.answered = Some(Answered {
            offerer_channel,
            open: open_tx,
        });

        Ok(Box::new(AnswerSide {
            description: format!("{ANSWER_PREFIX}{token}"),
            channel: answerer_channel,
            opened: open_rx,
        }))
    }
}

// ── Negotiations ──────────────────────────────────────────────────────────────

struct OfferSide {
    negotiator: LoopbackNegotiator,
    token: u64,
    description: String,
    channel: Option<Arc<LoopbackChannel>>,
}

#[async_trait]
impl Negotiation for OfferSide {
    fn local_description(&self) -> &str {
        &self.description
    }

    async fn apply_remote_answer(&mut self, sdp: &str) -> Result<(), TransportError> {
        if parse_token(sdp, ANSWER_PREFIX)? != self.token {
            return Err(TransportError::Negotiation("answer belongs to another offer".to_string()));
        }

        let answered = self
            .negotiator
            .table()
            .remove(&self.token)
            .and_then(|p| p.answered)
            .ok_or_else(|| TransportError::Negotiation("offer was never answered".to_string()))?;

        // The answerer may have given up already; the channel is then closed.
        let _ = answered.open.send(());
        self.channel = Some(answered.offerer_channel);
        Ok(())
    }

    async fn wait_open(self: Box<Self>, _limit: Duration) -> Result<Arc<dyn DataChannel>, TransportError> {
        let OfferSide {
            negotiator,
            token,
            channel,
            ..
        } = *self;
        match channel {
            Some(channel) if !channel.is_closed() => Ok(channel as Arc<dyn DataChannel>),
            _ => {
                negotiator.table().remove(&token);
                Err(TransportError::NotOpen)
            }
        }
    }

    async fn abort(self: Box<Self>) {
        let OfferSide {
            negotiator,
            token,
            channel,
            ..
        } = *self;
        negotiator.table().remove(&token);
        if let Some(channel) = channel {
            channel.close().await;
        }
    }
}

struct AnswerSide {
    description: String,
    channel: Arc<LoopbackChannel>,
    opened: oneshot::Receiver<()>,
}

#[async_trait]
impl Negotiation for AnswerSide {
    fn local_description(&self) -> &str {
        &self.description
    }

    async fn apply_remote_answer(&mut self, _sdp: &str) -> Result<(), TransportError> {
        Err(TransportError::Negotiation("the answering side has no remote answer".to_string()))
    }

    async fn wait_open(self: Box<Self>, limit: Duration) -> Result<Arc<dyn DataChannel>, TransportError> {
        let AnswerSide { channel, opened, .. } = *self;
        let error = match tokio::time::timeout(limit, opened).await {
            Ok(Ok(())) if !channel.is_closed() => return Ok(channel as Arc<dyn DataChannel>),
            Ok(_) => TransportError::NotOpen,
            Err(_) => TransportError::OpenTimeout(limit),
        };
        channel.close().await;
        Err(error)
    }

    async fn abort(self: Box<Self>) {
        self.channel.close().await;
    }
}

// ── Channel ───────────────────────────────────────────────────────────────────

/// One end of an in-process channel.  Both ends share the `closed` flag.
struct LoopbackChannel {
    peer_sink: ChannelSink,
    closed: Arc<AtomicBool>,
}

impl LoopbackChannel {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::NotOpen);
        }
        self.peer_sink.deliver(ChannelEvent::Message(text));
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.peer_sink.deliver(ChannelEvent::Closed);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
