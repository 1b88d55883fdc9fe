//! TCP signaling: carries one offer and one answer per connection.
//!
//! # Wire exchange (for beginners)
//!
//! ```text
//! offerer                                       answerer
//! ───────                                       ────────
//! connect (5 s)  ───────────────────────────►   accept
//! {"type":"offer",...}\n---END_SDP---\n  ───►   read offer (10 s)
//!                                               ask coordinator: accept?
//!                                               create answer
//! read answer (5 s)  ◄───  {"type":"answer",...}\n---END_SDP---\n
//! close                                         close
//! apply answer, wait for channel open           wait for channel open
//! ```
//!
//! A refused offer is signalled by closing the connection without an answer.
//! Every failure is contained to its own handshake: it is logged, the
//! coordinator is told so it can drop the half-built session, and nothing
//! else is affected.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clipscape_core::protocol::signaling::encode_frame;
use clipscape_core::{FrameDecoder, PeerId, ProtocolError, SessionDescription, SignalingMessage};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::application::registry::{InboundDecision, SessionTicket};
use crate::application::transport::{ChannelSink, DataChannel, Negotiator, TransportError};
use crate::infrastructure::coordinator::Inbox;

/// Limit for establishing the outbound TCP connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Limit for reading the answer and for writing either frame.
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Limit for reading an inbound offer.
pub const OFFER_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Limit for the data channel to open after the exchange.
pub const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed `accept` so a persistent error cannot spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Error type for one handshake attempt.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The TCP connection could not be established.
    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// A stage did not finish in time.
    #[error("timed out during {stage}")]
    Timeout { stage: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The coordinator declined the inbound offer.
    #[error("offer refused: {0}")]
    Refused(&'static str),

    /// The coordinator is gone.
    #[error("node is shutting down")]
    Shutdown,
}

// ── Framing ───────────────────────────────────────────────────────────────────

/// Reads exactly one signaling frame.
///
/// # Errors
///
/// [`ProtocolError::Truncated`] if the stream ends before the delimiter, or
/// any decoding error from [`FrameDecoder`].
pub async fn read_frame<R>(reader: &mut R) -> Result<SignalingMessage, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 4096];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(ProtocolError::Truncated.into());
        }
        if let Some(message) = decoder.push(&buf[..n])? {
            return Ok(message);
        }
    }
}

/// Writes one signaling frame and flushes it.
pub async fn write_frame<W>(writer: &mut W, message: &SignalingMessage) -> Result<(), HandshakeError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(message)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Offerer side of the TCP exchange: sends `offer` to `addr` and returns the
/// answer's description.
///
/// # Errors
///
/// Connect failures, timeouts, a closed connection (the remote refused), or a
/// reply that is not an answer.
pub async fn exchange_offer(
    addr: SocketAddr,
    offer: &SignalingMessage,
) -> Result<SessionDescription, HandshakeError> {
    let mut stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Err(_) => return Err(HandshakeError::Timeout { stage: "connect" }),
        Ok(Err(source)) => return Err(HandshakeError::Connect { addr, source }),
        Ok(Ok(stream)) => stream,
    };

    timeout(IO_TIMEOUT, write_frame(&mut stream, offer))
        .await
        .map_err(|_| HandshakeError::Timeout { stage: "write offer" })??;

    let reply = timeout(IO_TIMEOUT, read_frame(&mut stream))
        .await
        .map_err(|_| HandshakeError::Timeout { stage: "read answer" })??;

    Ok(reply.into_answer()?)
}

// ── Handshakes ────────────────────────────────────────────────────────────────

/// What a handshake task needs from its node.
#[derive(Clone)]
pub struct HandshakeContext {
    pub negotiator: Arc<dyn Negotiator>,
    pub inbox: mpsc::UnboundedSender<Inbox>,
    pub device_name: String,
    pub port: u16,
}

impl HandshakeContext {
    /// A sink that forwards channel events for `ticket` to the coordinator.
    pub fn sink_for(&self, ticket: SessionTicket) -> ChannelSink {
        let inbox = self.inbox.clone();
        ChannelSink::new(move |event| {
            let _ = inbox.send(Inbox::Channel { ticket, event });
        })
    }

    /// Reports a handshake outcome.  An open channel nobody will own is closed.
    async fn report(
        &self,
        ticket: SessionTicket,
        outcome: Result<(Option<String>, Arc<dyn DataChannel>), HandshakeError>,
    ) {
        let message = match outcome {
            Ok((display_name, channel)) => Inbox::Established {
                ticket,
                display_name,
                channel,
            },
            Err(HandshakeError::Refused(reason)) => {
                debug!(peer = %ticket.id, "handshake refused: {reason}");
                return;
            }
            Err(e) => {
                warn!(peer = %ticket.id, "handshake failed: {e}");
                Inbox::HandshakeFailed {
                    ticket,
                    reason: e.to_string(),
                }
            }
        };

        if let Err(mpsc::error::SendError(Inbox::Established { channel, .. })) = self.inbox.send(message) {
            channel.close().await;
        }
    }
}

impl std::fmt::Debug for HandshakeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeContext")
            .field("device_name", &self.device_name)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

/// Runs the offerer flow for `ticket` and reports the result to the
/// coordinator.
pub async fn offer_handshake(ctx: HandshakeContext, ticket: SessionTicket) {
    debug!(peer = %ticket.id, "offering");
    let outcome = run_offer(&ctx, ticket)
        .await
        .map(|(name, channel)| (Some(name), channel));
    ctx.report(ticket, outcome).await;
}

async fn run_offer(
    ctx: &HandshakeContext,
    ticket: SessionTicket,
) -> Result<(String, Arc<dyn DataChannel>), HandshakeError> {
    let mut negotiation = ctx.negotiator.create_offer(ctx.sink_for(ticket)).await?;
    let offer = SignalingMessage::offer(negotiation.local_description(), &ctx.device_name, ctx.port);

    let answer = match exchange_offer(ticket.id.signaling_addr(), &offer).await {
        Ok(answer) => answer,
        Err(e) => {
            negotiation.abort().await;
            return Err(e);
        }
    };

    if let Err(e) = negotiation.apply_remote_answer(&answer.sdp).await {
        negotiation.abort().await;
        return Err(e.into());
    }

    let channel = negotiation.wait_open(CHANNEL_OPEN_TIMEOUT).await?;
    Ok((answer.device_name, channel))
}

/// Runs the answerer flow for one accepted TCP connection.
pub async fn answer_inbound(ctx: HandshakeContext, mut stream: TcpStream, remote: SocketAddr) {
    let admitted = match admit_offer(&ctx, &mut stream, remote).await {
        Ok(admitted) => admitted,
        Err(HandshakeError::Refused(reason)) => {
            debug!("offer from {remote} refused: {reason}");
            return;
        }
        Err(e) => {
            warn!("inbound signaling from {remote} dropped: {e}");
            return;
        }
    };

    let (ticket, offer_sdp) = admitted;
    let outcome = run_answer(&ctx, stream, ticket, &offer_sdp)
        .await
        .map(|channel| (None, channel));
    ctx.report(ticket, outcome).await;
}

/// Reads the offer and asks the coordinator whether to answer it.
async fn admit_offer(
    ctx: &HandshakeContext,
    stream: &mut TcpStream,
    remote: SocketAddr,
) -> Result<(SessionTicket, String), HandshakeError> {
    let message = timeout(OFFER_READ_TIMEOUT, read_frame(stream))
        .await
        .map_err(|_| HandshakeError::Timeout { stage: "read offer" })??;
    let offer = message.into_offer()?;

    // The identifier uses the announced port, never the ephemeral TCP port.
    let id = PeerId::new(remote.ip(), offer.signaling_port);
    let local_seen = PeerId::new(stream.local_addr()?.ip(), ctx.port);

    let (reply_tx, reply_rx) = oneshot::channel();
    ctx.inbox
        .send(Inbox::InboundOffer {
            id,
            display_name: offer.device_name,
            local_seen,
            reply: reply_tx,
        })
        .map_err(|_| HandshakeError::Shutdown)?;

    match reply_rx.await.map_err(|_| HandshakeError::Shutdown)? {
        InboundDecision::Accept(ticket) => Ok((ticket, offer.sdp)),
        refused => Err(HandshakeError::Refused(refused.reason())),
    }
}

async fn run_answer(
    ctx: &HandshakeContext,
    mut stream: TcpStream,
    ticket: SessionTicket,
    offer_sdp: &str,
) -> Result<Arc<dyn DataChannel>, HandshakeError> {
    let negotiation = ctx
        .negotiator
        .create_answer(offer_sdp, ctx.sink_for(ticket))
        .await?;
    let answer = SignalingMessage::answer(negotiation.local_description(), &ctx.device_name, ctx.port);

    let written = match timeout(IO_TIMEOUT, write_frame(&mut stream, &answer)).await {
        Err(_) => Err(HandshakeError::Timeout { stage: "write answer" }),
        Ok(result) => result,
    };
    if let Err(e) = written {
        negotiation.abort().await;
        return Err(e);
    }
    drop(stream);

    Ok(negotiation.wait_open(CHANNEL_OPEN_TIMEOUT).await?)
}

/// Accepts signaling connections until the task is cancelled.
///
/// Each connection is answered on its own task; cancelling this task cancels
/// every handshake it started.
pub async fn run_signaling_server(listener: TcpListener, ctx: HandshakeContext) {
    if let Ok(addr) = listener.local_addr() {
        info!("signaling server listening on TCP {addr}");
    }
    let mut handshakes = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    debug!("signaling connection from {remote}");
                    handshakes.spawn(answer_inbound(ctx.clone(), stream, remote));
                }
                Err(e) => {
                    warn!("signaling accept failed: {e}");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
            Some(_) = handshakes.join_next(), if !handshakes.is_empty() => {}
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
