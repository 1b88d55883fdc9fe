//! # clipscape-core
//!
//! Shared library for the ClipScape peer network containing peer identity
//! types, the session state machine, and the three wire codecs spoken between
//! devices.
//!
//! This crate has zero dependencies on sockets, threads, or async runtimes.
//! Everything here can be unit-tested in isolation.
//!
//! # Architecture overview (for beginners)
//!
//! ClipScape keeps clipboards in sync across devices on the same LAN.  Every
//! device runs the same node software; there is no server.  Nodes find each
//! other, negotiate a direct data channel, and then push clipboard payloads
//! over that channel.
//!
//! Three protocols are involved, and each has a module under [`protocol`]:
//!
//! - **`discovery`** – a UDP broadcast asks "who is out there?" and every
//!   node answers with its display name and signaling port.
//!
//! - **`signaling`** – a short TCP exchange carries the offer/answer session
//!   descriptions needed to open the data channel.
//!
//! - **`channel`** – once the channel is open, text messages flow over it.
//!   Large messages are split into chunks and reassembled on arrival, and two
//!   reserved tokens carry the heartbeat.
//!
//! The [`domain`] module holds the types the protocols talk about: peer
//! identifiers and the lifecycle of a peer session.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `clipscape_core::PeerId` instead of `clipscape_core::domain::peer::PeerId`.
pub use domain::peer::{
    DiscoveryRecord, InvalidTransition, PeerId, PeerIdParseError, PeerInfo, SessionRole,
    SessionState,
};
pub use protocol::channel::{
    split_message, ChannelMessage, ChunkEnvelope, ChunkReassembler, CHUNK_SIZE,
};
pub use protocol::discovery::DiscoveryCollector;
pub use protocol::error::ProtocolError;
pub use protocol::signaling::{FrameDecoder, SessionDescription, SignalingMessage};
