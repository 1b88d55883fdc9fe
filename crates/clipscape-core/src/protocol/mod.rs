//! Protocol module containing the three ClipScape wire formats.
//!
//! | Module        | Transport    | Carries                                   |
//! |---------------|--------------|-------------------------------------------|
//! | `discovery`   | UDP          | discover token / announcement             |
//! | `signaling`   | TCP          | offer / answer session descriptions       |
//! | `channel`     | data channel | heartbeat tokens, chunks, plain messages  |

pub mod channel;
pub mod discovery;
pub mod error;
pub mod signaling;

pub use channel::{split_message, ChannelMessage, ChunkEnvelope, ChunkReassembler, CHUNK_SIZE};
pub use discovery::{DiscoveryCollector, DISCOVER_TOKEN};
pub use error::ProtocolError;
pub use signaling::{FrameDecoder, SessionDescription, SignalingMessage, SIGNALING_DELIMITER};
