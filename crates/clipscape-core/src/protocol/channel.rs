//! Data-channel message format: heartbeat tokens, chunk envelopes, plain text.
//!
//! # Why chunking? (for beginners)
//!
//! A data channel limits the size of a single message.  Clipboard payloads can
//! be arbitrarily large, so any message over [`CHUNK_SIZE`] bytes is split into
//! an ordered *chunk set*.  Every piece travels as
//!
//! ```text
//! __CHUNK__{"id":"a1b2c3d4","index":0,"total":3,"data":"..."}
//! ```
//!
//! where `id` is a short random token shared by all pieces of one logical
//! message.  The receiver buffers pieces by `id` and, once `total` distinct
//! indices have arrived, concatenates them in index order.  Arrival order does
//! not matter.
//!
//! Two further tokens, `__PING__` and `__PONG__`, carry the heartbeat and are
//! never handed to the application.
//!
//! Every inbound string is decoded once into a [`ChannelMessage`], so the rest
//! of the system never inspects raw prefixes.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::protocol::error::ProtocolError;

/// Heartbeat request token.
pub const PING: &str = "__PING__";

/// Heartbeat reply token.
pub const PONG: &str = "__PONG__";

/// Prefix of every chunk envelope.
pub const CHUNK_PREFIX: &str = "__CHUNK__";

/// Largest payload (in UTF-8 bytes) sent as a single message.
pub const CHUNK_SIZE: usize = 16_000;

/// Partially received chunk sets older than this are discarded.
pub const CHUNK_SET_MAX_AGE: Duration = Duration::from_secs(60);

// ── ChannelMessage ────────────────────────────────────────────────────────────

/// One decoded data-channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Ping,
    Pong,
    Chunk(ChunkEnvelope),
    Plain(String),
}

impl ChannelMessage {
    /// Classifies a raw data-channel string.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedJson`] or [`ProtocolError::InvalidField`]
    /// when the text carries the chunk prefix but the envelope is unusable.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        if text == PING {
            return Ok(ChannelMessage::Ping);
        }
        if text == PONG {
            return Ok(ChannelMessage::Pong);
        }
        match text.strip_prefix(CHUNK_PREFIX) {
            Some(json) => {
                let envelope: ChunkEnvelope = serde_json::from_str(json)?;
                envelope.validate()?;
                Ok(ChannelMessage::Chunk(envelope))
            }
            None => Ok(ChannelMessage::Plain(text.to_string())),
        }
    }

    /// Produces the wire string.
    pub fn encode(&self) -> String {
        match self {
            ChannelMessage::Ping => PING.to_string(),
            ChannelMessage::Pong => PONG.to_string(),
            ChannelMessage::Chunk(env) => env.encode(),
            ChannelMessage::Plain(text) => text.clone(),
        }
    }
}

// ── ChunkEnvelope ─────────────────────────────────────────────────────────────

/// One fragment of a chunk set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEnvelope {
    pub id: String,
    pub index: usize,
    pub total: usize,
    pub data: String,
}

impl ChunkEnvelope {
    /// Checks `total > 0` and `index < total`.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.total == 0 {
            return Err(ProtocolError::InvalidField {
                field: "total",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.index >= self.total {
            return Err(ProtocolError::InvalidField {
                field: "index",
                reason: format!("{} out of range for total {}", self.index, self.total),
            });
        }
        Ok(())
    }

    /// Wire form: prefix followed by the JSON object.
    pub fn encode(&self) -> String {
        // Serializing a struct of strings and integers cannot fail.
        let json = serde_json::to_string(self).unwrap_or_default();
        format!("{CHUNK_PREFIX}{json}")
    }
}

/// Returns a fresh 8-character chunk-set id.
pub fn new_chunk_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// `true` if sending `text` verbatim would be decoded as something other
/// than a plain message.
pub fn is_reserved(text: &str) -> bool {
    text == PING || text == PONG || text.starts_with(CHUNK_PREFIX)
}

/// Splits an outbound message using [`CHUNK_SIZE`] and a random id.
pub fn split_message(message: &str) -> Vec<String> {
    split_message_with(message, &new_chunk_id(), CHUNK_SIZE)
}

/// Splits an outbound message into wire strings.
///
/// Messages of at most `chunk_size` bytes are returned verbatim as a single
/// string, unless they look like a reserved token, in which case they are
/// wrapped as a one-piece chunk set.  Longer messages are cut into pieces
/// whose escaped `data` field is at most `chunk_size` bytes, so control
/// characters cannot push an envelope past the channel's message limit.
pub fn split_message_with(message: &str, id: &str, chunk_size: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);

    if message.len() <= chunk_size && !is_reserved(message) {
        return vec![message.to_string()];
    }

    let pieces = split_on_char_boundaries(message, chunk_size);
    let total = pieces.len();
    pieces
        .into_iter()
        .enumerate()
        .map(|(index, data)| {
            ChunkEnvelope {
                id: id.to_string(),
                index,
                total,
                data: data.to_string(),
            }
            .encode()
        })
        .collect()
}

/// Bytes `c` occupies once JSON-escaped inside an envelope's `data` string.
///
/// Control characters are counted as the six-byte `\uXXXX` form even where a
/// two-byte escape exists, so the result never underestimates.
fn escaped_len(c: char) -> usize {
    match c {
        '"' | '\\' => 2,
        c if (c as u32) < 0x20 => 6,
        c => c.len_utf8(),
    }
}

/// Cuts `text` into pieces whose JSON-escaped size is at most `max_bytes`,
/// always on a character boundary.
fn split_on_char_boundaries(text: &str, max_bytes: usize) -> Vec<&str> {
    if text.is_empty() {
        return vec![""];
    }

    let mut pieces = Vec::with_capacity(text.len() / max_bytes + 1);
    let mut start = 0;
    let mut cost = 0;
    for (at, c) in text.char_indices() {
        let width = escaped_len(c);
        // A single character wider than max_bytes still gets a piece of its own.
        if cost + width > max_bytes && at > start {
            pieces.push(&text[start..at]);
            start = at;
            cost = 0;
        }
        cost += width;
    }
    pieces.push(&text[start..]);
    pieces
}

// ── ChunkReassembler ──────────────────────────────────────────────────────────

#[derive(Debug)]
struct PendingSet {
    total: usize,
    parts: BTreeMap<usize, String>,
    first_seen: Instant,
}

/// Buffers chunk sets until every piece has arrived.
///
/// A set is removed the moment it completes.  A malformed or inconsistent
/// envelope is rejected without touching any other set.
#[derive(Debug, Default)]
pub struct ChunkReassembler {
    sets: HashMap<String, PendingSet>,
}

impl ChunkReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one envelope and returns the full message if the set is complete.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidField`] if the envelope is out of range
    /// or its `total` disagrees with earlier pieces of the same set.
    pub fn accept(&mut self, envelope: ChunkEnvelope) -> Result<Option<String>, ProtocolError> {
        self.accept_at(envelope, Instant::now())
    }

    /// Same as [`accept`](Self::accept) with an explicit clock reading.
    pub fn accept_at(
        &mut self,
        envelope: ChunkEnvelope,
        now: Instant,
    ) -> Result<Option<String>, ProtocolError> {
        envelope.validate()?;

        let set = self
            .sets
            .entry(envelope.id.clone())
            .or_insert_with(|| PendingSet {
                total: envelope.total,
                parts: BTreeMap::new(),
                first_seen: now,
            });

        if set.total != envelope.total {
            return Err(ProtocolError::InvalidField {
                field: "total",
                reason: format!(
                    "chunk set {} expects {} pieces, envelope says {}",
                    envelope.id, set.total, envelope.total
                ),
            });
        }

        set.parts.insert(envelope.index, envelope.data);
        if set.parts.len() < set.total {
            return Ok(None);
        }

        let complete = self.sets.remove(&envelope.id);
        Ok(complete.map(|set| set.parts.into_values().collect()))
    }

    /// Number of incomplete chunk sets.
    pub fn pending(&self) -> usize {
        self.sets.len()
    }

    /// Drops sets first seen more than `max_age` before `now`.  Returns how
    /// many were dropped.
    pub fn prune_stale(&mut self, now: Instant, max_age: Duration) -> usize {
        let before = self.sets.len();
        self.sets.retain(|id, set| {
            let keep = now.saturating_duration_since(set.first_seen) <= max_age;
            if !keep {
                tracing::debug!(
                    chunk_id = %id,
                    received = set.parts.len(),
                    total = set.total,
                    "abandoning incomplete chunk set"
                );
            }
            keep
        });
        before - self.sets.len()
    }

    /// Discards all buffered state.
    pub fn clear(&mut self) {
        self.sets.clear();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
