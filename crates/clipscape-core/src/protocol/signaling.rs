//! Signaling frame format used during the TCP offer/answer handshake.
//!
//! # Frame layout
//!
//! ```text
//! {"type":"offer","sdp":"v=0...","device_name":"desk","signaling_port":9999}
//! \n---END_SDP---\n
//! ```
//!
//! Each frame is one JSON object followed by the fixed byte sequence
//! [`SIGNALING_DELIMITER`].  A plain newline would not work as a terminator:
//! session descriptions contain newlines of their own.
//!
//! Exactly two frames travel over one signaling connection: the offerer writes
//! an offer, the answerer writes back an answer, and the connection is closed.

use serde::{Deserialize, Serialize};

use crate::protocol::error::ProtocolError;

/// Terminator written after every signaling JSON object.
pub const SIGNALING_DELIMITER: &[u8] = b"\n---END_SDP---\n";

/// Largest frame accepted before the delimiter must have appeared.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Payload shared by offers and answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Opaque session description produced by the negotiation transport.
    pub sdp: String,
    /// Sender's self-reported device name.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Port the sender listens on for signaling and discovery.
    pub signaling_port: u16,
}

fn default_device_name() -> String {
    "Unknown".to_string()
}

/// A decoded signaling frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    Offer(SessionDescription),
    Answer(SessionDescription),
}

impl SignalingMessage {
    /// Builds an offer frame.
    pub fn offer(sdp: impl Into<String>, device_name: impl Into<String>, signaling_port: u16) -> Self {
        SignalingMessage::Offer(SessionDescription {
            sdp: sdp.into(),
            device_name: device_name.into(),
            signaling_port,
        })
    }

    /// Builds an answer frame.
    pub fn answer(sdp: impl Into<String>, device_name: impl Into<String>, signaling_port: u16) -> Self {
        SignalingMessage::Answer(SessionDescription {
            sdp: sdp.into(),
            device_name: device_name.into(),
            signaling_port,
        })
    }

    /// The wire value of the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer(_) => "offer",
            SignalingMessage::Answer(_) => "answer",
        }
    }

    /// Borrow the description regardless of the variant.
    pub fn description(&self) -> &SessionDescription {
        match self {
            SignalingMessage::Offer(d) | SignalingMessage::Answer(d) => d,
        }
    }

    /// Returns the description if this is an offer.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidField`] for an answer.
    pub fn into_offer(self) -> Result<SessionDescription, ProtocolError> {
        match self {
            SignalingMessage::Offer(d) => Ok(d),
            other => Err(unexpected_type("offer", other.kind())),
        }
    }

    /// Returns the description if this is an answer.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidField`] for an offer.
    pub fn into_answer(self) -> Result<SessionDescription, ProtocolError> {
        match self {
            SignalingMessage::Answer(d) => Ok(d),
            other => Err(unexpected_type("answer", other.kind())),
        }
    }
}

fn unexpected_type(expected: &str, got: &str) -> ProtocolError {
    ProtocolError::InvalidField {
        field: "type",
        reason: format!("expected {expected}, got {got}"),
    }
}

/// Serializes `msg` and appends the delimiter.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedJson`] if serialization fails.
pub fn encode_frame(msg: &SignalingMessage) -> Result<Vec<u8>, ProtocolError> {
    let mut out = serde_json::to_vec(msg)?;
    out.extend_from_slice(SIGNALING_DELIMITER);
    Ok(out)
}

/// Decodes the bytes of one frame *without* its delimiter.
///
/// # Errors
///
/// - [`ProtocolError::InvalidUtf8`] if the frame is not UTF-8.
/// - [`ProtocolError::MalformedJson`] if the JSON is invalid, the `type` is
///   unknown, or a required field is missing.
pub fn decode_frame(body: &[u8]) -> Result<SignalingMessage, ProtocolError> {
    let text = std::str::from_utf8(body).map_err(|_| ProtocolError::InvalidUtf8)?;
    Ok(serde_json::from_str(text)?)
}

/// Returns the offset where the delimiter starts in `buf`, if present.
pub fn find_delimiter(buf: &[u8]) -> Option<usize> {
    buf.windows(SIGNALING_DELIMITER.len())
        .position(|w| w == SIGNALING_DELIMITER)
}

/// Incremental frame accumulator for a byte stream.
///
/// Feed it whatever the socket returns; it yields a message once the
/// delimiter has arrived.  Bytes after the delimiter are ignored because a
/// signaling connection carries only one frame per direction.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    limit: usize,
}

impl FrameDecoder {
    /// Creates a decoder with the default [`MAX_FRAME_BYTES`] limit.
    pub fn new() -> Self {
        Self::with_limit(MAX_FRAME_BYTES)
    }

    /// Creates a decoder with a custom size limit.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    /// Appends `bytes` and returns the frame if it is now complete.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::FrameTooLarge`] if the limit is exceeded before the
    ///   delimiter appears.
    /// - Any error from [`decode_frame`] once the frame is complete.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Option<SignalingMessage>, ProtocolError> {
        // Only rescan the tail that could contain a delimiter spanning chunks.
        let scan_from = self.buf.len().saturating_sub(SIGNALING_DELIMITER.len() - 1);
        self.buf.extend_from_slice(bytes);

        match find_delimiter(&self.buf[scan_from..]) {
            Some(pos) => decode_frame(&self.buf[..scan_from + pos]).map(Some),
            None if self.buf.len() > self.limit => Err(ProtocolError::FrameTooLarge {
                limit: self.limit,
            }),
            None => Ok(None),
        }
    }

    /// Number of bytes buffered so far.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_serializes_with_lowercase_type_tag() {
        // Arrange
        let msg = SignalingMessage::offer("v=0", "desk", 9999);

        // Act
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();

        // Assert
        assert_eq!(value["type"], "offer");
        assert_eq!(value["sdp"], "v=0");
        assert_eq!(value["device_name"], "desk");
        assert_eq!(value["signaling_port"], 9999);
    }

    #[test]
    fn test_encode_frame_ends_with_delimiter() {
        let frame = encode_frame(&SignalingMessage::answer("x", "y", 1)).unwrap();
        assert!(frame.ends_with(SIGNALING_DELIMITER));
        assert_eq!(find_delimiter(&frame), Some(frame.len() - SIGNALING_DELIMITER.len()));
    }

    #[test]
    fn test_sdp_with_newlines_survives_framing() {
        // Arrange
        let sdp = "v=0\r\no=- 1 2 IN IP4 0.0.0.0\r\ns=-\r\n";
        let frame = encode_frame(&SignalingMessage::offer(sdp, "desk", 9999)).unwrap();

        // Act
        let end = find_delimiter(&frame).unwrap();
        let decoded = decode_frame(&frame[..end]).unwrap();

        // Assert
        assert_eq!(decoded.description().sdp, sdp);
    }

    #[test]
    fn test_decode_frame_defaults_missing_device_name() {
        let body = br#"{"type":"answer","sdp":"s","signaling_port":4000}"#;
        let msg = decode_frame(body).unwrap();
        assert_eq!(msg.description().device_name, "Unknown");
    }

    #[test]
    fn test_decode_frame_rejects_unknown_type() {
        let body = br#"{"type":"candidate","sdp":"s","signaling_port":4000}"#;
        assert!(matches!(decode_frame(body), Err(ProtocolError::MalformedJson(_))));
    }

    #[test]
    fn test_decode_frame_rejects_missing_port() {
        let body = br#"{"type":"offer","sdp":"s","device_name":"d"}"#;
        assert!(matches!(decode_frame(body), Err(ProtocolError::MalformedJson(_))));
    }

    #[test]
    fn test_into_answer_rejects_offer() {
        let result = SignalingMessage::offer("s", "d", 1).into_answer();
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidField { field: "type", .. })
        ));
    }

    #[test]
    fn test_frame_decoder_handles_delimiter_split_across_reads() {
        // Arrange
        let frame = encode_frame(&SignalingMessage::offer("sdp", "desk", 9999)).unwrap();
        let split = frame.len() - 5;
        let mut decoder = FrameDecoder::new();

        // Act
        let first = decoder.push(&frame[..split]).unwrap();
        let second = decoder.push(&frame[split..]).unwrap();

        // Assert
        assert!(first.is_none());
        assert_eq!(second, Some(SignalingMessage::offer("sdp", "desk", 9999)));
    }

    #[test]
    fn test_frame_decoder_byte_by_byte() {
        let frame = encode_frame(&SignalingMessage::answer("a\nb", "n", 7)).unwrap();
        let mut decoder = FrameDecoder::new();
        let mut result = None;
        for byte in &frame {
            if let Some(msg) = decoder.push(std::slice::from_ref(byte)).unwrap() {
                result = Some(msg);
                break;
            }
        }
        assert_eq!(result, Some(SignalingMessage::answer("a\nb", "n", 7)));
    }

    #[test]
    fn test_frame_decoder_enforces_limit() {
        let mut decoder = FrameDecoder::with_limit(16);
        let result = decoder.push(&[b'a'; 17]);
        assert_eq!(result, Err(ProtocolError::FrameTooLarge { limit: 16 }));
    }
}
