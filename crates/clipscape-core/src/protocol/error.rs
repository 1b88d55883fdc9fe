//! Error type shared by all ClipScape wire codecs.

use thiserror::Error;

/// Errors that can occur while encoding or decoding protocol data.
///
/// Protocol errors are always local to one datagram, one signaling frame, or
/// one data-channel message.  They never invalidate other in-flight traffic.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A discovery reply did not start with the announcement prefix.
    #[error("not an announcement datagram")]
    NotAnAnnouncement,

    /// A datagram or frame was not valid UTF-8.
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,

    /// A JSON document could not be parsed or did not match the expected shape.
    #[error("malformed JSON: {0}")]
    MalformedJson(String),

    /// A field was present but its value is out of range.
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },

    /// A signaling frame grew beyond the allowed size without a delimiter.
    #[error("signaling frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    /// The stream ended before the frame delimiter arrived.
    #[error("stream ended before the frame delimiter")]
    Truncated,
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::MalformedJson(e.to_string())
    }
}
