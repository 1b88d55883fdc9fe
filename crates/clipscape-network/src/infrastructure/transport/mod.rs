//! Negotiation transports implementing the
//! [`Negotiator`](crate::application::transport::Negotiator) seam.
//!
//! | Transport  | Use                                                  |
//! |------------|------------------------------------------------------|
//! | `webrtc`   | real networks: ICE + DTLS + SCTP data channels       |
//! | `loopback` | tests and single-host development, no real sockets   |

pub mod loopback;
pub mod webrtc;

pub use loopback::LoopbackNegotiator;
pub use self::webrtc::WebRtcNegotiator;
