//! Application layer: peer sessions, the peer registry, and the seams the
//! infrastructure plugs into.
//!
//! Nothing in this layer opens a socket.  The data channel is reached only
//! through the [`transport::DataChannel`] trait, so every type here can be
//! unit-tested with a mock channel.

pub mod events;
pub mod registry;
pub mod session;
pub mod transport;
