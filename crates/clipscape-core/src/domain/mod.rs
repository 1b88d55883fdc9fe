//! Domain entities for the ClipScape peer network.
//!
//! This module contains pure business types with no infrastructure
//! dependencies: who a peer is, what we know about it after discovery, and
//! which lifecycle stage its session is in.

/// Peer identity, discovery records, and the session state machine.
///
/// See [`peer::PeerId`] and [`peer::SessionState`] for the main types.
pub mod peer;
