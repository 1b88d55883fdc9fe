//! Events surfaced to the clipboard-sync application.

use clipscape_core::{PeerId, PeerInfo};

/// Something the application may want to react to.
///
/// Events are produced by the coordinator in the order it observes them and
/// delivered to hooks and subscribers in that same order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// A data channel to this peer is open.
    PeerConnected(PeerInfo),
    /// The session to this peer was closed, failed, or missed its heartbeats.
    PeerDisconnected(PeerId),
    /// A complete logical message arrived (after chunk reassembly).
    MessageReceived { peer: PeerId, message: String },
}

impl NetworkEvent {
    /// The peer this event concerns.
    pub fn peer(&self) -> PeerId {
        match self {
            NetworkEvent::PeerConnected(info) => info.id,
            NetworkEvent::PeerDisconnected(id) => *id,
            NetworkEvent::MessageReceived { peer, .. } => *peer,
        }
    }
}
