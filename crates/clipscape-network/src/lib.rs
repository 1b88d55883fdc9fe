//! clipscape-network library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # Layering
//!
//! ```text
//! application/      sockets-free logic: sessions, registry, events, transport traits
//! infrastructure/   UDP discovery, TCP signaling, the coordinator actor,
//!                   negotiation transports, config files, the blocking facade
//! ```
//!
//! Most applications only need [`PeerNetworkService`] and [`NodeConfig`].

pub mod application;
pub mod infrastructure;

pub use application::events::NetworkEvent;
pub use infrastructure::service::{PeerNetworkService, ServiceError};
pub use infrastructure::storage::config::NodeConfig;
