//! Infrastructure layer: everything that touches sockets, threads, or files.
//!
//! | Module        | Responsibility                                         |
//! |---------------|--------------------------------------------------------|
//! | `discovery`   | UDP responder and time-bounded discovery passes        |
//! | `signaling`   | TCP offer/answer exchange, both roles                  |
//! | `coordinator` | the actor that owns the registry and all network state |
//! | `transport`   | data-channel negotiators (WebRTC, loopback)            |
//! | `storage`     | TOML configuration                                     |
//! | `service`     | blocking facade running the coordinator on its thread  |

pub mod coordinator;
pub mod discovery;
pub mod service;
pub mod signaling;
pub mod storage;
pub mod transport;
