//! `PeerNetworkService`: the blocking facade used by the clipboard application.
//!
//! # Threads (for beginners)
//!
//! The application is synchronous: a clipboard watcher calls `broadcast`
//! and expects an answer.  The network is asynchronous.  The facade bridges
//! the two with three kinds of threads:
//!
//! ```text
//! caller threads ──Command + reply slot──► clipscape-network thread
//!      ▲                                     (Tokio runtime running the
//!      └──────────── reply ───────────────    Coordinator actor)
//!                                                     │ NetworkEvent
//!                                                     ▼
//!                                           clipscape-events thread
//!                                           (hooks + subscribers)
//! ```
//!
//! Callers never touch network state directly.  Each call posts a
//! [`Command`] and waits on its own reply slot with a bounded timeout, so the
//! facade is safe to use from any number of threads at once.
//!
//! Hooks run on the events thread, one at a time, in the order the
//! coordinator produced the events.  A panicking hook is logged and the next
//! event is still delivered.

use std::net::IpAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use clipscape_core::{PeerId, PeerInfo};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::application::events::NetworkEvent;
use crate::application::transport::Negotiator;
use crate::infrastructure::coordinator::{Command, Coordinator, Inbox, NetworkError, Reply};
use crate::infrastructure::signaling::{CHANNEL_OPEN_TIMEOUT, IO_TIMEOUT, OFFER_READ_TIMEOUT};
use crate::infrastructure::storage::config::NodeConfig;
use crate::infrastructure::transport::WebRtcNegotiator;

/// How long `start` waits for the sockets to be bound.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for sends and snapshots.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest a single handshake can take from either side.
const HANDSHAKE_BUDGET: Duration =
    Duration::from_secs(OFFER_READ_TIMEOUT.as_secs() + IO_TIMEOUT.as_secs() + CHANNEL_OPEN_TIMEOUT.as_secs());

/// Error type for facade calls.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("the network service is not running")]
    NotRunning,

    #[error("startup did not complete within {0:?}")]
    StartupTimeout(Duration),

    #[error("startup failed: {0}")]
    Startup(#[from] NetworkError),

    /// The coordinator did not answer in time.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// The service stopped while the call was pending.
    #[error("the network service stopped")]
    Stopped,

    #[error("cannot serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("runtime error: {0}")]
    Runtime(String),
}

type ConnectedHook = Arc<dyn Fn(&PeerInfo) + Send + Sync>;
type DisconnectedHook = Arc<dyn Fn(PeerId) + Send + Sync>;
type MessageHook = Arc<dyn Fn(PeerId, &str) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registered hooks and subscribers.  Shared with the events thread.
#[derive(Default)]
struct Hooks {
    connected: Mutex<Option<ConnectedHook>>,
    disconnected: Mutex<Option<DisconnectedHook>>,
    message: Mutex<Option<MessageHook>>,
    subscribers: Mutex<Vec<Sender<NetworkEvent>>>,
}

impl Hooks {
    fn dispatch(&self, event: &NetworkEvent) {
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());

        let outcome = match event {
            NetworkEvent::PeerConnected(info) => {
                let hook = lock(&self.connected).clone();
                hook.map(|f| catch_unwind(AssertUnwindSafe(|| f(info))))
            }
            NetworkEvent::PeerDisconnected(id) => {
                let hook = lock(&self.disconnected).clone();
                hook.map(|f| catch_unwind(AssertUnwindSafe(|| f(*id))))
            }
            NetworkEvent::MessageReceived { peer, message } => {
                let hook = lock(&self.message).clone();
                hook.map(|f| catch_unwind(AssertUnwindSafe(|| f(*peer, message))))
            }
        };

        if let Some(Err(_)) = outcome {
            error!(peer = %event.peer(), "event hook panicked, continuing");
        }
    }
}

/// Asks the coordinator to shut down and waits for its thread to exit.
fn shut_down_runtime(inbox: &mpsc::UnboundedSender<Inbox>, runtime: JoinHandle<()>) {
    let (tx, rx) = sync_channel(1);
    if inbox.send(Inbox::Command(Command::Shutdown { reply: tx })).is_ok()
        && rx.recv_timeout(CALL_TIMEOUT).is_err()
    {
        warn!("network thread is slow to confirm shutdown, still waiting");
    }
    if runtime.join().is_err() {
        error!("network thread panicked");
    }
}

struct RunningNode {
    inbox: mpsc::UnboundedSender<Inbox>,
    local_id: PeerId,
    runtime: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

/// The peer network as seen by the application.
///
/// Create it with a [`NodeConfig`], register hooks, then [`start`](Self::start)
/// it.  Dropping the service stops it.
pub struct PeerNetworkService {
    config: NodeConfig,
    negotiator: Arc<dyn Negotiator>,
    hooks: Arc<Hooks>,
    running: Mutex<Option<RunningNode>>,
}

impl PeerNetworkService {
    /// A service using WebRTC data channels.
    pub fn new(config: NodeConfig) -> Self {
        let negotiator = Arc::new(WebRtcNegotiator::from_config(&config));
        Self::with_negotiator(config, negotiator)
    }

    /// A service using the given negotiator.
    pub fn with_negotiator(config: NodeConfig, negotiator: Arc<dyn Negotiator>) -> Self {
        Self {
            config,
            negotiator,
            hooks: Arc::new(Hooks::default()),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// This node's identifier, while running.
    pub fn local_id(&self) -> Option<PeerId> {
        lock(&self.running).as_ref().map(|n| n.local_id)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Starts the node and blocks until its sockets are bound.
    ///
    /// Calling `start` on a running service returns the current identifier.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Startup`] if a port cannot be bound or the config is
    /// invalid, [`ServiceError::StartupTimeout`] if binding does not finish in
    /// time.  Nothing is left running after an error.
    pub fn start(&self) -> Result<PeerId, ServiceError> {
        self.start_within(STARTUP_TIMEOUT)
    }

    fn start_within(&self, limit: Duration) -> Result<PeerId, ServiceError> {
        let mut running = lock(&self.running);
        if let Some(node) = running.as_ref() {
            return Ok(node.local_id);
        }

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = sync_channel(1);
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let config = self.config.clone();
        let negotiator = Arc::clone(&self.negotiator);

        let runtime = thread::Builder::new()
            .name("clipscape-network".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(ServiceError::Runtime(e.to_string())));
                        return;
                    }
                };
                rt.block_on(async move {
                    let started = tokio::select! {
                        started = Coordinator::start(&config, negotiator, events_tx) => started,
                        _ = cancel_rx => return,
                    };
                    match started {
                        Ok(coordinator) => {
                            let ready = (coordinator.inbox(), coordinator.local_id());
                            if ready_tx.send(Ok(ready)).is_ok() {
                                coordinator.run().await;
                            }
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(ServiceError::Startup(e)));
                        }
                    }
                });
            })
            .map_err(|e| ServiceError::Runtime(e.to_string()))?;

        let (inbox, local_id) = match ready_rx.recv_timeout(limit) {
            Ok(Ok(ready)) => ready,
            Ok(Err(e)) => {
                let _ = runtime.join();
                return Err(e);
            }
            Err(RecvTimeoutError::Timeout) => {
                let _ = cancel_tx.send(());
                // The thread either gives up or reports a node that just came up.
                match ready_rx.recv() {
                    Ok(Ok((inbox, _))) => shut_down_runtime(&inbox, runtime),
                    _ => {
                        let _ = runtime.join();
                    }
                }
                return Err(ServiceError::StartupTimeout(limit));
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = runtime.join();
                return Err(ServiceError::Runtime("network thread exited during startup".to_string()));
            }
        };

        let hooks = Arc::clone(&self.hooks);
        let dispatcher = thread::Builder::new()
            .name("clipscape-events".to_string())
            .spawn(move || {
                while let Some(event) = events_rx.blocking_recv() {
                    hooks.dispatch(&event);
                }
            });
        let dispatcher = match dispatcher {
            Ok(handle) => handle,
            Err(e) => {
                shut_down_runtime(&inbox, runtime);
                return Err(ServiceError::Runtime(e.to_string()));
            }
        };

        info!("peer network service started as {local_id}");
        *running = Some(RunningNode {
            inbox,
            local_id,
            runtime,
            dispatcher,
        });
        Ok(local_id)
    }

    /// Stops the node: closes every session, releases both ports, and waits
    /// for the background threads.  Does nothing if not running.
    ///
    /// Safe to call from inside a hook.
    pub fn stop(&self) {
        let Some(node) = lock(&self.running).take() else {
            return;
        };

        shut_down_runtime(&node.inbox, node.runtime);
        if thread::current().id() != node.dispatcher.thread().id() && node.dispatcher.join().is_err() {
            error!("events thread panicked");
        }
        info!("peer network service stopped");
    }

    // ── Calls ─────────────────────────────────────────────────────────────────

    fn call<T>(
        &self,
        what: &'static str,
        budget: Duration,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ServiceError> {
        let inbox = lock(&self.running)
            .as_ref()
            .map(|n| n.inbox.clone())
            .ok_or(ServiceError::NotRunning)?;

        let (tx, rx) = sync_channel(1);
        inbox
            .send(Inbox::Command(make(tx)))
            .map_err(|_| ServiceError::Stopped)?;

        rx.recv_timeout(budget).map_err(|e| match e {
            RecvTimeoutError::Timeout => ServiceError::Timeout(what),
            RecvTimeoutError::Disconnected => ServiceError::Stopped,
        })
    }

    /// Sends `text` to every connected peer.  Returns how many accepted it.
    pub fn broadcast(&self, text: &str) -> Result<usize, ServiceError> {
        let text = text.to_string();
        self.call("broadcast", CALL_TIMEOUT, |reply| Command::Broadcast { text, reply })
    }

    /// Serializes `value` as JSON and sends it to every connected peer.
    pub fn broadcast_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<usize, ServiceError> {
        let value = serde_json::to_value(value)?;
        self.call("broadcast", CALL_TIMEOUT, |reply| Command::BroadcastJson { value, reply })
    }

    /// Sends `text` to one peer.  `false` if it is not connected.
    pub fn send_to_peer(&self, peer: PeerId, text: &str) -> Result<bool, ServiceError> {
        let text = text.to_string();
        self.call("send", CALL_TIMEOUT, |reply| Command::SendToPeer { peer, text, reply })
    }

    /// Serializes `value` as JSON and sends it to one peer.
    pub fn send_json_to_peer<T: Serialize + ?Sized>(&self, peer: PeerId, value: &T) -> Result<bool, ServiceError> {
        let value = serde_json::to_value(value)?;
        self.call("send", CALL_TIMEOUT, |reply| Command::SendJsonToPeer { peer, value, reply })
    }

    /// Snapshot of connected peers, ordered by identifier.
    pub fn connected_peers(&self) -> Result<Vec<PeerInfo>, ServiceError> {
        self.call("peer snapshot", CALL_TIMEOUT, |reply| Command::ConnectedPeers { reply })
    }

    /// Runs a discovery pass now, connects to what it finds, and returns the
    /// connected peers afterwards.
    ///
    /// `timeout` overrides the configured collection window.
    pub fn discover_now(&self, timeout: Option<Duration>) -> Result<Vec<PeerInfo>, ServiceError> {
        let window = timeout.unwrap_or_else(|| self.config.discovery_timeout());
        let budget = window + HANDSHAKE_BUDGET + CALL_TIMEOUT;
        self.call("discovery", budget, |reply| Command::DiscoverNow { timeout, reply })
    }

    /// Connects to a peer at a known address without discovery.
    ///
    /// Returns `true` at once if that peer is already connected.
    pub fn connect_to_peer(&self, ip: IpAddr, port: u16) -> Result<bool, ServiceError> {
        let id = PeerId::new(ip, port);
        self.call("connect", HANDSHAKE_BUDGET + CALL_TIMEOUT, |reply| Command::Connect { id, reply })
    }

    // ── Events ────────────────────────────────────────────────────────────────

    /// Replaces the hook called when a peer connects.
    pub fn on_peer_connected(&self, hook: impl Fn(&PeerInfo) + Send + Sync + 'static) {
        *lock(&self.hooks.connected) = Some(Arc::new(hook));
    }

    /// Replaces the hook called when a peer disconnects.
    pub fn on_peer_disconnected(&self, hook: impl Fn(PeerId) + Send + Sync + 'static) {
        *lock(&self.hooks.disconnected) = Some(Arc::new(hook));
    }

    /// Replaces the hook called for every complete inbound message.
    pub fn on_message(&self, hook: impl Fn(PeerId, &str) + Send + Sync + 'static) {
        *lock(&self.hooks.message) = Some(Arc::new(hook));
    }

    /// A queue receiving every event from now on, in coordinator order.
    ///
    /// Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<NetworkEvent> {
        let (tx, rx) = std::sync::mpsc::channel();
        lock(&self.hooks.subscribers).push(tx);
        rx
    }
}

impl Drop for PeerNetworkService {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for PeerNetworkService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerNetworkService")
            .field("device_name", &self.config.node.device_name)
            .field("port", &self.config.node.port)
            .field("local_id", &self.local_id())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
