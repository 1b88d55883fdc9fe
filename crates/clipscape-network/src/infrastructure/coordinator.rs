//! The coordinator: a single task that owns every piece of mutable network
//! state.
//!
//! # Actor model (for beginners)
//!
//! Many things happen concurrently: the signaling server accepts offers,
//! discovery passes collect replies, data channels deliver messages, and
//! application threads ask to send.  Instead of sharing the peer registry
//! behind a lock, exactly one task (this coordinator) owns it.  Everyone else
//! posts an [`Inbox`] message and, when they need an answer, waits on a reply
//! channel.
//!
//! ```text
//!   PeerNetworkService ──Command──┐
//!   signaling server ──Inbound────┤
//!   handshake tasks ──Established─┼──► Coordinator ──NetworkEvent──► dispatcher
//!   data channels ──Channel───────┤        │
//!   discovery passes ──PlanOffers─┘        └── owns PeerRegistry
//! ```
//!
//! Slow work (discovery windows, TCP exchanges, waiting for channels to open)
//! runs on spawned tasks so the coordinator itself never blocks.  Those tasks
//! report back through the inbox, and results for sessions that were replaced
//! in the meantime are recognised by their [`SessionTicket`] and discarded.
//!
//! # Timers
//!
//! - Heartbeat: evicts peers whose last pong is too old, pings the rest, and
//!   discards abandoned chunk sets.
//! - Rediscovery: starts a discovery pass; the first tick fires immediately so
//!   a node looks for peers as soon as it starts.  A tick is skipped while the
//!   previous periodic pass is still running.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clipscape_core::protocol::channel::CHUNK_SET_MAX_AGE;
use clipscape_core::{DiscoveryRecord, PeerId, PeerInfo};
use futures_util::future::join_all;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{interval, interval_at, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::application::events::NetworkEvent;
use crate::application::registry::{Establishment, InboundDecision, PeerRegistry, SessionTicket};
use crate::application::transport::{ChannelEvent, DataChannel, Negotiator};
use crate::infrastructure::discovery::{
    bind_responder, discover, responder_bind_ip, run_responder, DiscoveryError, DiscoveryProbe,
};
use crate::infrastructure::signaling::{offer_handshake, run_signaling_server, HandshakeContext};
use crate::infrastructure::storage::config::{ConfigError, NodeConfig};

/// One-shot reply slot for a blocking caller.
pub type Reply<T> = std::sync::mpsc::SyncSender<T>;

/// Error type for starting a node.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The TCP signaling port is unavailable.
    #[error("failed to bind signaling listener on {addr}: {source}")]
    BindSignaling {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The UDP discovery port is unavailable.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

/// Requests from the service facade.
#[derive(Debug)]
pub enum Command {
    Broadcast {
        text: String,
        reply: Reply<usize>,
    },
    BroadcastJson {
        value: serde_json::Value,
        reply: Reply<usize>,
    },
    SendToPeer {
        peer: PeerId,
        text: String,
        reply: Reply<bool>,
    },
    SendJsonToPeer {
        peer: PeerId,
        value: serde_json::Value,
        reply: Reply<bool>,
    },
    ConnectedPeers {
        reply: Reply<Vec<PeerInfo>>,
    },
    /// Runs a discovery pass now and replies with the connected peers once
    /// its handshakes finish.
    DiscoverNow {
        timeout: Option<Duration>,
        reply: Reply<Vec<PeerInfo>>,
    },
    /// Offers to one known address and replies whether it ended connected.
    Connect {
        id: PeerId,
        reply: Reply<bool>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// What the coordinator is waiting to report when a pass finishes.
#[derive(Debug)]
pub enum PassReply {
    Periodic,
    Discover(Reply<Vec<PeerInfo>>),
    Connect(PeerId, Reply<bool>),
}

/// A reply held back until no handshake with `peers` is in flight.
#[derive(Debug)]
struct Waiter {
    peers: Vec<PeerId>,
    reply: PassReply,
}

/// Everything that can arrive at the coordinator.
pub enum Inbox {
    Command(Command),
    /// A discovery pass finished collecting; the reply lists the sessions the
    /// coordinator reserved for offering.
    PlanOffers {
        records: Vec<DiscoveryRecord>,
        reply: oneshot::Sender<Vec<SessionTicket>>,
    },
    /// The signaling server read an offer and asks whether to answer it.
    InboundOffer {
        id: PeerId,
        display_name: String,
        local_seen: PeerId,
        reply: oneshot::Sender<InboundDecision>,
    },
    Established {
        ticket: SessionTicket,
        display_name: Option<String>,
        channel: Arc<dyn DataChannel>,
    },
    HandshakeFailed {
        ticket: SessionTicket,
        reason: String,
    },
    Channel {
        ticket: SessionTicket,
        event: ChannelEvent,
    },
    /// A pass (or a single connect) ran all the handshakes it started.
    PassFinished { done: PassReply, peers: Vec<PeerId> },
}

/// The network actor.  Build it with [`Coordinator::start`], then drive it
/// with [`Coordinator::run`].
pub struct Coordinator {
    config: NodeConfig,
    registry: PeerRegistry,
    ctx: HandshakeContext,
    inbox_rx: mpsc::UnboundedReceiver<Inbox>,
    events: mpsc::UnboundedSender<NetworkEvent>,
    probe: DiscoveryProbe,
    tasks: JoinSet<()>,
    periodic_pass_running: bool,
    waiters: Vec<Waiter>,
}

impl Coordinator {
    /// Binds the signaling listener and the discovery responder and spawns
    /// both.  The node is reachable once this returns.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError`] if the configuration is invalid or either
    /// socket cannot be bound.  Nothing is left running on error.
    pub async fn start(
        config: &NodeConfig,
        negotiator: Arc<dyn Negotiator>,
        events: mpsc::UnboundedSender<NetworkEvent>,
    ) -> Result<Self, NetworkError> {
        let bind_ip = config.bind_ip()?;
        let local_ip = match config.local_ip_override()? {
            Some(ip) => ip,
            None => detect_local_ip(),
        };

        let signaling_addr = SocketAddr::new(bind_ip, config.node.port);
        let listener = TcpListener::bind(signaling_addr)
            .await
            .map_err(|source| NetworkError::BindSignaling {
                addr: signaling_addr,
                source,
            })?;
        // Port 0 means "any": the responder then shares whatever TCP got.
        let port = listener
            .local_addr()
            .map_err(|source| NetworkError::BindSignaling {
                addr: signaling_addr,
                source,
            })?
            .port();
        let responder = bind_responder(responder_bind_ip(bind_ip, config.discovery.broadcast), port).await?;

        let mut config = config.clone();
        config.node.port = port;

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let ctx = HandshakeContext {
            negotiator,
            inbox: inbox_tx,
            device_name: config.node.device_name.clone(),
            port,
        };

        let mut tasks = JoinSet::new();
        tasks.spawn(run_signaling_server(listener, ctx.clone()));
        tasks.spawn(run_responder(responder, config.node.device_name.clone(), port));

        let local_id = PeerId::new(local_ip, port);
        info!(
            "node {:?} started as {local_id} (discovery every {:?})",
            config.node.device_name,
            config.discovery_interval()
        );

        Ok(Self {
            probe: DiscoveryProbe::from_config(&config, local_ip),
            registry: PeerRegistry::new(local_id),
            config,
            ctx,
            inbox_rx,
            events,
            tasks,
            periodic_pass_running: false,
            waiters: Vec::new(),
        })
    }

    /// A handle for posting to this coordinator.
    pub fn inbox(&self) -> mpsc::UnboundedSender<Inbox> {
        self.ctx.inbox.clone()
    }

    pub fn local_id(&self) -> PeerId {
        self.registry.local_id()
    }

    /// Serves the inbox and timers until a [`Command::Shutdown`] arrives.
    pub async fn run(mut self) {
        let every = self.config.heartbeat_interval();
        let mut heartbeat = interval_at(tokio::time::Instant::now() + every, every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut rediscovery = interval(self.config.discovery_interval());
        rediscovery.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                message = self.inbox_rx.recv() => {
                    // The coordinator holds a sender itself, so `None` never comes.
                    let Some(message) = message else { break };
                    if let Some(reply) = self.handle(message).await {
                        self.shutdown().await;
                        let _ = reply.try_send(());
                        return;
                    }
                }
                _ = heartbeat.tick() => self.heartbeat().await,
                _ = rediscovery.tick() => self.start_periodic_pass(),
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("background task panicked: {e}");
                        }
                    }
                }
            }
        }

        self.shutdown().await;
    }

    fn emit(&self, event: NetworkEvent) {
        let _ = self.events.send(event);
    }

    /// Handles one inbox message.  Returns the reply slot on shutdown.
    async fn handle(&mut self, message: Inbox) -> Option<Reply<()>> {
        match message {
            Inbox::Command(Command::Shutdown { reply }) => return Some(reply),
            Inbox::Command(command) => self.handle_command(command).await,
            Inbox::PlanOffers { records, reply } => {
                let tickets = self.plan_offers(records);
                let _ = reply.send(tickets);
            }
            Inbox::InboundOffer {
                id,
                display_name,
                local_seen,
                reply,
            } => {
                let decision = self.registry.decide_inbound(id, display_name, local_seen);
                debug!(peer = %id, "inbound offer: {}", decision.reason());
                if let Err(InboundDecision::Accept(ticket)) = reply.send(decision) {
                    self.registry.fail(ticket);
                }
            }
            Inbox::Established {
                ticket,
                display_name,
                channel,
            } => {
                self.establish(ticket, display_name, channel).await;
                self.settle_waiters();
            }
            Inbox::HandshakeFailed { ticket, reason } => {
                if self.registry.fail(ticket) {
                    debug!(peer = %ticket.id, "session dropped: {reason}");
                }
                self.settle_waiters();
            }
            Inbox::Channel { ticket, event } => self.channel_event(ticket, event).await,
            Inbox::PassFinished { done, peers } => match done {
                PassReply::Periodic => self.periodic_pass_running = false,
                reply => self.wait_for_handshakes(peers, reply),
            },
        }
        None
    }

    /// Replies once none of `peers` has a handshake in flight.
    ///
    /// A pass may find a peer whose handshake was started elsewhere (a
    /// periodic pass, or an inbound offer); its outcome is what the caller
    /// wants to see.
    fn wait_for_handshakes(&mut self, peers: Vec<PeerId>, reply: PassReply) {
        self.waiters.push(Waiter { peers, reply });
        self.settle_waiters();
    }

    fn settle_waiters(&mut self) {
        if self.waiters.is_empty() {
            return;
        }
        let registry = &self.registry;
        let (ready, waiting): (Vec<Waiter>, Vec<Waiter>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|w| !w.peers.iter().any(|id| registry.is_negotiating(id)));
        self.waiters = waiting;

        for waiter in ready {
            match waiter.reply {
                PassReply::Periodic => {}
                PassReply::Discover(reply) => {
                    let _ = reply.try_send(registry.connected());
                }
                PassReply::Connect(id, reply) => {
                    let _ = reply.try_send(registry.is_connected(&id));
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Broadcast { text, reply } => {
                let mut sent = 0;
                for session in self.registry.connected_sessions_mut() {
                    if session.send_message(&text).await {
                        sent += 1;
                    }
                }
                let _ = reply.try_send(sent);
            }
            Command::BroadcastJson { value, reply } => {
                let mut sent = 0;
                for session in self.registry.connected_sessions_mut() {
                    if session.send_json(&value).await {
                        sent += 1;
                    }
                }
                let _ = reply.try_send(sent);
            }
            Command::SendToPeer { peer, text, reply } => {
                let sent = match self.registry.get(&peer) {
                    Some(session) => session.send_message(&text).await,
                    None => false,
                };
                let _ = reply.try_send(sent);
            }
            Command::SendJsonToPeer { peer, value, reply } => {
                let sent = match self.registry.get(&peer) {
                    Some(session) => session.send_json(&value).await,
                    None => false,
                };
                let _ = reply.try_send(sent);
            }
            Command::ConnectedPeers { reply } => {
                let _ = reply.try_send(self.registry.connected());
            }
            Command::DiscoverNow { timeout, reply } => {
                let probe = match timeout {
                    Some(t) => self.probe.clone().with_timeout(t),
                    None => self.probe.clone(),
                };
                self.start_pass(probe, PassReply::Discover(reply));
            }
            Command::Connect { id, reply } => self.connect(id, reply),
            Command::Shutdown { .. } => {}
        }
    }

    // ── Outbound handshakes ───────────────────────────────────────────────────

    fn plan_offers(&mut self, records: Vec<DiscoveryRecord>) -> Vec<SessionTicket> {
        let found = records.len();
        let tickets: Vec<SessionTicket> = records
            .into_iter()
            .filter_map(|r| self.registry.plan_offer(r.peer_id(), r.display_name))
            .collect();
        if found > 0 {
            debug!("discovery found {found} peer(s), offering to {}", tickets.len());
        }
        tickets
    }

    fn start_periodic_pass(&mut self) {
        if self.periodic_pass_running {
            trace!("previous discovery pass still running, skipping tick");
            return;
        }
        self.periodic_pass_running = true;
        self.start_pass(self.probe.clone(), PassReply::Periodic);
    }

    /// Spawns discover → plan → offer to all planned peers → report.
    fn start_pass(&mut self, probe: DiscoveryProbe, done: PassReply) {
        let ctx = self.ctx.clone();
        self.tasks.spawn(async move {
            let records = discover(&probe).await;
            let peers: Vec<PeerId> = records.iter().map(DiscoveryRecord::peer_id).collect();
            let (reply_tx, reply_rx) = oneshot::channel();
            if ctx.inbox.send(Inbox::PlanOffers { records, reply: reply_tx }).is_err() {
                return;
            }
            let Ok(tickets) = reply_rx.await else {
                return;
            };
            join_all(tickets.into_iter().map(|t| offer_handshake(ctx.clone(), t))).await;
            let _ = ctx.inbox.send(Inbox::PassFinished { done, peers });
        });
    }

    fn connect(&mut self, id: PeerId, reply: Reply<bool>) {
        if self.registry.is_connected(&id) {
            let _ = reply.try_send(true);
            return;
        }
        let Some(ticket) = self.registry.plan_offer(id, id.to_string()) else {
            debug!(peer = %id, "not offering: self or handshake already in flight");
            self.wait_for_handshakes(vec![id], PassReply::Connect(id, reply));
            return;
        };

        let ctx = self.ctx.clone();
        self.tasks.spawn(async move {
            offer_handshake(ctx.clone(), ticket).await;
            let _ = ctx.inbox.send(Inbox::PassFinished {
                done: PassReply::Connect(id, reply),
                peers: vec![id],
            });
        });
    }

    // ── Handshake results and channel events ──────────────────────────────────

    async fn establish(
        &mut self,
        ticket: SessionTicket,
        display_name: Option<String>,
        channel: Arc<dyn DataChannel>,
    ) {
        let now = Instant::now();
        match self
            .registry
            .establish(ticket, display_name, Arc::clone(&channel), now)
        {
            Establishment::Connected(info) => {
                info!(peer = %info.id, "connected to {:?}", info.display_name);
                self.emit(NetworkEvent::PeerConnected(info));

                let backlog = self
                    .registry
                    .session_for(ticket)
                    .map(|s| s.take_backlog())
                    .unwrap_or_default();
                for text in backlog {
                    self.channel_event(ticket, ChannelEvent::Message(text)).await;
                }
            }
            Establishment::Stale => {
                debug!(peer = %ticket.id, "discarding channel from superseded handshake");
                channel.close().await;
            }
        }
    }

    async fn channel_event(&mut self, ticket: SessionTicket, event: ChannelEvent) {
        let Some(session) = self.registry.session_for(ticket) else {
            trace!(peer = %ticket.id, "event for a session that no longer exists");
            return;
        };

        match event {
            ChannelEvent::Message(text) if session.is_connected() => {
                if let Some(message) = session.handle_text(&text, Instant::now()).await {
                    self.emit(NetworkEvent::MessageReceived {
                        peer: ticket.id,
                        message,
                    });
                }
            }
            ChannelEvent::Message(text) => session.push_backlog(text),
            ChannelEvent::Closed if session.is_connected() => {
                info!(peer = %ticket.id, "channel closed by remote");
                if let Some(mut session) = self.registry.remove(&ticket.id) {
                    session.close().await;
                }
                self.emit(NetworkEvent::PeerDisconnected(ticket.id));
            }
            // A negotiating session learns about the failure from its handshake.
            ChannelEvent::Closed => {}
        }
    }

    // ── Timers ────────────────────────────────────────────────────────────────

    async fn heartbeat(&mut self) {
        let now = Instant::now();
        let timeout = self.config.peer_timeout();

        for id in self.registry.stale_peers(now, timeout) {
            if let Some(mut session) = self.registry.remove(&id) {
                warn!(peer = %id, "no heartbeat reply within {timeout:?}, disconnecting");
                session.fail().await;
                self.emit(NetworkEvent::PeerDisconnected(id));
            }
        }

        for session in self.registry.connected_sessions_mut() {
            session.ping(now).await;
            let dropped = session.prune_chunks(now, CHUNK_SET_MAX_AGE);
            if dropped > 0 {
                debug!(peer = %session.id(), "discarded {dropped} incomplete chunk set(s)");
            }
        }
    }

    async fn shutdown(&mut self) {
        self.tasks.shutdown().await;
        for mut session in self.registry.drain() {
            let was_connected = session.is_connected();
            session.close().await;
            if was_connected {
                self.emit(NetworkEvent::PeerDisconnected(session.id()));
            }
        }
        info!("node {} stopped", self.registry.local_id());
    }
}

fn detect_local_ip() -> IpAddr {
    match local_ip_address::local_ip() {
        Ok(ip) => ip,
        Err(e) => {
            warn!("cannot detect LAN address ({e}), using loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
