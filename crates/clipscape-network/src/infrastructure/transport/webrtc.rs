//! WebRTC data-channel negotiator.
//!
//! Each negotiation builds its own `RTCPeerConnection`.  The offerer creates a
//! single ordered data channel; the answerer receives it through
//! `on_data_channel`.  Session descriptions are sent with all ICE candidates
//! embedded (non-trickle), so one offer and one answer are enough.
//!
//! # Close reporting
//!
//! The data channel's `on_close` and the peer connection entering `Failed` or
//! `Closed` both mean the channel is gone.  Whichever fires first delivers a
//! single [`ChannelEvent::Closed`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, trace};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::application::transport::{
    ChannelEvent, ChannelSink, DataChannel, Negotiation, Negotiator, TransportError,
};
use crate::infrastructure::storage::config::NodeConfig;

/// Upper bound on ICE candidate gathering before the description is sent
/// with whatever candidates are known.
const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(3);

type OpenSignal = Arc<Mutex<Option<oneshot::Sender<Arc<RTCDataChannel>>>>>;

fn negotiation_error(e: webrtc::Error) -> TransportError {
    TransportError::Negotiation(e.to_string())
}

/// Production [`Negotiator`] backed by the `webrtc` crate.
#[derive(Debug, Clone)]
pub struct WebRtcNegotiator {
    ice_servers: Vec<String>,
    label: String,
}

impl WebRtcNegotiator {
    pub fn new(ice_servers: Vec<String>, label: impl Into<String>) -> Self {
        Self {
            ice_servers,
            label: label.into(),
        }
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        Self::new(
            config.transport.ice_servers.clone(),
            config.transport.channel_label.clone(),
        )
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }

    async fn prepare_offer(
        &self,
        pc: &RTCPeerConnection,
        sink: ChannelSink,
        closed: Arc<AtomicBool>,
        opened: OpenSignal,
    ) -> Result<String, TransportError> {
        let dc = pc
            .create_data_channel(&self.label, None)
            .await
            .map_err(negotiation_error)?;
        attach_channel_handlers(&dc, sink, closed, opened);

        let offer = pc.create_offer(None).await.map_err(negotiation_error)?;
        gather_local_description(pc, offer).await
    }

    /// Builds a peer connection that reports failure through `sink`.
    async fn peer_connection(
        &self,
        sink: &ChannelSink,
        closed: &Arc<AtomicBool>,
    ) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media).map_err(negotiation_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(self.rtc_configuration())
                .await
                .map_err(negotiation_error)?,
        );

        let sink = sink.clone();
        let closed = Arc::clone(closed);
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let sink = sink.clone();
            let closed = Arc::clone(&closed);
            Box::pin(async move {
                trace!("peer connection state: {state}");
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) {
                    report_closed(&sink, &closed);
                }
            })
        }));

        Ok(pc)
    }
}

fn report_closed(sink: &ChannelSink, closed: &AtomicBool) {
    if !closed.swap(true, Ordering::SeqCst) {
        sink.deliver(ChannelEvent::Closed);
    }
}

/// Wires open, message, and close handlers onto a data channel.
fn attach_channel_handlers(
    dc: &Arc<RTCDataChannel>,
    sink: ChannelSink,
    closed: Arc<AtomicBool>,
    opened: OpenSignal,
) {
    let weak: Weak<RTCDataChannel> = Arc::downgrade(dc);
    dc.on_open(Box::new(move || {
        let weak = weak.clone();
        let opened = Arc::clone(&opened);
        Box::pin(async move {
            let sender = opened.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let (Some(sender), Some(dc)) = (sender, weak.upgrade()) {
                let _ = sender.send(dc);
            }
        })
    }));

    let message_sink = sink.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let sink = message_sink.clone();
        Box::pin(async move {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => sink.deliver(ChannelEvent::Message(text)),
                Err(_) => debug!("dropping non-UTF-8 data channel message"),
            }
        })
    }));

    dc.on_close(Box::new(move || {
        let sink = sink.clone();
        let closed = Arc::clone(&closed);
        Box::pin(async move {
            report_closed(&sink, &closed);
        })
    }));
}

/// Sets the local description and returns it once ICE gathering finishes.
async fn gather_local_description(
    pc: &RTCPeerConnection,
    description: RTCSessionDescription,
) -> Result<String, TransportError> {
    let mut gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(description)
        .await
        .map_err(negotiation_error)?;

    if timeout(ICE_GATHER_TIMEOUT, gathered.recv()).await.is_err() {
        debug!("ICE gathering incomplete after {ICE_GATHER_TIMEOUT:?}, sending known candidates");
    }

    pc.local_description()
        .await
        .map(|d| d.sdp)
        .ok_or_else(|| TransportError::Negotiation("no local description".to_string()))
}

#[async_trait]
impl Negotiator for WebRtcNegotiator {
    async fn create_offer(&self, sink: ChannelSink) -> Result<Box<dyn Negotiation>, TransportError> {
        let closed = Arc::new(AtomicBool::new(false));
        let pc = self.peer_connection(&sink, &closed).await?;
        let (open_tx, open_rx) = oneshot::channel();
        let opened: OpenSignal = Arc::new(Mutex::new(Some(open_tx)));

        match self.prepare_offer(&pc, sink, closed, opened).await {
            Ok(local_sdp) => Ok(Box::new(WebRtcNegotiation {
                pc,
                local_sdp,
                offerer: true,
                opened: open_rx,
            })),
            Err(e) => {
                close_quietly(&pc).await;
                Err(e)
            }
        }
    }

    async fn create_answer(
        &self,
        offer_sdp: &str,
        sink: ChannelSink,
    ) -> Result<Box<dyn Negotiation>, TransportError> {
        let closed = Arc::new(AtomicBool::new(false));
        let pc = self.peer_connection(&sink, &closed).await?;
        let (open_tx, open_rx) = oneshot::channel();
        let opened: OpenSignal = Arc::new(Mutex::new(Some(open_tx)));

        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let sink = sink.clone();
            let closed = Arc::clone(&closed);
            let opened = Arc::clone(&opened);
            Box::pin(async move {
                debug!("remote data channel {:?} announced", dc.label());
                attach_channel_handlers(&dc, sink, closed, opened);
            })
        }));

        match prepare_answer(&pc, offer_sdp).await {
            Ok(local_sdp) => Ok(Box::new(WebRtcNegotiation {
                pc,
                local_sdp,
                offerer: false,
                opened: open_rx,
            })),
            Err(e) => {
                close_quietly(&pc).await;
                Err(e)
            }
        }
    }
}

async fn prepare_answer(pc: &RTCPeerConnection, offer_sdp: &str) -> Result<String, TransportError> {
    let offer = RTCSessionDescription::offer(offer_sdp.to_string()).map_err(negotiation_error)?;
    pc.set_remote_description(offer)
        .await
        .map_err(negotiation_error)?;
    let answer = pc.create_answer(None).await.map_err(negotiation_error)?;
    gather_local_description(pc, answer).await
}

async fn close_quietly(pc: &RTCPeerConnection) {
    if let Err(e) = pc.close().await {
        debug!("closing peer connection: {e}");
    }
}

// ── Negotiation ───────────────────────────────────────────────────────────────

struct WebRtcNegotiation {
    pc: Arc<RTCPeerConnection>,
    local_sdp: String,
    offerer: bool,
    opened: oneshot::Receiver<Arc<RTCDataChannel>>,
}

#[async_trait]
impl Negotiation for WebRtcNegotiation {
    fn local_description(&self) -> &str {
        &self.local_sdp
    }

    async fn apply_remote_answer(&mut self, sdp: &str) -> Result<(), TransportError> {
        if !self.offerer {
            return Err(TransportError::Negotiation(
                "the answering side has no remote answer".to_string(),
            ));
        }
        let answer = RTCSessionDescription::answer(sdp.to_string()).map_err(negotiation_error)?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(negotiation_error)
    }

    async fn wait_open(self: Box<Self>, limit: Duration) -> Result<Arc<dyn DataChannel>, TransportError> {
        let WebRtcNegotiation { pc, opened, .. } = *self;
        let error = match timeout(limit, opened).await {
            Ok(Ok(dc)) => return Ok(Arc::new(WebRtcChannel { pc, dc }) as Arc<dyn DataChannel>),
            Ok(Err(_)) => TransportError::NotOpen,
            Err(_) => TransportError::OpenTimeout(limit),
        };
        close_quietly(&pc).await;
        Err(error)
    }

    async fn abort(self: Box<Self>) {
        close_quietly(&self.pc).await;
    }
}

// ── Channel ───────────────────────────────────────────────────────────────────

/// An open WebRTC data channel together with the connection that owns it.
struct WebRtcChannel {
    pc: Arc<RTCPeerConnection>,
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if self.dc.ready_state() != RTCDataChannelState::Open {
            return Err(TransportError::NotOpen);
        }
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            debug!("closing data channel: {e}");
        }
        close_quietly(&self.pc).await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_uses_transport_section() {
        // Arrange
        let mut cfg = NodeConfig::default();
        cfg.transport.ice_servers = vec!["stun:example.org:3478".to_string()];
        cfg.transport.channel_label = "clips".to_string();

        // Act
        let negotiator = WebRtcNegotiator::from_config(&cfg);

        // Assert
        assert_eq!(negotiator.label, "clips");
        let rtc = negotiator.rtc_configuration();
        assert_eq!(rtc.ice_servers.len(), 1);
        assert_eq!(rtc.ice_servers[0].urls, vec!["stun:example.org:3478"]);
    }

    #[test]
    fn test_empty_ice_list_gives_host_candidates_only() {
        let negotiator = WebRtcNegotiator::new(Vec::new(), "clipscape");
        assert!(negotiator.rtc_configuration().ice_servers.is_empty());
    }

    #[tokio::test]
    async fn test_answer_rejects_garbage_offer() {
        // Arrange
        let negotiator = WebRtcNegotiator::new(Vec::new(), "clipscape");
        let sink = ChannelSink::new(|_| {});

        // Act
        let result = negotiator.create_answer("not an sdp", sink).await;

        // Assert
        assert!(matches!(result, Err(TransportError::Negotiation(_))));
    }

    #[tokio::test]
    #[ignore = "opens real UDP sockets for ICE"]
    async fn test_two_local_peers_exchange_a_message() {
        // Arrange
        let negotiator = WebRtcNegotiator::new(Vec::new(), "clipscape");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let answer_sink = ChannelSink::new(move |ev| {
            let _ = tx.send(ev);
        });

        let mut offer = negotiator.create_offer(ChannelSink::new(|_| {})).await.unwrap();
        let answer = negotiator
            .create_answer(offer.local_description(), answer_sink)
            .await
            .unwrap();
        let answer_sdp = answer.local_description().to_string();
        let answer_task = tokio::spawn(answer.wait_open(Duration::from_secs(10)));

        // Act
        offer.apply_remote_answer(&answer_sdp).await.unwrap();
        let offerer = offer.wait_open(Duration::from_secs(10)).await.unwrap();
        let answerer = answer_task.await.unwrap().unwrap();
        offerer.send_text("hello".to_string()).await.unwrap();

        // Assert
        let event = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(event, Some(ChannelEvent::Message("hello".to_string())));
        offerer.close().await;
        answerer.close().await;
    }
}
