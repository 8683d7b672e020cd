//! WebRTC transport: one ordered, reliable data channel per connection.
//!
//! The endpoint that calls `prepare` is the offerer. Its descriptor is a
//! JSON-serialized SDP offer with all ICE candidates gathered up front, so
//! signaling is a single round trip:
//!
//! 1. offerer publishes the offer under its own id,
//! 2. answerer fetches it, publishes the answer under `<offerer id>/answer`,
//! 3. offerer fetches the answer inside `accept` and the channel opens.

use super::channel::{Channel, Link};
use super::signaling::{Signaling, Transport};
use crate::core::config::{
    DATA_CHANNEL_LABEL, DATA_CHANNEL_TIMEOUT, ICE_GATHER_TIMEOUT, SCTP_MAX_MESSAGE_SIZE,
};
use crate::core::error::EngineError;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::{SctpMaxMessageSize, SettingEngine};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// How often the offerer re-polls signaling for a not-yet-published answer.
const ANSWER_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Shared sink for inbound messages. Taken (and thereby closed) when the
/// channel or the peer connection goes away.
type IncomingTx = Arc<Mutex<Option<mpsc::UnboundedSender<Bytes>>>>;

fn answer_key(offerer_id: &str) -> String {
    format!("{offerer_id}/answer")
}

/// Keep engine errors (signaling failures) as they are; everything the
/// WebRTC stack raises becomes a handshake failure.
fn into_engine_error(e: anyhow::Error) -> EngineError {
    match e.downcast::<EngineError>() {
        Ok(engine) => engine,
        Err(other) => EngineError::HandshakeFailed(format!("{other:#}")),
    }
}

struct PendingOffer {
    self_id: String,
    pc: Arc<RTCPeerConnection>,
    dc: Arc<RTCDataChannel>,
    incoming: mpsc::UnboundedReceiver<Bytes>,
}

pub struct WebRtcTransport {
    signaling: Arc<dyn Signaling>,
    ice_servers: Vec<String>,
    offer: tokio::sync::Mutex<Option<PendingOffer>>,
}

impl WebRtcTransport {
    pub fn new(signaling: Arc<dyn Signaling>) -> Self {
        Self {
            signaling,
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            offer: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_ice_servers(mut self, urls: Vec<String>) -> Self {
        if !urls.is_empty() {
            self.ice_servers = urls;
        }
        self
    }

    async fn new_peer_connection(&self, incoming: IncomingTx) -> Result<Arc<RTCPeerConnection>> {
        let mut me = MediaEngine::default();
        let reg = register_default_interceptors(Registry::new(), &mut me)?;

        let mut se = SettingEngine::default();
        se.set_sctp_max_message_size_can_send(SctpMaxMessageSize::Bounded(SCTP_MAX_MESSAGE_SIZE));

        let api = APIBuilder::new()
            .with_setting_engine(se)
            .with_media_engine(me)
            .with_interceptor_registry(reg)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: vec![RTCIceServer {
                    urls: self.ice_servers.clone(),
                    ..Default::default()
                }],
                ..Default::default()
            })
            .await?,
        );

        pc.on_peer_connection_state_change(Box::new(move |s| {
            let incoming = incoming.clone();
            Box::pin(async move {
                match s {
                    RTCPeerConnectionState::Connected => {
                        info!(event = "webrtc_connected", "WebRTC connection established");
                    }
                    RTCPeerConnectionState::Failed => {
                        error!(event = "webrtc_failed", "WebRTC connection failed");
                        close_incoming(&incoming);
                    }
                    RTCPeerConnectionState::Disconnected => {
                        warn!(
                            event = "webrtc_disconnected",
                            "WebRTC transient disconnect (ICE may recover)"
                        );
                    }
                    RTCPeerConnectionState::Closed => {
                        info!(event = "webrtc_closed", "WebRTC connection closed");
                        close_incoming(&incoming);
                    }
                    _ => {}
                }
            })
        }));

        Ok(pc)
    }

    async fn create_offer(&self, self_id: &str) -> Result<Bytes> {
        let (tx, incoming) = mpsc::unbounded_channel();
        let incoming_tx: IncomingTx = Arc::new(Mutex::new(Some(tx)));
        let pc = self.new_peer_connection(incoming_tx.clone()).await?;

        // Ordered and fully reliable: the codec has no reordering logic.
        let dc = pc
            .create_data_channel(
                DATA_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        attach_channel_handlers(&dc, incoming_tx);

        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer).await?;
        let sdp = gather_local_description(&pc).await?;

        let replaced = self.offer.lock().await.replace(PendingOffer {
            self_id: self_id.to_string(),
            pc,
            dc,
            incoming,
        });
        if let Some(old) = replaced {
            let _ = old.pc.close().await;
        }
        Ok(Bytes::from(sdp))
    }

    async fn complete_offer(&self) -> Result<Link> {
        let pending = self
            .offer
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("no offer prepared"))?;

        let answer = loop {
            match self
                .signaling
                .fetch_remote_descriptor(&answer_key(&pending.self_id))
                .await
            {
                Ok(answer) => break answer,
                Err(EngineError::PeerNotFound(_)) => tokio::time::sleep(ANSWER_POLL_INTERVAL).await,
                Err(e) => return Err(e.into()),
            }
        };

        let desc: RTCSessionDescription =
            serde_json::from_slice(&answer).context("answer is not a session description")?;
        pending.pc.set_remote_description(desc).await?;
        wait_open(&pending.dc).await?;

        Ok(Link {
            remote_id: format!("{}-answerer", pending.self_id),
            channel: Arc::new(WebRtcChannel {
                pc: pending.pc,
                dc: pending.dc,
            }),
            incoming: pending.incoming,
        })
    }

    async fn answer_offer(&self, remote_id: &str, descriptor: Bytes) -> Result<Link> {
        let (tx, incoming) = mpsc::unbounded_channel();
        let incoming_tx: IncomingTx = Arc::new(Mutex::new(Some(tx)));
        let pc = self.new_peer_connection(incoming_tx.clone()).await?;

        let (dc_tx, dc_rx) = oneshot::channel::<Arc<RTCDataChannel>>();
        let dc_tx = Arc::new(Mutex::new(Some(dc_tx)));
        pc.on_data_channel(Box::new(move |dc| {
            let dc_tx = dc_tx.clone();
            let incoming_tx = incoming_tx.clone();
            Box::pin(async move {
                if dc.label() != DATA_CHANNEL_LABEL {
                    warn!(event = "dc_unexpected", channel = %dc.label(), "Ignoring unknown data channel");
                    return;
                }
                attach_channel_handlers(&dc, incoming_tx);
                if let Ok(mut guard) = dc_tx.lock() {
                    if let Some(tx) = guard.take() {
                        let _ = tx.send(dc);
                    }
                }
            })
        }));

        let desc: RTCSessionDescription =
            serde_json::from_slice(&descriptor).context("offer is not a session description")?;
        pc.set_remote_description(desc).await?;
        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer).await?;
        let sdp = gather_local_description(&pc).await?;

        self.signaling
            .publish_local_descriptor(&answer_key(remote_id), Bytes::from(sdp))
            .await?;

        // Bounded by the caller's handshake timeout: the offerer may need a
        // while to receive the answer.
        let dc = dc_rx.await.context("peer connection dropped before the data channel")?;
        wait_open(&dc).await?;

        Ok(Link {
            remote_id: remote_id.to_string(),
            channel: Arc::new(WebRtcChannel { pc, dc }),
            incoming,
        })
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn prepare(&self, self_id: &str) -> Result<Bytes, EngineError> {
        self.create_offer(self_id).await.map_err(into_engine_error)
    }

    async fn dial(&self, remote_id: &str, descriptor: Bytes) -> Result<Link, EngineError> {
        self.answer_offer(remote_id, descriptor)
            .await
            .map_err(into_engine_error)
    }

    async fn accept(&self) -> Result<Link, EngineError> {
        self.complete_offer().await.map_err(into_engine_error)
    }
}

// ── Channel ──────────────────────────────────────────────────────────────────

struct WebRtcChannel {
    pc: Arc<RTCPeerConnection>,
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl Channel for WebRtcChannel {
    async fn send(&self, message: Bytes) -> Result<(), EngineError> {
        self.dc
            .send(&message)
            .await
            .map(|_| ())
            .map_err(|e| EngineError::Transport(e.to_string()))
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            debug!(event = "dc_close_error", %e);
        }
        if let Err(e) = self.pc.close().await {
            debug!(event = "pc_close_error", %e);
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn close_incoming(incoming: &IncomingTx) {
    if let Ok(mut guard) = incoming.lock() {
        guard.take();
    }
}

fn attach_channel_handlers(dc: &Arc<RTCDataChannel>, incoming: IncomingTx) {
    let label = dc.label().to_string();
    let on_close = incoming.clone();
    dc.on_close(Box::new(move || {
        let label = label.clone();
        let incoming = on_close.clone();
        Box::pin(async move {
            warn!(event = "dc_closed", channel = %label, "DataChannel closed by transport");
            close_incoming(&incoming);
        })
    }));

    let label = dc.label().to_string();
    dc.on_error(Box::new(move |err| {
        let label = label.clone();
        Box::pin(async move {
            error!(event = "dc_error", channel = %label, %err, "DataChannel transport error");
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        if let Ok(guard) = incoming.lock() {
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(msg.data);
            }
        }
        Box::pin(async {})
    }));
}

async fn wait_open(dc: &Arc<RTCDataChannel>) -> Result<()> {
    match dc.ready_state() {
        RTCDataChannelState::Open => return Ok(()),
        RTCDataChannelState::Closed => {
            return Err(anyhow!("DataChannel '{}' is permanently closed", dc.label()))
        }
        _ => {}
    }
    let (tx, mut rx) = mpsc::channel(1);
    dc.on_open(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(()).await;
        })
    }));
    // The channel may have opened between the check and the registration.
    if dc.ready_state() == RTCDataChannelState::Open {
        return Ok(());
    }
    match timeout(DATA_CHANNEL_TIMEOUT, rx.recv()).await {
        Ok(_) => Ok(()),
        Err(_) => Err(anyhow!(
            "DataChannel '{}' open timeout (state: {:?})",
            dc.label(),
            dc.ready_state()
        )),
    }
}

/// Advertise our receive limit; webrtc-rs assumes 64 KB without it.
fn inject_max_message_size(mut desc: RTCSessionDescription) -> RTCSessionDescription {
    if !desc.sdp.contains("a=max-message-size:") {
        desc.sdp
            .push_str(&format!("a=max-message-size:{}\r\n", SCTP_MAX_MESSAGE_SIZE));
    }
    desc
}

/// Wait for ICE gathering to finish and return the full local description
/// as JSON.
async fn gather_local_description(pc: &Arc<RTCPeerConnection>) -> Result<String> {
    if pc.ice_gathering_state() != RTCIceGatheringState::Complete {
        let (tx, rx) = oneshot::channel::<()>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        pc.on_ice_gathering_state_change(Box::new(move |state| {
            let tx = tx.clone();
            Box::pin(async move {
                if state == RTCIceGathererState::Complete {
                    if let Ok(mut guard) = tx.lock() {
                        if let Some(tx) = guard.take() {
                            let _ = tx.send(());
                        }
                    }
                }
            })
        }));

        if pc.ice_gathering_state() != RTCIceGatheringState::Complete {
            timeout(ICE_GATHER_TIMEOUT, rx)
                .await
                .context("ICE gathering timeout")?
                .context("ICE gathering channel closed")?;
        }
    }

    let desc = pc
        .local_description()
        .await
        .ok_or_else(|| anyhow!("No local description after ICE gathering"))?;
    Ok(serde_json::to_string(&inject_max_message_size(desc))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_message_size_is_injected_once() {
        let desc = RTCSessionDescription::default();
        let desc = inject_max_message_size(desc);
        let again = inject_max_message_size(desc.clone());
        assert_eq!(desc.sdp.matches("a=max-message-size:").count(), 1);
        assert_eq!(desc.sdp, again.sdp);
    }

    #[test]
    fn signaling_errors_survive_conversion() {
        let e: anyhow::Error = EngineError::PeerNotFound("abc".into()).into();
        assert_eq!(
            into_engine_error(e.context("fetching answer")),
            EngineError::PeerNotFound("abc".into())
        );
        assert!(matches!(
            into_engine_error(anyhow!("ice failed")),
            EngineError::HandshakeFailed(_)
        ));
    }
}
