//! WebRTC session implementation
//!
//! Used by both the direct WebRTC variant (WebSocket signaling) and the
//! hybrid variant (HTTP signaling); the peer connection handling is
//! identical once signaling is established. This side is always the
//! offerer. Pane channels map to data channels; a reserved
//! `wicket-control` channel carries channel-open, resize, and layout
//! messages as small JSON frames.

pub mod signaling;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use url::Url;

use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use wicket_core::config::GateConfig;
use wicket_core::error::{ChannelError, FailureKind, SessionError};
use wicket_core::layout::LayoutSnapshot;
use wicket_core::state::{SessionState, StateCell};
use wicket_core::traits::{Channel, ChannelEvent, ChannelSpec, Session};
use wicket_core::types::{ChannelId, ReadyState, TermSize, TransportKind};

use crate::channel::ChannelCore;
use signaling::{HttpSignaling, SignalMessage, Signaling, WsSignaling};

/// Label of the reserved control channel
const CONTROL_LABEL: &str = "wicket-control";

/// Bound on waiting for the control channel to open
const CONTROL_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on waiting for a pane data channel to open
const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(15);

/// Bound on a layout fetch round trip
const LAYOUT_TIMEOUT: Duration = Duration::from_secs(10);

/// Requests sent to the peer on the control channel
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ControlRequest<'a> {
    Open {
        channel: &'a str,
        command: &'a str,
        columns: u16,
        rows: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent: Option<u32>,
    },
    Resize {
        channel: &'a str,
        columns: u16,
        rows: u16,
    },
    LayoutGet,
    LayoutPut {
        layout: &'a LayoutSnapshot,
    },
}

/// Messages received from the peer on the control channel
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ControlEvent {
    Layout { layout: Option<LayoutSnapshot> },
}

/// The reserved control channel: open tracking, request sending, and the
/// single pending layout round trip
struct ControlChannel {
    dc: Mutex<Option<Arc<RTCDataChannel>>>,
    open_tx: watch::Sender<bool>,
    pending_layout: Mutex<Option<oneshot::Sender<Option<LayoutSnapshot>>>>,
}

impl ControlChannel {
    fn new() -> Self {
        let (open_tx, _) = watch::channel(false);
        Self {
            dc: Mutex::new(None),
            open_tx,
            pending_layout: Mutex::new(None),
        }
    }

    async fn install(self: &Arc<Self>, dc: Arc<RTCDataChannel>) {
        let this = Arc::clone(self);
        dc.on_open(Box::new(move || {
            let _ = this.open_tx.send(true);
            Box::pin(async move {})
        }));

        let this = Arc::clone(self);
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let this = Arc::clone(&this);
            Box::pin(async move {
                this.handle_message(&msg.data).await;
            })
        }));

        let this = Arc::clone(self);
        dc.on_close(Box::new(move || {
            let this = Arc::clone(&this);
            Box::pin(async move {
                let _ = this.open_tx.send(false);
                this.pending_layout.lock().await.take();
            })
        }));

        *self.dc.lock().await = Some(dc);
    }

    async fn handle_message(&self, data: &[u8]) {
        match serde_json::from_slice::<ControlEvent>(data) {
            Ok(ControlEvent::Layout { layout }) => {
                if let Some(tx) = self.pending_layout.lock().await.take() {
                    let _ = tx.send(layout);
                }
            }
            Err(e) => tracing::debug!("Ignoring malformed control message: {}", e),
        }
    }

    async fn wait_open(&self) -> Result<(), SessionError> {
        let mut rx = self.open_tx.subscribe();
        let wait = async {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(CONTROL_OPEN_TIMEOUT, wait).await.is_err()
            || !*self.open_tx.borrow()
        {
            return Err(SessionError::Transport(
                "control channel is not open".to_string(),
            ));
        }
        Ok(())
    }

    async fn request(&self, request: &ControlRequest<'_>) -> Result<(), SessionError> {
        self.wait_open().await?;
        let guard = self.dc.lock().await;
        let dc = guard.as_ref().ok_or(SessionError::NotConnected)?;
        let json =
            serde_json::to_vec(request).map_err(|e| SessionError::Transport(e.to_string()))?;
        dc.send(&Bytes::from(json))
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn begin_layout_request(&self, tx: oneshot::Sender<Option<LayoutSnapshot>>) {
        *self.pending_layout.lock().await = Some(tx);
    }

    async fn clear(&self) {
        self.dc.lock().await.take();
        self.pending_layout.lock().await.take();
    }
}

/// WebRTC-backed session (direct or hybrid, depending on the signaling
/// client)
pub struct WebRtcSession {
    config: GateConfig,
    kind: TransportKind,
    state: Arc<StateCell>,
    pc: Arc<Mutex<Option<Arc<RTCPeerConnection>>>>,
    signaling: Arc<Mutex<Option<Arc<dyn Signaling>>>>,
    control: Arc<ControlChannel>,
    next_channel: AtomicU32,
    abort: CancellationToken,
}

impl WebRtcSession {
    /// Create an unconnected session. `kind` selects the signaling client:
    /// `WebRtc` for WebSocket, `Hybrid` for HTTP.
    pub fn new(config: GateConfig, kind: TransportKind) -> Self {
        debug_assert!(kind != TransportKind::Ssh);
        let session = Self {
            config,
            kind,
            state: Arc::new(StateCell::new()),
            pc: Arc::new(Mutex::new(None)),
            signaling: Arc::new(Mutex::new(None)),
            control: Arc::new(ControlChannel::new()),
            next_channel: AtomicU32::new(1),
            abort: CancellationToken::new(),
        };

        // Abrupt disconnects tear the transport down without a handshake.
        let pc = Arc::clone(&session.pc);
        let sig = Arc::clone(&session.signaling);
        let control = Arc::clone(&session.control);
        let abort = session.abort.clone();
        tokio::spawn(async move {
            abort.cancelled().await;
            if let Some(signaling) = sig.lock().await.take() {
                signaling.close().await;
            }
            if let Some(pc) = pc.lock().await.take() {
                let _ = pc.close().await;
            }
            control.clear().await;
        });

        session
    }

    async fn teardown(&self) {
        if let Some(signaling) = self.signaling.lock().await.take() {
            signaling.close().await;
        }
        if let Some(pc) = self.pc.lock().await.take() {
            let _ = pc.close().await;
        }
        self.control.clear().await;
    }

    /// Negotiate the peer connection: signaling, offer, ICE trickle, and
    /// the wait for the transport outcome
    async fn handshake(&self, url: &str) -> Result<(), FailureKind> {
        let signaling: Arc<dyn Signaling> = match self.kind {
            TransportKind::Hybrid => Arc::new(HttpSignaling::new(url).map_err(|e| {
                tracing::debug!("Signaling setup failed: {}", e);
                FailureKind::Unreachable
            })?),
            _ => Arc::new(WsSignaling::connect(url).await.map_err(|e| {
                tracing::debug!("Signaling connect failed: {}", e);
                FailureKind::Unreachable
            })?),
        };
        *self.signaling.lock().await = Some(Arc::clone(&signaling));

        let api = APIBuilder::new().build();
        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            tracing::debug!("Failed to create peer connection: {}", e);
            FailureKind::Unreachable
        })?);
        *self.pc.lock().await = Some(Arc::clone(&pc));

        // Map transport state onto the session state machine. A weak
        // reference avoids a handler -> peer connection cycle.
        let state = Arc::clone(&self.state);
        let weak = Arc::downgrade(&pc);
        let grace = self.config.keepalive.timeout;
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let state = Arc::clone(&state);
            let weak = weak.clone();
            Box::pin(async move {
                tracing::debug!("Peer connection state: {:?}", s);
                match s {
                    RTCPeerConnectionState::Connected => {
                        state.set(SessionState::Connected);
                    }
                    RTCPeerConnectionState::Failed => {
                        let kind = if state.get() == SessionState::Connected {
                            FailureKind::Disconnected
                        } else {
                            FailureKind::Unreachable
                        };
                        state.set(SessionState::Failed(kind));
                    }
                    RTCPeerConnectionState::Disconnected => {
                        // Mobile handoffs routinely bounce through
                        // Disconnected; only a stay past the keepalive
                        // timeout counts as dead.
                        tokio::spawn(async move {
                            tokio::time::sleep(grace).await;
                            if let Some(pc) = weak.upgrade() {
                                if pc.connection_state()
                                    == RTCPeerConnectionState::Disconnected
                                    && state.set(SessionState::Failed(FailureKind::TimedOut))
                                {
                                    tracing::warn!(
                                        "Peer connection stayed disconnected past keepalive timeout"
                                    );
                                }
                            }
                        });
                    }
                    _ => {}
                }
            })
        }));

        // Trickle our ICE candidates to the peer
        let sig = Arc::clone(&signaling);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sig = Arc::clone(&sig);
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(json) => {
                        let message = SignalMessage::IceCandidate {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_mline_index: json.sdp_mline_index.map(|i| i as u32),
                        };
                        if let Err(e) = sig.send(message).await {
                            tracing::debug!("Failed to send ICE candidate: {}", e);
                        }
                    }
                    Err(e) => tracing::debug!("Failed to serialize ICE candidate: {}", e),
                }
            })
        }));

        // The control channel is created before the offer so it is part of
        // the negotiated SDP.
        let control_dc = pc
            .create_data_channel(
                CONTROL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| {
                tracing::debug!("Failed to create control channel: {}", e);
                FailureKind::Unreachable
            })?;
        self.control.install(control_dc).await;

        spawn_signal_loop(
            Arc::clone(&pc),
            Arc::clone(&signaling),
            self.abort.child_token(),
        );

        let offer = pc.create_offer(None).await.map_err(|e| {
            tracing::debug!("Failed to create offer: {}", e);
            FailureKind::Unreachable
        })?;
        pc.set_local_description(offer.clone()).await.map_err(|e| {
            tracing::debug!("Failed to set local description: {}", e);
            FailureKind::Unreachable
        })?;
        signaling
            .send(SignalMessage::Offer { sdp: offer.sdp })
            .await
            .map_err(|e| {
                tracing::debug!("Failed to send offer: {}", e);
                FailureKind::Unreachable
            })?;

        // Wait for the transport outcome
        let mut rx = self.state.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            match current {
                SessionState::Connected => return Ok(()),
                SessionState::Failed(kind) => return Err(kind),
                SessionState::Closed => return Err(FailureKind::Disconnected),
                SessionState::Connecting => {}
            }
            if rx.changed().await.is_err() {
                return Err(FailureKind::Disconnected);
            }
        }
    }
}

#[async_trait]
impl Session for WebRtcSession {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn state(&self) -> SessionState {
        self.state.get()
    }

    fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    async fn connect(&self) -> Result<(), SessionError> {
        self.config
            .validate()
            .map_err(|e| SessionError::InvalidParameters(e.to_string()))?;
        let url = self
            .config
            .signaling_url
            .clone()
            .ok_or_else(|| SessionError::InvalidParameters("signaling_url is required".into()))?;
        Url::parse(&url)
            .map_err(|e| SessionError::InvalidParameters(format!("invalid signaling url: {}", e)))?;

        match tokio::time::timeout(self.config.retry.connect_timeout, self.handshake(&url)).await
        {
            Err(_) => {
                tracing::warn!("WebRTC negotiation with {} timed out", url);
                self.state.set(SessionState::Failed(FailureKind::TimedOut));
                self.teardown().await;
            }
            Ok(Err(kind)) => {
                self.state.set(SessionState::Failed(kind));
                self.teardown().await;
            }
            Ok(Ok(())) => {
                tracing::info!("Connected to {} over {}", self.config.address, self.kind);
            }
        }
        Ok(())
    }

    async fn open_channel(&self, spec: ChannelSpec) -> Result<Box<dyn Channel>, SessionError> {
        if self.state.get() != SessionState::Connected {
            return Err(SessionError::NotConnected);
        }
        let pc = self
            .pc
            .lock()
            .await
            .clone()
            .ok_or(SessionError::NotConnected)?;

        let id = ChannelId::new(self.next_channel.fetch_add(1, Ordering::SeqCst));
        let label = format!("wicket-pane-{}", id.as_u32());
        let dc = pc
            .create_data_channel(
                &label,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| SessionError::ChannelOpen(e.to_string()))?;

        let core = Arc::new(ChannelCore::new(id));

        let (open_tx, open_rx) = oneshot::channel();
        let open_tx = std::sync::Mutex::new(Some(open_tx));
        let core_open = Arc::clone(&core);
        dc.on_open(Box::new(move || {
            core_open.mark_open();
            let tx = open_tx.lock().expect("open latch poisoned").take();
            Box::pin(async move {
                if let Some(tx) = tx {
                    let _ = tx.send(());
                }
            })
        }));

        let core_msg = Arc::clone(&core);
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            core_msg.emit_data(msg.data.clone());
            Box::pin(async move {})
        }));

        let core_close = Arc::clone(&core);
        dc.on_close(Box::new(move || {
            core_close.emit_closed();
            Box::pin(async move {})
        }));

        // Ask the peer to spawn the shell behind this channel
        self.control
            .request(&ControlRequest::Open {
                channel: &label,
                command: &spec.command,
                columns: spec.size.columns,
                rows: spec.size.rows,
                parent: spec.parent.map(|p| p.as_u32()),
            })
            .await
            .map_err(|e| match e {
                SessionError::Transport(m) => SessionError::ChannelOpen(m),
                other => other,
            })?;

        match tokio::time::timeout(CHANNEL_OPEN_TIMEOUT, open_rx).await {
            Ok(Ok(())) => {}
            _ => {
                let _ = dc.close().await;
                core.emit_closed();
                return Err(SessionError::ChannelOpen(
                    "data channel did not open".to_string(),
                ));
            }
        }

        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Bytes>();
        let dc_writer = Arc::clone(&dc);
        let core_writer = Arc::clone(&core);
        tokio::spawn(async move {
            while let Some(data) = write_rx.recv().await {
                if let Err(e) = dc_writer.send(&data).await {
                    tracing::debug!("Write to {} failed: {}", core_writer.id(), e);
                    core_writer.emit_closed();
                    break;
                }
            }
        });

        tracing::debug!("Opened {} running {:?}", core.id(), spec.command);
        Ok(Box::new(WebRtcChannel {
            core,
            dc,
            label,
            control: Arc::clone(&self.control),
            write_tx,
        }))
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.state.set(SessionState::Closed);
        self.teardown().await;
        self.abort.cancel();
        Ok(())
    }

    fn disconnect(&self) {
        self.state.set(SessionState::Closed);
        self.abort.cancel();
    }

    async fn fetch_layout(&self) -> Result<Option<LayoutSnapshot>, SessionError> {
        if self.state.get() != SessionState::Connected {
            return Err(SessionError::NotConnected);
        }
        let (tx, rx) = oneshot::channel();
        self.control.begin_layout_request(tx).await;
        self.control.request(&ControlRequest::LayoutGet).await?;

        match tokio::time::timeout(LAYOUT_TIMEOUT, rx).await {
            Ok(Ok(layout)) => Ok(layout),
            _ => {
                self.control.pending_layout.lock().await.take();
                Err(SessionError::Transport("layout fetch timed out".to_string()))
            }
        }
    }

    async fn store_layout(&self, snapshot: &LayoutSnapshot) -> Result<(), SessionError> {
        if self.state.get() != SessionState::Connected {
            return Err(SessionError::NotConnected);
        }
        self.control
            .request(&ControlRequest::LayoutPut { layout: snapshot })
            .await
    }
}

/// Channel handle backed by a WebRTC data channel
struct WebRtcChannel {
    core: Arc<ChannelCore>,
    dc: Arc<RTCDataChannel>,
    label: String,
    control: Arc<ControlChannel>,
    write_tx: mpsc::UnboundedSender<Bytes>,
}

#[async_trait]
impl Channel for WebRtcChannel {
    fn id(&self) -> ChannelId {
        self.core.id()
    }

    fn ready_state(&self) -> ReadyState {
        self.core.ready_state()
    }

    fn send(&self, data: &[u8]) {
        if !self.core.is_open() {
            tracing::debug!("Dropping write to {} ({})", self.core.id(), self.ready_state());
            return;
        }
        if self.write_tx.send(Bytes::copy_from_slice(data)).is_err() {
            self.core.emit_closed();
        }
    }

    async fn resize(&self, size: TermSize) -> Result<(), ChannelError> {
        if self.ready_state() == ReadyState::Closed {
            return Err(ChannelError::Closed);
        }
        // No remote ack concept; resolved once the request is on the wire.
        self.control
            .request(&ControlRequest::Resize {
                channel: &self.label,
                columns: size.columns,
                rows: size.rows,
            })
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.core.mark_closing();
        let _ = self.dc.close().await;
        self.core.emit_closed();
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.core.take_events()
    }
}

/// Apply peer signals (answer, remote ICE candidates) until the signaling
/// path closes or the session is torn down
fn spawn_signal_loop(
    pc: Arc<RTCPeerConnection>,
    signaling: Arc<dyn Signaling>,
    abort: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                _ = abort.cancelled() => break,
                m = signaling.recv() => match m {
                    Some(m) => m,
                    None => break,
                },
            };
            match message {
                SignalMessage::Answer { sdp } => match RTCSessionDescription::answer(sdp) {
                    Ok(answer) => {
                        if let Err(e) = pc.set_remote_description(answer).await {
                            tracing::debug!("Failed to apply answer: {}", e);
                        }
                    }
                    Err(e) => tracing::debug!("Malformed answer: {}", e),
                },
                SignalMessage::IceCandidate {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                } => {
                    let init = RTCIceCandidateInit {
                        candidate,
                        sdp_mid,
                        sdp_mline_index: sdp_mline_index.map(|i| i as u16),
                        username_fragment: None,
                    };
                    if let Err(e) = pc.add_ice_candidate(init).await {
                        tracing::debug!("Failed to add ICE candidate: {}", e);
                    }
                }
                SignalMessage::Offer { .. } => {
                    tracing::debug!("Ignoring unexpected offer; this side negotiates");
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn webrtc_config() -> GateConfig {
        GateConfig {
            address: "devbox".to_string(),
            transport: TransportKind::WebRtc,
            signaling_url: Some("wss://gate.example.net/signal".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_connect_rejects_missing_signaling_url() {
        let mut config = webrtc_config();
        config.signaling_url = None;
        let session = WebRtcSession::new(config, TransportKind::WebRtc);

        let result = session.connect().await;
        assert!(matches!(result, Err(SessionError::InvalidParameters(_))));
        assert_eq!(session.state(), SessionState::Connecting);
    }

    #[tokio::test]
    async fn test_open_channel_requires_connected() {
        let session = WebRtcSession::new(webrtc_config(), TransportKind::Hybrid);
        let result = session
            .open_channel(ChannelSpec::new("bash", TermSize::default()))
            .await;
        assert!(matches!(result, Err(SessionError::NotConnected)));
    }

    #[test]
    fn test_control_request_wire_shape() {
        let open = serde_json::to_value(ControlRequest::Open {
            channel: "wicket-pane-2",
            command: "bash",
            columns: 80,
            rows: 24,
            parent: None,
        })
        .unwrap();
        assert_eq!(open["op"], "open");
        assert_eq!(open["channel"], "wicket-pane-2");
        assert!(open.get("parent").is_none());

        let get = serde_json::to_value(ControlRequest::LayoutGet).unwrap();
        assert_eq!(get["op"], "layout_get");
    }

    #[test]
    fn test_control_event_parses_layout_response() {
        let event: ControlEvent = serde_json::from_str(
            "{\"op\":\"layout\",\"layout\":{\"windows\":[{\"panes\":[]}]}}",
        )
        .unwrap();
        let ControlEvent::Layout { layout } = event;
        assert_eq!(layout.unwrap().windows.len(), 1);
    }
}
