//! Signaling clients for the WebRTC transports
//!
//! The peer connection itself is identical for the direct and hybrid
//! variants; what differs is how the offer/answer/ICE exchange reaches the
//! remote peer. Direct WebRTC signals over a WebSocket, hybrid over a plain
//! HTTP exchange (POST to send, poll to receive).

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;
use uuid::Uuid;

use wicket_core::error::SessionError;

/// How often the hybrid client polls for queued signals
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Signals exchanged with the remote peer during negotiation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    IceCandidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u32>,
    },
}

/// A signaling path to the remote peer
#[async_trait]
pub trait Signaling: Send + Sync {
    /// Deliver a signal to the peer
    async fn send(&self, message: SignalMessage) -> Result<(), SessionError>;

    /// Next signal from the peer; `None` once the path is closed
    async fn recv(&self) -> Option<SignalMessage>;

    /// Tear the signaling path down
    async fn close(&self);
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket signaling client for the direct WebRTC variant
pub struct WsSignaling {
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
}

impl WsSignaling {
    /// Connect to the signaling endpoint
    pub async fn connect(url: &str) -> Result<Self, SessionError> {
        let url = Url::parse(url)
            .map_err(|e| SessionError::InvalidParameters(format!("invalid signaling url: {}", e)))?;

        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        tracing::debug!("Signaling websocket connected to {}", url);

        let (sink, stream) = ws.split();
        Ok(Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        })
    }
}

#[async_trait]
impl Signaling for WsSignaling {
    async fn send(&self, message: SignalMessage) -> Result<(), SessionError> {
        let json = serde_json::to_string(&message)?;
        self.sink
            .lock()
            .await
            .send(Message::Text(json))
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))
    }

    async fn recv(&self) -> Option<SignalMessage> {
        let mut stream = self.stream.lock().await;
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str(&text) {
                    Ok(message) => return Some(message),
                    Err(e) => {
                        tracing::debug!("Ignoring malformed signal: {}", e);
                    }
                },
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("Signaling websocket error: {}", e);
                    return None;
                }
            }
        }
        None
    }

    async fn close(&self) {
        let _ = self.sink.lock().await.close().await;
    }
}

/// HTTP signaling client for the hybrid variant.
///
/// The exchange happens against a session mailbox on the signaling server:
/// `POST {base}/signal/{session}` enqueues a signal for the peer and
/// `GET {base}/signal/{session}/poll` drains signals queued for us.
pub struct HttpSignaling {
    client: reqwest::Client,
    base: String,
    session_id: String,
    pending: Mutex<VecDeque<SignalMessage>>,
    closed: AtomicBool,
}

impl HttpSignaling {
    /// Create a client for a fresh signaling session
    pub fn new(base_url: &str) -> Result<Self, SessionError> {
        let url = Url::parse(base_url)
            .map_err(|e| SessionError::InvalidParameters(format!("invalid signaling url: {}", e)))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base: url.to_string().trim_end_matches('/').to_string(),
            session_id: Uuid::new_v4().to_string(),
            pending: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn mailbox_url(&self) -> String {
        format!("{}/signal/{}", self.base, self.session_id)
    }
}

#[async_trait]
impl Signaling for HttpSignaling {
    async fn send(&self, message: SignalMessage) -> Result<(), SessionError> {
        self.client
            .post(self.mailbox_url())
            .json(&message)
            .send()
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?
            .error_for_status()
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn recv(&self) -> Option<SignalMessage> {
        if let Some(message) = self.pending.lock().await.pop_front() {
            return Some(message);
        }

        let url = format!("{}/poll", self.mailbox_url());
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }

            let response = match self.client.get(&url).send().await {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!("Signaling poll failed: {}", e);
                    return None;
                }
            };
            if !response.status().is_success() {
                tracing::debug!("Signaling poll returned {}", response.status());
                return None;
            }

            match response.json::<Vec<SignalMessage>>().await {
                Ok(mut batch) if !batch.is_empty() => {
                    let first = batch.remove(0);
                    self.pending.lock().await.extend(batch);
                    return Some(first);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("Malformed signaling batch: {}", e);
                    return None;
                }
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.client.delete(self.mailbox_url()).send().await;
    }
}
