//! SSH session implementation
//!
//! Wraps a russh client connection. Each pane channel is an SSH session
//! channel with a pty; inbound channel traffic is routed from the client
//! handler to the owning [`ChannelCore`] by a per-session router task. The
//! router doubles as the liveness monitor: when the connection dies, the
//! handler's event sender drops and the router invalidates every channel
//! and publishes the failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, Msg};
use russh::{ChannelId as SshId, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;

use wicket_core::config::{AuthConfig, GateConfig};
use wicket_core::error::{ChannelError, FailureKind, SessionError};
use wicket_core::layout::LayoutSnapshot;
use wicket_core::state::{SessionState, StateCell};
use wicket_core::traits::{Channel, ChannelEvent, ChannelSpec, Session};
use wicket_core::types::{ChannelId, ReadyState, TermSize, TransportKind};

use crate::channel::ChannelCore;

/// Remote location of the out-of-band layout payload
const LAYOUT_PATH: &str = "\"$HOME/.wicket/layout.json\"";

/// Bound on the layout fetch/store exec channels
const LAYOUT_TIMEOUT: Duration = Duration::from_secs(10);

/// Events routed from the SSH client handler to the session router
enum RouteEvent {
    Data { id: SshId, data: Bytes },
    Eof { id: SshId },
    Closed { id: SshId },
}

/// Live connection state held once the handshake succeeds
struct SshInner {
    handle: client::Handle<ClientHandler>,
    register_tx: mpsc::UnboundedSender<(SshId, Arc<ChannelCore>)>,
}

/// SSH-backed session
pub struct SshSession {
    config: GateConfig,
    state: Arc<StateCell>,
    inner: Arc<Mutex<Option<SshInner>>>,
    next_channel: AtomicU32,
    abort: CancellationToken,
}

enum AuthMaterial {
    Key(Arc<KeyPair>),
    Password(String),
}

impl SshSession {
    /// Create an unconnected session for the given gate
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            state: Arc::new(StateCell::new()),
            inner: Arc::new(Mutex::new(None)),
            next_channel: AtomicU32::new(1),
            abort: CancellationToken::new(),
        }
    }

    /// Load authentication material, reporting unusable configuration
    /// synchronously
    fn load_auth(&self) -> Result<AuthMaterial, SessionError> {
        match &self.config.auth {
            Some(AuthConfig::Key { path }) => {
                if !path.exists() {
                    return Err(SessionError::InvalidParameters(format!(
                        "private key not found at {}",
                        path.display()
                    )));
                }
                let key = russh_keys::load_secret_key(path, None).map_err(|e| {
                    SessionError::InvalidParameters(format!("failed to load key: {}", e))
                })?;
                Ok(AuthMaterial::Key(Arc::new(key)))
            }
            Some(AuthConfig::Password { password }) => {
                Ok(AuthMaterial::Password(password.clone()))
            }
            None => Err(SessionError::InvalidParameters(
                "ssh transport requires auth configuration".to_string(),
            )),
        }
    }

    /// Run the SSH handshake: connect, verify, authenticate, start the
    /// router. Transport failures come back as normalized kinds.
    async fn handshake(&self, auth: AuthMaterial) -> Result<SshInner, FailureKind> {
        let ssh_config = Arc::new(client::Config::default());
        let (route_tx, route_rx) = mpsc::unbounded_channel();
        let handler = ClientHandler {
            expected_host_key: self.config.host_key.clone(),
            route_tx,
        };

        let address = self.config.ssh_address();
        tracing::debug!("Connecting to {}", address);
        let mut handle = client::connect(ssh_config, address.as_str(), handler)
            .await
            .map_err(|e| {
                tracing::debug!("SSH connect failed: {}", e);
                FailureKind::Unreachable
            })?;

        tracing::debug!("Authenticating as user '{}'", self.config.username);
        let authenticated = match auth {
            AuthMaterial::Key(key) => handle
                .authenticate_publickey(&self.config.username, key)
                .await
                .map_err(|e| {
                    tracing::debug!("SSH auth error: {}", e);
                    FailureKind::Unreachable
                })?,
            AuthMaterial::Password(password) => handle
                .authenticate_password(&self.config.username, &password)
                .await
                .map_err(|e| {
                    tracing::debug!("SSH auth error: {}", e);
                    FailureKind::Unreachable
                })?,
        };
        if !authenticated {
            return Err(FailureKind::Unauthorized);
        }

        let (register_tx, register_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_router(route_rx, register_rx, Arc::clone(&self.state)));

        Ok(SshInner {
            handle,
            register_tx,
        })
    }

    /// Open a raw session channel registered with the router
    async fn open_raw(
        &self,
    ) -> Result<(russh::Channel<Msg>, Arc<ChannelCore>), SessionError> {
        if self.state.get() != SessionState::Connected {
            return Err(SessionError::NotConnected);
        }
        let mut guard = self.inner.lock().await;
        let inner = guard.as_mut().ok_or(SessionError::NotConnected)?;

        let channel = inner
            .handle
            .channel_open_session()
            .await
            .map_err(|e| SessionError::ChannelOpen(e.to_string()))?;

        let id = ChannelId::new(self.next_channel.fetch_add(1, Ordering::SeqCst));
        let core = Arc::new(ChannelCore::new(id));
        inner
            .register_tx
            .send((channel.id(), Arc::clone(&core)))
            .map_err(|_| SessionError::ChannelOpen("session router is gone".to_string()))?;

        Ok((channel, core))
    }
}

#[async_trait]
impl Session for SshSession {
    fn kind(&self) -> TransportKind {
        TransportKind::Ssh
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
        let auth = self.load_auth()?;

        match tokio::time::timeout(self.config.retry.connect_timeout, self.handshake(auth)).await
        {
            Err(_) => {
                tracing::warn!("SSH handshake to {} timed out", self.config.address);
                self.state.set(SessionState::Failed(FailureKind::TimedOut));
            }
            Ok(Err(kind)) => {
                self.state.set(SessionState::Failed(kind));
            }
            Ok(Ok(inner)) => {
                *self.inner.lock().await = Some(inner);

                // Abrupt disconnects drop the handle without a goodbye.
                let slot = Arc::clone(&self.inner);
                let abort = self.abort.clone();
                tokio::spawn(async move {
                    abort.cancelled().await;
                    slot.lock().await.take();
                });

                tracing::info!("Connected to {} over ssh", self.config.address);
                self.state.set(SessionState::Connected);
            }
        }
        Ok(())
    }

    async fn open_channel(&self, spec: ChannelSpec) -> Result<Box<dyn Channel>, SessionError> {
        let (channel, core) = self.open_raw().await?;
        let size = spec.size;

        channel
            .request_pty(
                false,
                "xterm-256color",
                size.columns as u32,
                size.rows as u32,
                0,
                0,
                &[],
            )
            .await
            .map_err(|e| SessionError::ChannelOpen(e.to_string()))?;

        if spec.command.is_empty() {
            channel
                .request_shell(false)
                .await
                .map_err(|e| SessionError::ChannelOpen(e.to_string()))?;
        } else {
            channel
                .exec(false, spec.command.as_str())
                .await
                .map_err(|e| SessionError::ChannelOpen(e.to_string()))?;
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_channel_io(channel, cmd_rx, Arc::clone(&core)));
        core.mark_open();

        tracing::debug!("Opened {} running {:?}", core.id(), spec.command);
        Ok(Box::new(SshChannel { core, cmd_tx }))
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.state.set(SessionState::Closed);
        let inner = self.inner.lock().await.take();
        if let Some(inner) = inner {
            let _ = inner
                .handle
                .disconnect(Disconnect::ByApplication, "closing", "en")
                .await;
        }
        Ok(())
    }

    fn disconnect(&self) {
        self.state.set(SessionState::Closed);
        self.abort.cancel();
    }

    async fn fetch_layout(&self) -> Result<Option<LayoutSnapshot>, SessionError> {
        let (channel, core) = self.open_raw().await?;
        channel
            .exec(false, format!("cat {} 2>/dev/null || true", LAYOUT_PATH))
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        let mut events = core
            .take_events()
            .expect("layout channel events already taken");

        let mut buf = Vec::new();
        let collected = tokio::time::timeout(LAYOUT_TIMEOUT, async {
            while let Some(event) = events.recv().await {
                match event {
                    ChannelEvent::Data(data) => buf.extend_from_slice(&data),
                    ChannelEvent::Closed => break,
                }
            }
        })
        .await;
        let _ = channel.close().await;
        if collected.is_err() {
            return Err(SessionError::Transport(
                "layout fetch timed out".to_string(),
            ));
        }

        let text = String::from_utf8_lossy(&buf);
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        LayoutSnapshot::from_json(text).map(Some)
    }

    async fn store_layout(&self, snapshot: &LayoutSnapshot) -> Result<(), SessionError> {
        let json = snapshot.to_json()?;
        let (channel, _core) = self.open_raw().await?;

        channel
            .exec(
                false,
                format!("mkdir -p \"$HOME/.wicket\" && cat > {}", LAYOUT_PATH),
            )
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        channel
            .data(json.as_bytes())
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        let _ = channel.eof().await;
        let _ = channel.close().await;
        Ok(())
    }
}

/// Channel handle backed by an SSH session channel
struct SshChannel {
    core: Arc<ChannelCore>,
    cmd_tx: mpsc::UnboundedSender<ChannelCmd>,
}

enum ChannelCmd {
    Write(Bytes),
    Resize(TermSize, oneshot::Sender<Result<(), ChannelError>>),
    Close(oneshot::Sender<()>),
}

#[async_trait]
impl Channel for SshChannel {
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
        if self
            .cmd_tx
            .send(ChannelCmd::Write(Bytes::copy_from_slice(data)))
            .is_err()
        {
            self.core.emit_closed();
        }
    }

    async fn resize(&self, size: TermSize) -> Result<(), ChannelError> {
        if self.ready_state() == ReadyState::Closed {
            return Err(ChannelError::Closed);
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(ChannelCmd::Resize(size, done_tx))
            .map_err(|_| ChannelError::Closed)?;
        done_rx.await.map_err(|_| ChannelError::Closed)?
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.core.mark_closing();
        let (done_tx, done_rx) = oneshot::channel();
        if self.cmd_tx.send(ChannelCmd::Close(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
        self.core.emit_closed();
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.core.take_events()
    }
}

/// Serialize writes, resizes, and the graceful close onto the owned russh
/// channel
async fn run_channel_io(
    channel: russh::Channel<Msg>,
    mut cmd_rx: mpsc::UnboundedReceiver<ChannelCmd>,
    core: Arc<ChannelCore>,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            ChannelCmd::Write(data) => {
                if let Err(e) = channel.data(&data[..]).await {
                    tracing::debug!("Write to {} failed: {}", core.id(), e);
                    core.emit_closed();
                    break;
                }
            }
            ChannelCmd::Resize(size, done) => {
                let result = channel
                    .window_change(size.columns as u32, size.rows as u32, 0, 0)
                    .await
                    .map_err(|e| ChannelError::Transport(e.to_string()));
                let _ = done.send(result);
            }
            ChannelCmd::Close(done) => {
                let _ = channel.eof().await;
                let _ = channel.close().await;
                let _ = done.send(());
                break;
            }
        }
    }
}

/// Route inbound channel traffic and watch connection liveness.
///
/// Terminates when the client handler drops (connection dead) or the
/// session itself is dropped; either way every still-registered channel is
/// invalidated.
async fn run_router(
    mut route_rx: mpsc::UnboundedReceiver<RouteEvent>,
    mut register_rx: mpsc::UnboundedReceiver<(SshId, Arc<ChannelCore>)>,
    state: Arc<StateCell>,
) {
    let mut peers: HashMap<SshId, Arc<ChannelCore>> = HashMap::new();
    loop {
        tokio::select! {
            event = route_rx.recv() => match event {
                Some(RouteEvent::Data { id, data }) => {
                    if let Some(core) = peers.get(&id) {
                        core.emit_data(data);
                    }
                }
                Some(RouteEvent::Eof { id }) => {
                    tracing::trace!("EOF on ssh channel {:?}", id);
                }
                Some(RouteEvent::Closed { id }) => {
                    if let Some(core) = peers.remove(&id) {
                        core.emit_closed();
                    }
                }
                None => break,
            },
            registration = register_rx.recv() => match registration {
                Some((id, core)) => {
                    peers.insert(id, core);
                }
                None => break,
            },
        }
    }

    // Refused when the session was closed deliberately.
    if state.set(SessionState::Failed(FailureKind::Disconnected)) {
        tracing::warn!("SSH connection lost");
    }
    for (_, core) in peers {
        core.emit_closed();
    }
}

/// SSH client handler: verifies the host key and forwards channel events
/// to the router
struct ClientHandler {
    expected_host_key: Option<String>,
    route_tx: mpsc::UnboundedSender<RouteEvent>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        tracing::debug!("Server host key: {}", fingerprint);

        if let Some(expected) = &self.expected_host_key {
            if fingerprint != *expected {
                tracing::warn!(
                    "Host key differs from configured: expected {}, got {}",
                    expected,
                    fingerprint
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn data(
        &mut self,
        channel: SshId,
        data: &[u8],
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let _ = self.route_tx.send(RouteEvent::Data {
            id: channel,
            data: Bytes::copy_from_slice(data),
        });
        Ok(())
    }

    async fn extended_data(
        &mut self,
        channel: SshId,
        _ext: u32,
        data: &[u8],
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let _ = self.route_tx.send(RouteEvent::Data {
            id: channel,
            data: Bytes::copy_from_slice(data),
        });
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: SshId,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let _ = self.route_tx.send(RouteEvent::Eof { id: channel });
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: SshId,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let _ = self.route_tx.send(RouteEvent::Closed { id: channel });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ssh_config() -> GateConfig {
        GateConfig {
            address: "devbox:22".to_string(),
            username: "sam".to_string(),
            auth: Some(AuthConfig::Password {
                password: "hunter2".to_string(),
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_connect_rejects_missing_auth() {
        let mut config = ssh_config();
        config.auth = None;
        let session = SshSession::new(config);

        let result = session.connect().await;
        assert!(matches!(result, Err(SessionError::InvalidParameters(_))));
        // A config error is synchronous; the state machine never ran
        assert_eq!(session.state(), SessionState::Connecting);
    }

    #[tokio::test]
    async fn test_open_channel_requires_connected() {
        let session = SshSession::new(ssh_config());
        let result = session
            .open_channel(ChannelSpec::new("bash", TermSize::default()))
            .await;
        assert!(matches!(result, Err(SessionError::NotConnected)));
    }

    #[tokio::test]
    async fn test_router_publishes_connection_loss() {
        let state = Arc::new(StateCell::new());
        state.set(SessionState::Connected);

        let (route_tx, route_rx) = mpsc::unbounded_channel::<RouteEvent>();
        let (register_tx, register_rx) = mpsc::unbounded_channel();
        let router = tokio::spawn(run_router(route_rx, register_rx, Arc::clone(&state)));

        // Handler gone: the connection died underneath us
        drop(route_tx);
        drop(register_tx);
        router.await.unwrap();

        assert_eq!(
            state.get(),
            SessionState::Failed(FailureKind::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_router_respects_deliberate_close() {
        let state = Arc::new(StateCell::new());
        state.set(SessionState::Connected);
        state.set(SessionState::Closed);

        let (route_tx, route_rx) = mpsc::unbounded_channel::<RouteEvent>();
        let (_register_tx, register_rx) = mpsc::unbounded_channel();
        let router = tokio::spawn(run_router(route_rx, register_rx, Arc::clone(&state)));

        drop(route_tx);
        router.await.unwrap();

        // Closed is terminal; the router must not repaint it as a failure
        assert_eq!(state.get(), SessionState::Closed);
    }
}
