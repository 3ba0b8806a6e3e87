//! Gate reconnection integration tests
//!
//! Drives the gate state machine against a scriptable mock transport:
//! each created session takes the next outcome from the factory's script
//! (succeed, fail with a kind, or hang in the handshake).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use wicket_core::config::{AuthConfig, BackoffConfig, GateConfig, RetryConfig};
use wicket_core::error::{ChannelError, FailureKind, GateError, SessionError};
use wicket_core::layout::{LayoutSnapshot, PaneLayout, ScrollMarker, WindowLayout};
use wicket_core::state::{SessionState, StateCell};
use wicket_core::traits::{Channel, ChannelEvent, ChannelSpec, Session, SessionFactory};
use wicket_core::types::{ChannelId, GatePhase, ReadyState, TermSize, TransportKind};
use wicket_gate::{Gate, Notifier};

/// Scripted outcome for one created session
#[derive(Debug, Clone, Copy)]
enum Outcome {
    /// Handshake succeeds
    Succeed,
    /// Handshake fails with the given kind
    Fail(FailureKind),
    /// Handshake never resolves; the gate's connect timeout decides
    Hang,
}

struct MockChannel {
    id: ChannelId,
    open: AtomicBool,
    size: Mutex<TermSize>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

impl MockChannel {
    fn new(id: ChannelId) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            id,
            open: AtomicBool::new(true),
            size: Mutex::new(TermSize::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn ready_state(&self) -> ReadyState {
        if self.open.load(Ordering::SeqCst) {
            ReadyState::Open
        } else {
            ReadyState::Closed
        }
    }

    fn send(&self, _data: &[u8]) {}

    async fn resize(&self, size: TermSize) -> Result<(), ChannelError> {
        *self.size.lock().unwrap() = size;
        Ok(())
    }

    async fn close(&self) -> Result<(), ChannelError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.events_tx.send(ChannelEvent::Closed);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events_rx.lock().unwrap().take()
    }
}

struct MockSession {
    outcome: Outcome,
    state: Arc<StateCell>,
    opened: AtomicU32,
    next_channel: AtomicU32,
    remote_layout: Arc<Mutex<Option<LayoutSnapshot>>>,
}

impl MockSession {
    fn new(outcome: Outcome, remote_layout: Arc<Mutex<Option<LayoutSnapshot>>>) -> Self {
        Self {
            outcome,
            state: Arc::new(StateCell::new()),
            opened: AtomicU32::new(0),
            next_channel: AtomicU32::new(1),
            remote_layout,
        }
    }

    /// Simulate a transport drop while connected
    fn force_failure(&self, kind: FailureKind) {
        self.state.set(SessionState::Failed(kind));
    }

    fn opened_channels(&self) -> u32 {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Session for MockSession {
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
        match self.outcome {
            Outcome::Succeed => {
                self.state.set(SessionState::Connected);
            }
            Outcome::Fail(kind) => {
                self.state.set(SessionState::Failed(kind));
            }
            Outcome::Hang => {}
        }
        Ok(())
    }

    async fn open_channel(&self, _spec: ChannelSpec) -> Result<Box<dyn Channel>, SessionError> {
        if self.state.get() != SessionState::Connected {
            return Err(SessionError::NotConnected);
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        let id = ChannelId::new(self.next_channel.fetch_add(1, Ordering::SeqCst));
        Ok(Box::new(MockChannel::new(id)))
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.state.set(SessionState::Closed);
        Ok(())
    }

    fn disconnect(&self) {
        self.state.set(SessionState::Closed);
    }

    async fn fetch_layout(&self) -> Result<Option<LayoutSnapshot>, SessionError> {
        Ok(self.remote_layout.lock().unwrap().clone())
    }

    async fn store_layout(&self, snapshot: &LayoutSnapshot) -> Result<(), SessionError> {
        *self.remote_layout.lock().unwrap() = Some(snapshot.clone());
        Ok(())
    }
}

struct MockFactory {
    script: Mutex<VecDeque<Outcome>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    remote_layout: Arc<Mutex<Option<LayoutSnapshot>>>,
}

impl MockFactory {
    fn with_script(outcomes: impl IntoIterator<Item = Outcome>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(outcomes.into_iter().collect()),
            sessions: Mutex::new(Vec::new()),
            remote_layout: Arc::new(Mutex::new(None)),
        })
    }

    fn session(&self, index: usize) -> Arc<MockSession> {
        Arc::clone(&self.sessions.lock().unwrap()[index])
    }

    fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[async_trait]
impl SessionFactory for MockFactory {
    async fn create(&self) -> Result<Arc<dyn Session>, SessionError> {
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Succeed);
        let session = Arc::new(MockSession::new(
            outcome,
            Arc::clone(&self.remote_layout),
        ));
        self.sessions.lock().unwrap().push(Arc::clone(&session));
        Ok(session)
    }
}

fn collector() -> (Notifier, Arc<Mutex<Vec<String>>>) {
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let notifier: Notifier = Arc::new(move |message: String| {
        sink.lock().unwrap().push(message);
    });
    (notifier, log)
}

fn test_config() -> GateConfig {
    GateConfig {
        address: "devbox:22".to_string(),
        username: "sam".to_string(),
        auth: Some(AuthConfig::Password {
            password: "hunter2".to_string(),
        }),
        command: Some("bash".to_string()),
        retry: RetryConfig {
            max_retries: 3,
            connect_timeout: Duration::from_millis(300),
            backoff: BackoffConfig {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(40),
                multiplier: 2.0,
                jitter: 0.0,
            },
        },
        ..Default::default()
    }
}

fn two_pane_snapshot() -> LayoutSnapshot {
    LayoutSnapshot {
        windows: vec![WindowLayout {
            panes: vec![
                PaneLayout {
                    columns: 80,
                    rows: 24,
                    command: "bash".to_string(),
                    marker: Some(ScrollMarker::at(42)),
                },
                PaneLayout {
                    columns: 120,
                    rows: 40,
                    command: "htop".to_string(),
                    marker: None,
                },
            ],
        }],
    }
}

#[tokio::test]
async fn test_disengage_reconnect_layout_round_trip() {
    let factory = MockFactory::with_script([]);
    let (notifier, _log) = collector();
    let gate = Gate::new("devbox", test_config(), factory.clone(), notifier);

    gate.connect().await.unwrap();
    assert_eq!(gate.phase().await, GatePhase::Connected);
    assert_eq!(gate.pane_count().await, 1);

    let first = gate.active_pane().await.unwrap();
    let second = gate.split_pane(first).await.unwrap();
    gate.resize_pane(second, TermSize::new(100, 30)).await.unwrap();
    gate.set_marker(first, ScrollMarker::at(17)).await;
    let before = gate.payload().await;

    gate.disengage().await.unwrap();
    assert_eq!(gate.phase().await, GatePhase::Disengaged);
    // Panes survive disengage with their bindings cleared
    assert_eq!(gate.pane_count().await, 2);
    assert!(gate.pane_channel(first).await.is_none());

    gate.reconnect().await.unwrap();
    assert_eq!(gate.phase().await, GatePhase::Connected);

    let after = gate.payload().await;
    assert_eq!(after, before);
    assert_eq!(gate.pane_count().await, 2);

    // Every pane is rebound to an open channel of the new session
    for pane in gate.pane_ids().await {
        let channel = gate.pane_channel(pane).await.expect("pane unbound");
        assert_eq!(channel.ready_state(), ReadyState::Open);
    }
    // The marker survived for scroll continuity
    assert_eq!(gate.pane_marker(first).await, Some(ScrollMarker::at(17)));

    // Second session opened both channels; the first session's channels
    // are gone with it
    assert_eq!(factory.session_count(), 2);
    assert_eq!(factory.session(1).opened_channels(), 2);
}

#[tokio::test]
async fn test_disengage_stores_layout_on_peer() {
    let factory = MockFactory::with_script([]);
    let (notifier, _log) = collector();
    let gate = Gate::new("devbox", test_config(), factory.clone(), notifier);

    gate.connect().await.unwrap();
    let first = gate.active_pane().await.unwrap();
    gate.split_pane(first).await.unwrap();
    gate.disengage().await.unwrap();

    let stored = factory.remote_layout.lock().unwrap().clone().unwrap();
    assert_eq!(stored.pane_count(), 2);
}

#[tokio::test]
async fn test_reconnect_succeeds_on_second_retry() {
    let factory = MockFactory::with_script([]);
    let (notifier, log) = collector();
    let gate = Gate::new("devbox", test_config(), factory.clone(), notifier);

    gate.connect().await.unwrap();
    let first = gate.active_pane().await.unwrap();
    gate.split_pane(first).await.unwrap();
    gate.disengage().await.unwrap();

    // Next attempt fails once, then succeeds
    {
        let mut script = factory.script.lock().unwrap();
        script.push_back(Outcome::Fail(FailureKind::Unreachable));
        script.push_back(Outcome::Succeed);
    }

    gate.reconnect().await.unwrap();

    assert_eq!(gate.phase().await, GatePhase::Connected);
    assert_eq!(gate.retry_count(), 0);
    assert_eq!(gate.pane_count().await, 2);
    for pane in gate.pane_ids().await {
        let channel = gate.pane_channel(pane).await.expect("pane unbound");
        assert_eq!(channel.ready_state(), ReadyState::Open);
    }

    let log = log.lock().unwrap();
    assert!(log.iter().any(|m| m.contains("retrying")));
    assert!(log.iter().any(|m| m.contains("Connected to devbox")));
}

#[tokio::test]
async fn test_retries_exhausted_preserves_panes() {
    let factory = MockFactory::with_script([
        Outcome::Fail(FailureKind::Unreachable),
        Outcome::Fail(FailureKind::Unreachable),
        Outcome::Fail(FailureKind::Unreachable),
    ]);
    let (notifier, log) = collector();
    let gate = Gate::with_snapshot(
        "devbox",
        test_config(),
        factory.clone(),
        notifier,
        two_pane_snapshot(),
    );

    let result = gate.connect().await;
    assert!(matches!(
        result,
        Err(GateError::RetriesExhausted { attempts: 3 })
    ));
    assert_eq!(gate.phase().await, GatePhase::Disconnected);

    // The restored pane tree survives the failed connect for a manual
    // retry; nothing is bound
    assert_eq!(gate.pane_count().await, 2);
    for pane in gate.pane_ids().await {
        assert!(gate.pane_channel(pane).await.is_none());
    }

    let log = log.lock().unwrap();
    assert!(log.iter().any(|m| m.contains("Could not connect")));

    // A manual reconnect still works (script exhausted -> default succeed)
    gate.reconnect().await.unwrap();
    assert_eq!(gate.phase().await, GatePhase::Connected);
    assert_eq!(gate.pane_count().await, 2);
}

#[tokio::test]
async fn test_reconnect_race_binds_only_newest_attempt() {
    // First session hangs in its handshake; the user hits reconnect while
    // that attempt is still in flight.
    let factory = MockFactory::with_script([Outcome::Hang, Outcome::Succeed]);
    let (notifier, _log) = collector();
    let gate = Gate::new("devbox", test_config(), factory.clone(), notifier);

    let racing = {
        let gate = gate.clone();
        tokio::spawn(async move { gate.connect().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    gate.reconnect().await.unwrap();
    assert_eq!(gate.phase().await, GatePhase::Connected);

    // The stale attempt observes the supersession once its timeout fires
    let stale_result = timeout(Duration::from_secs(2), racing).await.unwrap().unwrap();
    assert!(matches!(stale_result, Err(GateError::Superseded)));

    // Only the second session's channels are bound, one per pane
    assert_eq!(factory.session_count(), 2);
    assert_eq!(factory.session(0).opened_channels(), 0);
    assert_eq!(factory.session(1).opened_channels(), 1);
    // The hung session was torn down, not left dangling
    assert_eq!(factory.session(0).state(), SessionState::Closed);

    let pane = gate.active_pane().await.unwrap();
    assert!(gate.pane_channel(pane).await.is_some());
}

#[tokio::test]
async fn test_mid_session_failure_reconnects_automatically() {
    let factory = MockFactory::with_script([]);
    let (notifier, log) = collector();
    let gate = Gate::new("devbox", test_config(), factory.clone(), notifier);

    gate.connect().await.unwrap();
    assert_eq!(factory.session_count(), 1);

    // Transport drops out from under the connected gate
    factory
        .session(0)
        .force_failure(FailureKind::Disconnected);

    // A fresh session replaces the failed one automatically
    timeout(Duration::from_secs(2), async {
        loop {
            if factory.session_count() >= 2 && gate.phase().await == GatePhase::Connected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("gate never reconnected");
    let pane = gate.active_pane().await.unwrap();
    assert!(gate.pane_channel(pane).await.is_some());

    let log = log.lock().unwrap();
    assert!(log.iter().any(|m| m.contains("lost")));
}

#[tokio::test]
async fn test_disengage_cancels_pending_retry() {
    let mut config = test_config();
    // Make the retry delay long enough that disengage lands inside it
    config.retry.backoff = BackoffConfig {
        initial: Duration::from_secs(30),
        max: Duration::from_secs(30),
        multiplier: 1.0,
        jitter: 0.0,
    };
    let factory = MockFactory::with_script([
        Outcome::Fail(FailureKind::Unreachable),
        Outcome::Succeed,
    ]);
    let (notifier, _log) = collector();
    let gate = Gate::new("devbox", config, factory.clone(), notifier);

    let connecting = {
        let gate = gate.clone();
        tokio::spawn(async move { gate.connect().await })
    };

    // Wait until the first attempt failed and the gate is backing off
    timeout(Duration::from_secs(2), async {
        loop {
            if factory.session_count() >= 1 && gate.retry_count() >= 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    gate.disengage().await.unwrap();
    assert_eq!(gate.phase().await, GatePhase::Disengaged);

    // The backoff sleep was canceled; the connect attempt bails out
    // promptly instead of waiting out the 30s delay
    let result = timeout(Duration::from_secs(2), connecting)
        .await
        .expect("retry timer was not canceled")
        .unwrap();
    assert!(matches!(result, Err(GateError::Superseded)));
}

#[tokio::test]
async fn test_pane_split_while_disconnected_binds_lazily() {
    let factory = MockFactory::with_script([]);
    let (notifier, _log) = collector();
    let gate = Gate::new("devbox", test_config(), factory.clone(), notifier);

    gate.connect().await.unwrap();
    let first = gate.active_pane().await.unwrap();
    gate.disengage().await.unwrap();

    // Structural change while disengaged
    let second = gate.split_pane(first).await.unwrap();
    assert_eq!(gate.pane_count().await, 2);
    assert!(gate.pane_channel(second).await.is_none());

    gate.reconnect().await.unwrap();
    let channel = gate.pane_channel(second).await.expect("lazy bind failed");
    assert_eq!(channel.ready_state(), ReadyState::Open);
}

#[tokio::test]
async fn test_destroyed_gate_rejects_connect() {
    let factory = MockFactory::with_script([]);
    let (notifier, _log) = collector();
    let gate = Gate::new("devbox", test_config(), factory, notifier);

    gate.destroy();
    assert!(matches!(gate.connect().await, Err(GateError::Destroyed)));
}
