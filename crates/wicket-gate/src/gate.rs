//! The gate reconnection state machine
//!
//! A gate owns one session at a time, by replacement: a session whose state
//! goes terminal is discarded and a fresh instance is created for the next
//! attempt. Every attempt is tagged with a generation; anything arriving
//! from a superseded generation (late state callbacks, channels opened by a
//! stale attempt) is ignored or torn down. This is what keeps two attempts
//! racing through reconnect from ever binding the same pane twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use wicket_core::config::GateConfig;
use wicket_core::error::{FailureKind, GateError};
use wicket_core::layout::{LayoutSnapshot, ScrollMarker};
use wicket_core::state::SessionState;
use wicket_core::traits::{Channel, ChannelEvent, ChannelSpec, Session, SessionFactory};
use wicket_core::types::{GatePhase, Generation, PaneId, TermSize};

use crate::backoff::ExponentialBackoff;
use crate::timers::TimerRegistry;
use crate::tree::PaneTree;

/// User-visible notification sink: one callback, message strings only
pub type Notifier = Arc<dyn Fn(String) + Send + Sync>;

/// Mutable gate state guarded by one lock
struct GateState {
    phase: GatePhase,
    session: Option<Arc<dyn Session>>,
    session_generation: Generation,
    tree: PaneTree,
    snapshot: Option<LayoutSnapshot>,
    /// Live channel handles for the current session only; cleared
    /// wholesale whenever the session is replaced
    channels: HashMap<PaneId, Arc<dyn Channel>>,
}

struct GateInner {
    name: String,
    config: GateConfig,
    factory: Arc<dyn SessionFactory>,
    notifier: Notifier,
    state: Mutex<GateState>,
    /// Generation of the newest attempt; older attempts observe the
    /// mismatch and bail
    generation: AtomicU64,
    /// Attempt counter of the connect in progress; 0 once connected
    retries: AtomicU32,
    destroyed: AtomicBool,
    timers: TimerRegistry,
    /// Cancellation for the attempt in flight. Created when the attempt
    /// begins, so a later disengage/reconnect always cancels the right one.
    attempt_abort: std::sync::Mutex<CancellationToken>,
}

/// Internal attempt outcome
enum AttemptError {
    /// Non-retryable: configuration problems
    Fatal(GateError),
    /// Retryable transport failure
    Failed(FailureKind),
    /// A newer attempt superseded this one
    Superseded,
    /// The gate was destroyed mid-attempt
    Destroyed,
}

/// One remote host as the user sees it: the window/pane tree plus the
/// current session and its reconnection policy. Cheap to clone; clones
/// share the same gate.
#[derive(Clone)]
pub struct Gate {
    inner: Arc<GateInner>,
}

impl Gate {
    /// Create a gate with an empty layout
    pub fn new(
        name: impl Into<String>,
        config: GateConfig,
        factory: Arc<dyn SessionFactory>,
        notifier: Notifier,
    ) -> Self {
        Self::build(name.into(), config, factory, notifier, None)
    }

    /// Create a gate seeded with a persisted layout snapshot; the tree is
    /// reconstructed from it on the first connect
    pub fn with_snapshot(
        name: impl Into<String>,
        config: GateConfig,
        factory: Arc<dyn SessionFactory>,
        notifier: Notifier,
        snapshot: LayoutSnapshot,
    ) -> Self {
        Self::build(name.into(), config, factory, notifier, Some(snapshot))
    }

    fn build(
        name: String,
        config: GateConfig,
        factory: Arc<dyn SessionFactory>,
        notifier: Notifier,
        snapshot: Option<LayoutSnapshot>,
    ) -> Self {
        Self {
            inner: Arc::new(GateInner {
                name,
                config,
                factory,
                notifier,
                state: Mutex::new(GateState {
                    phase: GatePhase::Disconnected,
                    session: None,
                    session_generation: Generation::ZERO,
                    tree: PaneTree::new(),
                    snapshot,
                    channels: HashMap::new(),
                }),
                generation: AtomicU64::new(0),
                retries: AtomicU32::new(0),
                destroyed: AtomicBool::new(false),
                timers: TimerRegistry::new(),
                attempt_abort: std::sync::Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Gate name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current lifecycle phase
    pub async fn phase(&self) -> GatePhase {
        self.inner.state.lock().await.phase
    }

    /// Attempt counter of the connect in progress; 0 once connected
    pub fn retry_count(&self) -> u32 {
        self.inner.retries.load(Ordering::SeqCst)
    }

    /// Generation of the newest attempt
    pub fn current_generation(&self) -> Generation {
        Generation(self.inner.generation.load(Ordering::SeqCst))
    }

    /// Connect: reconstruct the tree (fresh, from a seeded snapshot, or
    /// from the peer's stored layout), then open a channel per pane.
    /// Retries with backoff per the configured policy.
    pub async fn connect(&self) -> Result<(), GateError> {
        let (generation, abort) = self.begin_attempt()?;
        self.run_connect(generation, abort).await
    }

    /// Reconnect from `disengaged` or `disconnected`. Safe to call while a
    /// previous attempt is still in flight: the stale attempt is
    /// superseded and its session discarded.
    pub async fn reconnect(&self) -> Result<(), GateError> {
        let (generation, abort) = self.begin_attempt()?;
        self.run_connect(generation, abort).await
    }

    /// Graceful suspension: snapshot the layout, push it to the peer,
    /// close the session, keep the pane tree with its bindings cleared.
    /// Resolves only after the session confirms closure; pending retry
    /// timers are canceled before anything else.
    pub async fn disengage(&self) -> Result<(), GateError> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(GateError::Destroyed);
        }
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.cancel_attempt();

        let (session, snapshot) = {
            let mut st = self.inner.state.lock().await;
            let snapshot = st.tree.snapshot();
            if !snapshot.is_empty() {
                st.snapshot = Some(snapshot.clone());
            }
            st.channels.clear();
            st.tree.unbind_all();
            st.phase = GatePhase::Disengaged;
            (st.session.take(), snapshot)
        };

        if let Some(session) = session {
            if !snapshot.is_empty() {
                if let Err(e) = session.store_layout(&snapshot).await {
                    tracing::debug!("Could not store layout on peer: {}", e);
                }
            }
            session.close().await.map_err(GateError::Session)?;
        }
        tracing::info!("Disengaged from {}", self.inner.name);
        Ok(())
    }

    /// Snapshot the current layout for the persistence layer. The stored
    /// copy is replaced wholesale; readers never observe a partial write.
    pub async fn payload(&self) -> LayoutSnapshot {
        let mut st = self.inner.state.lock().await;
        let snapshot = st.tree.snapshot();
        if snapshot.is_empty() {
            if let Some(existing) = &st.snapshot {
                return existing.clone();
            }
        } else {
            st.snapshot = Some(snapshot.clone());
        }
        snapshot
    }

    /// Split a pane. Purely structural when disconnected (the new pane
    /// binds lazily on the next connect); binds immediately when live.
    pub async fn split_pane(&self, pane: PaneId) -> Result<PaneId, GateError> {
        let (new_pane, session) = {
            let mut st = self.inner.state.lock().await;
            let new_pane = st
                .tree
                .split_pane(pane)
                .ok_or(GateError::UnknownPane(pane))?;
            let session = if st.phase == GatePhase::Connected {
                st.session.clone()
            } else {
                None
            };
            (new_pane, session)
        };

        if let Some(session) = session {
            let generation = self.current_generation();
            if let Err(e) = self.bind_single(generation, &session, new_pane).await {
                tracing::warn!("New pane {} left unbound: {}", new_pane, e);
            }
        }
        Ok(new_pane)
    }

    /// Remove a pane and close its channel, if bound
    pub async fn close_pane(&self, pane: PaneId) -> Result<(), GateError> {
        let (removed, channel) = {
            let mut st = self.inner.state.lock().await;
            let removed = st.tree.close_pane(pane);
            let channel = st.channels.remove(&pane);
            (removed, channel)
        };
        if removed.is_none() {
            return Err(GateError::UnknownPane(pane));
        }
        if let Some(channel) = channel {
            let _ = channel.close().await;
        }
        Ok(())
    }

    /// Propagate a geometry change: remembered in the tree, forwarded to
    /// the bound channel when there is one
    pub async fn resize_pane(&self, pane: PaneId, size: TermSize) -> Result<(), GateError> {
        let channel = {
            let mut st = self.inner.state.lock().await;
            if st.tree.pane(pane).is_none() {
                return Err(GateError::UnknownPane(pane));
            }
            st.tree.resize_pane(pane, size);
            st.channels.get(&pane).cloned()
        };
        if let Some(channel) = channel {
            if let Err(e) = channel.resize(size).await {
                tracing::debug!("Resize of {} not delivered: {}", pane, e);
            }
        }
        Ok(())
    }

    /// Record the last rendered line for a pane
    pub async fn set_marker(&self, pane: PaneId, marker: ScrollMarker) {
        self.inner.state.lock().await.tree.set_marker(pane, marker);
    }

    /// A pane's scroll marker, for resuming output without re-rendering
    pub async fn pane_marker(&self, pane: PaneId) -> Option<ScrollMarker> {
        self.inner.state.lock().await.tree.pane(pane)?.marker
    }

    /// The channel currently bound to a pane. `None` unless the gate is
    /// connected and the binding belongs to the current session.
    pub async fn pane_channel(&self, pane: PaneId) -> Option<Arc<dyn Channel>> {
        let st = self.inner.state.lock().await;
        if st.phase != GatePhase::Connected {
            return None;
        }
        let binding = st.tree.pane(pane)?.binding?;
        if binding.generation != st.session_generation {
            return None;
        }
        st.channels.get(&pane).cloned()
    }

    /// Subscribe the rendering layer to a pane's channel events
    pub async fn take_pane_events(
        &self,
        pane: PaneId,
    ) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        let channel = self.pane_channel(pane).await?;
        channel.take_events()
    }

    /// Ids of all panes, across windows
    pub async fn pane_ids(&self) -> Vec<PaneId> {
        self.inner
            .state
            .lock()
            .await
            .tree
            .panes()
            .map(|p| p.id)
            .collect()
    }

    /// Total pane count
    pub async fn pane_count(&self) -> usize {
        self.inner.state.lock().await.tree.pane_count()
    }

    /// Currently active pane
    pub async fn active_pane(&self) -> Option<PaneId> {
        self.inner.state.lock().await.tree.active_pane()
    }

    /// Make a pane (and its window) active
    pub async fn activate_pane(&self, pane: PaneId) {
        self.inner.state.lock().await.tree.activate(pane);
    }

    /// Destroy the gate: cancel all timers, supersede any attempt, and
    /// tear the session down abruptly
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.cancel_attempt();

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut st = inner.state.lock().await;
            st.channels.clear();
            st.phase = GatePhase::Disconnected;
            if let Some(session) = st.session.take() {
                session.disconnect();
            }
        });
        tracing::debug!("Gate {} destroyed", self.inner.name);
    }

    fn is_current(&self, generation: Generation) -> bool {
        self.inner.generation.load(Ordering::SeqCst) == generation.0
    }

    fn check_current(&self, generation: Generation) -> Result<(), AttemptError> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(AttemptError::Destroyed);
        }
        if !self.is_current(generation) {
            return Err(AttemptError::Superseded);
        }
        Ok(())
    }

    /// Cancel the attempt in flight (if any) and every pending timer
    fn cancel_attempt(&self) {
        self.inner
            .attempt_abort
            .lock()
            .expect("attempt abort lock poisoned")
            .cancel();
        self.inner.timers.cancel_all();
    }

    /// Start a new attempt: claim the next generation and supersede the
    /// previous attempt, canceling its pending timers
    fn begin_attempt(&self) -> Result<(Generation, CancellationToken), GateError> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(GateError::Destroyed);
        }
        let generation = Generation(self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1);
        let abort = CancellationToken::new();
        {
            let mut slot = self
                .inner
                .attempt_abort
                .lock()
                .expect("attempt abort lock poisoned");
            slot.cancel();
            *slot = abort.clone();
        }
        self.inner.timers.cancel_all();
        Ok((generation, abort))
    }

    /// The retry loop around individual attempts
    async fn run_connect(
        &self,
        generation: Generation,
        abort: CancellationToken,
    ) -> Result<(), GateError> {
        // Discard any stale session; panes stay, bindings do not. A gate
        // seeded with a persisted snapshot gets its tree back before any
        // transport work, so a failed connect still leaves the layout
        // intact for a manual retry.
        let stale = {
            let mut st = self.inner.state.lock().await;
            st.phase = GatePhase::Connecting;
            st.channels.clear();
            st.tree.unbind_all();
            if st.tree.is_empty() {
                if let Some(snapshot) = &st.snapshot {
                    if !snapshot.is_empty() {
                        st.tree = PaneTree::from_snapshot(snapshot);
                    }
                }
            }
            st.session.take()
        };
        if let Some(stale) = stale {
            stale.disconnect();
        }

        let max_attempts = self.inner.config.retry.max_retries.max(1);
        let mut backoff = ExponentialBackoff::from_config(&self.inner.config.retry.backoff);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if let Err(e) = self.check_current(generation) {
                return Err(self.map_abort(e));
            }
            self.inner.retries.store(attempt, Ordering::SeqCst);

            match self.try_attempt(generation, &abort).await {
                Ok(()) => {
                    self.inner.retries.store(0, Ordering::SeqCst);
                    (self.inner.notifier)(format!("Connected to {}", self.inner.name));
                    return Ok(());
                }
                Err(AttemptError::Fatal(error)) => {
                    {
                        let mut st = self.inner.state.lock().await;
                        if self.is_current(generation) {
                            st.phase = GatePhase::Disconnected;
                        }
                    }
                    (self.inner.notifier)(format!(
                        "Could not connect to {}: {}",
                        self.inner.name, error
                    ));
                    return Err(error);
                }
                Err(AttemptError::Superseded) => return Err(GateError::Superseded),
                Err(AttemptError::Destroyed) => return Err(GateError::Destroyed),
                Err(AttemptError::Failed(kind)) => {
                    if attempt >= max_attempts {
                        {
                            let mut st = self.inner.state.lock().await;
                            if self.is_current(generation) {
                                st.phase = GatePhase::Disconnected;
                            }
                        }
                        (self.inner.notifier)(format!(
                            "Could not connect to {}",
                            self.inner.name
                        ));
                        return Err(GateError::RetriesExhausted { attempts: attempt });
                    }

                    let delay = backoff.next_delay();
                    (self.inner.notifier)(format!(
                        "Connection to {} failed ({}), retrying (attempt {} of {})",
                        self.inner.name, kind, attempt, max_attempts
                    ));
                    tracing::info!("Retrying {} in {:?}", self.inner.name, delay);
                    let slept = tokio::select! {
                        _ = abort.cancelled() => false,
                        elapsed = self.inner.timers.sleep(delay) => elapsed,
                    };
                    if !slept {
                        return Err(self.map_abort(AttemptError::Superseded));
                    }
                }
            }
        }
    }

    fn map_abort(&self, error: AttemptError) -> GateError {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            GateError::Destroyed
        } else {
            match error {
                AttemptError::Fatal(e) => e,
                AttemptError::Destroyed => GateError::Destroyed,
                _ => GateError::Superseded,
            }
        }
    }

    /// One attempt: new session, connect, restore layout, bind panes
    async fn try_attempt(
        &self,
        generation: Generation,
        abort: &CancellationToken,
    ) -> Result<(), AttemptError> {
        let session = self
            .inner
            .factory
            .create()
            .await
            .map_err(|e| AttemptError::Fatal(GateError::Session(e)))?;

        let mut state_rx = session.watch_state();
        session
            .connect()
            .await
            .map_err(|e| AttemptError::Fatal(GateError::Session(e)))?;

        let outcome = tokio::select! {
            _ = abort.cancelled() => {
                session.disconnect();
                return Err(AttemptError::Superseded);
            }
            result = tokio::time::timeout(
                self.inner.config.retry.connect_timeout,
                wait_for_outcome(&mut state_rx),
            ) => match result {
                Ok(outcome) => outcome,
                Err(_) => {
                    session.disconnect();
                    return Err(AttemptError::Failed(FailureKind::TimedOut));
                }
            },
        };
        match outcome {
            SessionState::Connected => {}
            SessionState::Failed(kind) => return Err(AttemptError::Failed(kind)),
            _ => return Err(AttemptError::Failed(FailureKind::Disconnected)),
        }

        if let Err(e) = self.check_current(generation) {
            session.disconnect();
            return Err(e);
        }

        self.restore_layout(&session).await;
        self.bind_panes(generation, &session).await?;

        {
            let mut st = self.inner.state.lock().await;
            if !self.is_current(generation) {
                drop(st);
                session.disconnect();
                return Err(AttemptError::Superseded);
            }
            st.session = Some(Arc::clone(&session));
            st.session_generation = generation;
            st.phase = GatePhase::Connected;
        }
        self.spawn_session_watch(generation, session);
        Ok(())
    }

    /// Reconstruct the tree if this gate has never had one: prefer the
    /// seeded snapshot, then the layout stored on the peer, then a fresh
    /// single pane
    async fn restore_layout(&self, session: &Arc<dyn Session>) {
        let needs_remote = {
            let st = self.inner.state.lock().await;
            st.tree.is_empty() && st.snapshot.is_none()
        };
        if needs_remote {
            match session.fetch_layout().await {
                Ok(Some(remote)) => {
                    tracing::debug!("Restoring layout of {} from peer", self.inner.name);
                    self.inner.state.lock().await.snapshot = Some(remote);
                }
                Ok(None) => {}
                Err(e) => tracing::debug!("No layout stored on peer: {}", e),
            }
        }

        let mut st = self.inner.state.lock().await;
        if st.tree.is_empty() {
            st.tree = match &st.snapshot {
                Some(snapshot) if !snapshot.is_empty() => PaneTree::from_snapshot(snapshot),
                _ => PaneTree::fresh(self.default_command(), TermSize::default()),
            };
        }
    }

    /// Open a channel for every pane with its remembered geometry and
    /// command, rebinding as each one comes up
    async fn bind_panes(
        &self,
        generation: Generation,
        session: &Arc<dyn Session>,
    ) -> Result<(), AttemptError> {
        let specs: Vec<(PaneId, ChannelSpec)> = {
            let st = self.inner.state.lock().await;
            st.tree
                .panes()
                .map(|pane| {
                    (
                        pane.id,
                        self.channel_spec(&pane.command, pane.size, session.is_ssh()),
                    )
                })
                .collect()
        };

        for (pane_id, spec) in specs {
            if let Err(e) = self.check_current(generation) {
                session.disconnect();
                return Err(e);
            }
            let channel = match session.open_channel(spec).await {
                Ok(channel) => channel,
                Err(e) => {
                    tracing::warn!("Failed to open channel for {}: {}", pane_id, e);
                    session.disconnect();
                    let kind = session
                        .state()
                        .failure()
                        .unwrap_or(FailureKind::Unreachable);
                    return Err(AttemptError::Failed(kind));
                }
            };
            let channel: Arc<dyn Channel> = Arc::from(channel);

            let mut st = self.inner.state.lock().await;
            if !self.is_current(generation) {
                drop(st);
                let _ = channel.close().await;
                session.disconnect();
                return Err(AttemptError::Superseded);
            }
            st.tree.bind(pane_id, channel.id(), generation);
            st.channels.insert(pane_id, channel);
        }
        Ok(())
    }

    /// Bind one pane against the current session (pane splits while live)
    async fn bind_single(
        &self,
        generation: Generation,
        session: &Arc<dyn Session>,
        pane_id: PaneId,
    ) -> Result<(), GateError> {
        let spec = {
            let st = self.inner.state.lock().await;
            let pane = st.tree.pane(pane_id).ok_or(GateError::UnknownPane(pane_id))?;
            self.channel_spec(&pane.command, pane.size, session.is_ssh())
        };
        let channel = session
            .open_channel(spec)
            .await
            .map_err(GateError::Session)?;
        let channel: Arc<dyn Channel> = Arc::from(channel);

        let mut st = self.inner.state.lock().await;
        if !self.is_current(generation) || st.session_generation != generation {
            drop(st);
            let _ = channel.close().await;
            return Err(GateError::Superseded);
        }
        st.tree.bind(pane_id, channel.id(), generation);
        st.channels.insert(pane_id, channel);
        Ok(())
    }

    /// Frame a pane's spawn command for the session's transport. SSH runs
    /// the command line through the remote login shell, so an explicit
    /// command replaces that shell (quoted against embedded quotes); the
    /// WebRTC peers spawn the raw command themselves.
    fn channel_spec(&self, command: &str, size: TermSize, is_ssh: bool) -> ChannelSpec {
        let command = if command.is_empty() {
            self.default_command()
        } else {
            command.to_string()
        };
        let framed = if is_ssh && !command.is_empty() {
            format!("exec sh -c {}", shell_quote(&command))
        } else {
            command
        };
        ChannelSpec::new(framed, size)
    }

    fn default_command(&self) -> String {
        self.inner.config.command.clone().unwrap_or_default()
    }

    /// Watch a connected session for a mid-session failure and drive the
    /// automatic reconnect. Superseded generations are ignored.
    fn spawn_session_watch(&self, generation: Generation, session: Arc<dyn Session>) {
        let gate = self.clone();
        let mut rx = session.watch_state();
        tokio::spawn(async move {
            loop {
                let current = *rx.borrow_and_update();
                if current.is_terminal() {
                    if let SessionState::Failed(kind) = current {
                        gate.on_session_failure(generation, kind).await;
                    }
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        });
    }

    async fn on_session_failure(&self, generation: Generation, kind: FailureKind) {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return;
        }
        if !self.is_current(generation) {
            return;
        }
        {
            let mut st = self.inner.state.lock().await;
            if st.phase != GatePhase::Connected || st.session_generation != generation {
                return;
            }
            st.channels.clear();
            st.tree.unbind_all();
        }

        (self.inner.notifier)(format!(
            "Connection to {} lost ({})",
            self.inner.name, kind
        ));
        if let Err(e) = self.reconnect().await {
            tracing::warn!("Automatic reconnect of {} failed: {}", self.inner.name, e);
        }
    }
}

/// Wait until a session's state leaves `Connecting`
async fn wait_for_outcome(
    rx: &mut tokio::sync::watch::Receiver<SessionState>,
) -> SessionState {
    loop {
        let current = *rx.borrow_and_update();
        match current {
            SessionState::Connecting => {
                if rx.changed().await.is_err() {
                    return SessionState::Failed(FailureKind::Disconnected);
                }
            }
            other => return other,
        }
    }
}

/// Single-quote a string for embedding in a shell command line
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
