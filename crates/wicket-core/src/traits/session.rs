//! Session trait

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::SessionError;
use crate::layout::LayoutSnapshot;
use crate::state::SessionState;
use crate::traits::Channel;
use crate::types::{ChannelId, TermSize, TransportKind};

/// Parameters for opening a new channel
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    /// Command to run in the remote shell (empty = login shell)
    pub command: String,
    /// Channel to spawn in the context of, when the transport supports
    /// nested shells
    pub parent: Option<ChannelId>,
    /// Initial terminal geometry
    pub size: TermSize,
}

impl ChannelSpec {
    /// Spec for a top-level channel
    pub fn new(command: impl Into<String>, size: TermSize) -> Self {
        Self {
            command: command.into(),
            parent: None,
            size,
        }
    }
}

/// Transport-polymorphic connection to one remote host.
///
/// A session moves `Connecting -> Connected -> Closed`, or into `Failed`
/// from either live state, and never leaves a terminal state. It never
/// retries internally: reconnection is a gate-level decision that discards
/// this instance and creates a new one. The caller (the gate) is
/// responsible for calling `connect()` at most once per instance.
#[async_trait]
pub trait Session: Send + Sync {
    /// Transport variant backing this session
    fn kind(&self) -> TransportKind;

    /// Variant predicate for protocol-specific command quoting
    fn is_ssh(&self) -> bool {
        self.kind() == TransportKind::Ssh
    }

    /// Current state
    fn state(&self) -> SessionState;

    /// Subscribe to state transitions. Observers see a monotonic sequence
    /// consistent with the session state machine.
    fn watch_state(&self) -> watch::Receiver<SessionState>;

    /// Start the transport handshake.
    ///
    /// Only configuration problems (malformed address, missing
    /// credentials) are reported synchronously; the transport outcome
    /// arrives through the state watch as `Connected` or
    /// `Failed(kind)`.
    async fn connect(&self) -> Result<(), SessionError>;

    /// Open a channel bound to a newly spawned remote shell.
    ///
    /// Rejects unless the session is `Connected`, and when the transport
    /// cannot allocate the underlying stream.
    async fn open_channel(&self, spec: ChannelSpec) -> Result<Box<dyn Channel>, SessionError>;

    /// Graceful teardown of the session and all of its channels. Resolves
    /// once the transport confirms closure (or immediately for transports
    /// without a close handshake).
    async fn close(&self) -> Result<(), SessionError>;

    /// Abrupt local teardown with no peer handshake, for when the
    /// transport is known unreachable.
    fn disconnect(&self);

    /// Fetch the layout payload stored on the remote peer, if any
    async fn fetch_layout(&self) -> Result<Option<LayoutSnapshot>, SessionError>;

    /// Store a layout payload on the remote peer
    async fn store_layout(&self, snapshot: &LayoutSnapshot) -> Result<(), SessionError>;
}

/// Creates fresh, unconnected sessions.
///
/// The seam between the gate and the transport variants: the gate calls
/// `create()` for every connect attempt and never reuses an instance whose
/// state went terminal. Tests substitute a scriptable factory.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Create a new unconnected session
    async fn create(&self) -> Result<Arc<dyn Session>, SessionError>;
}
