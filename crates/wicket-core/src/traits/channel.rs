//! Channel trait

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::ChannelError;
use crate::types::{ChannelId, ReadyState, TermSize};

/// Events emitted by a channel to its single subscriber (the bound pane)
#[derive(Debug)]
pub enum ChannelEvent {
    /// Output from the remote shell, in transport order
    Data(Bytes),
    /// The channel is closed. Emitted exactly once per channel instance,
    /// whether the close was explicit or transport-initiated.
    Closed,
}

/// A single bidirectional stream bound to one remote shell process.
///
/// Channels are created by [`Session::open_channel`](super::Session) and
/// never outlive their session: when the session reaches a terminal state,
/// every channel it owns emits `Closed` and goes dead.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Transport-assigned identifier, unique within the owning session
    fn id(&self) -> ChannelId;

    /// Current readiness. Never blocks, never fails.
    fn ready_state(&self) -> ReadyState;

    /// Enqueue bytes for transmission.
    ///
    /// Fire-and-forget: a send on a channel that is not open is dropped and
    /// the failure surfaces through the event stream as `Closed`, never as
    /// a return value.
    fn send(&self, data: &[u8]);

    /// Propagate a pane geometry change to the remote pty. Resolves when
    /// the remote acknowledges, or immediately for transports with no ack
    /// concept.
    async fn resize(&self, size: TermSize) -> Result<(), ChannelError>;

    /// Graceful close. After resolution `ready_state()` is `Closed` and the
    /// `Closed` event has been emitted.
    async fn close(&self) -> Result<(), ChannelError>;

    /// Take the event receiver. Single-subscriber: the first caller gets
    /// it, later calls return `None`.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;
}
