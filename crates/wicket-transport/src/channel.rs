//! Shared channel plumbing for the transport variants
//!
//! Every channel implementation routes its events through a [`ChannelCore`]:
//! a single-subscriber event queue plus a close latch that guarantees the
//! `Closed` event fires exactly once, even when an explicit `close()` races
//! a transport-initiated close.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

use wicket_core::traits::ChannelEvent;
use wicket_core::types::{ChannelId, ReadyState};

const READY_CONNECTING: u8 = 0;
const READY_OPEN: u8 = 1;
const READY_CLOSING: u8 = 2;
const READY_CLOSED: u8 = 3;

/// Event queue, readiness, and close latch shared between a channel handle
/// and the transport task feeding it
pub struct ChannelCore {
    id: ChannelId,
    ready: AtomicU8,
    closed: AtomicBool,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

impl ChannelCore {
    /// Create a core in the `Connecting` state
    pub fn new(id: ChannelId) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            id,
            ready: AtomicU8::new(READY_CONNECTING),
            closed: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Channel identifier
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Current readiness
    pub fn ready_state(&self) -> ReadyState {
        match self.ready.load(Ordering::SeqCst) {
            READY_CONNECTING => ReadyState::Connecting,
            READY_OPEN => ReadyState::Open,
            READY_CLOSING => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }

    /// Mark the channel open. No-op once closed.
    pub fn mark_open(&self) {
        let _ = self.ready.compare_exchange(
            READY_CONNECTING,
            READY_OPEN,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Mark a graceful close as in progress. No-op once closed.
    pub fn mark_closing(&self) {
        if !self.closed.load(Ordering::SeqCst) {
            let _ = self.ready.compare_exchange(
                READY_OPEN,
                READY_CLOSING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
    }

    /// Whether the channel may accept writes
    pub fn is_open(&self) -> bool {
        self.ready.load(Ordering::SeqCst) == READY_OPEN
    }

    /// Deliver inbound data to the subscriber
    pub fn emit_data(&self, data: Bytes) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.events_tx.send(ChannelEvent::Data(data));
    }

    /// Close the channel and deliver `Closed` exactly once. Subsequent
    /// calls, from either side of a close race, are no-ops.
    pub fn emit_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ready.store(READY_CLOSED, Ordering::SeqCst);
        let _ = self.events_tx.send(ChannelEvent::Closed);
    }

    /// Take the single-subscriber event receiver
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events_rx
            .lock()
            .expect("channel event receiver lock poisoned")
            .take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_data_then_close() {
        let core = ChannelCore::new(ChannelId::new(1));
        let mut rx = core.take_events().unwrap();

        core.mark_open();
        core.emit_data(Bytes::from_static(b"hello"));
        core.emit_closed();

        assert!(matches!(rx.recv().await, Some(ChannelEvent::Data(d)) if &d[..] == b"hello"));
        assert!(matches!(rx.recv().await, Some(ChannelEvent::Closed)));
        assert!(rx.recv().await.is_none());
        assert_eq!(core.ready_state(), ReadyState::Closed);
    }

    #[test]
    fn test_single_subscriber() {
        let core = ChannelCore::new(ChannelId::new(1));
        assert!(core.take_events().is_some());
        assert!(core.take_events().is_none());
    }

    #[test]
    fn test_no_data_after_close() {
        let core = ChannelCore::new(ChannelId::new(1));
        let mut rx = core.take_events().unwrap();

        core.emit_closed();
        core.emit_data(Bytes::from_static(b"late"));

        assert!(matches!(rx.try_recv(), Ok(ChannelEvent::Closed)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_race_fires_once() {
        // Explicit close racing a transport-initiated close: the latch must
        // deliver exactly one Closed event.
        let core = Arc::new(ChannelCore::new(ChannelId::new(7)));
        let mut rx = core.take_events().unwrap();
        core.mark_open();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let core = Arc::clone(&core);
            tasks.push(tokio::spawn(async move {
                core.emit_closed();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut closed_events = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, ChannelEvent::Closed) {
                closed_events += 1;
            }
        }
        assert_eq!(closed_events, 1);
    }
}
