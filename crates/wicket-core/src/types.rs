//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a pane within a gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaneId(pub u32);

impl PaneId {
    /// Create a new pane ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pane-{}", self.0)
    }
}

impl From<u32> for PaneId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Unique identifier for a window within a gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowId(pub u32);

impl WindowId {
    /// Create a new window ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "window-{}", self.0)
    }
}

/// Transport-assigned identifier for a channel, unique within its session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub u32);

impl ChannelId {
    /// Create a new channel ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

impl From<u32> for ChannelId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Generation counter for session instances owned by a gate.
///
/// Every session the gate creates gets the next generation. Callbacks and
/// channel bindings carry the generation of the session that produced them;
/// anything tagged with a superseded generation is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Generation(pub u64);

impl Generation {
    /// The generation before any session has been created
    pub const ZERO: Generation = Generation(0);

    /// Next generation
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen-{}", self.0)
    }
}

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSize {
    /// Number of columns
    pub columns: u16,
    /// Number of rows
    pub rows: u16,
}

impl TermSize {
    /// Create a new terminal size
    pub fn new(columns: u16, rows: u16) -> Self {
        Self { columns, rows }
    }
}

impl Default for TermSize {
    fn default() -> Self {
        Self {
            columns: 80,
            rows: 24,
        }
    }
}

/// Transport variant backing a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// SSH client connection
    Ssh,
    /// WebRTC peer connection, signaled over WebSocket
    WebRtc,
    /// WebRTC peer connection, signaled over an HTTP exchange
    Hybrid,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Ssh => write!(f, "ssh"),
            TransportKind::WebRtc => write!(f, "webrtc"),
            TransportKind::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// Channel readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Channel is being opened
    Connecting,
    /// Channel is open for I/O
    Open,
    /// Channel close is in progress
    Closing,
    /// Channel is closed
    Closed,
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadyState::Connecting => write!(f, "connecting"),
            ReadyState::Open => write!(f, "open"),
            ReadyState::Closing => write!(f, "closing"),
            ReadyState::Closed => write!(f, "closed"),
        }
    }
}

/// Lifecycle phase of a gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePhase {
    /// No session; either never connected or retries exhausted
    Disconnected,
    /// A connect or reconnect attempt is in flight
    Connecting,
    /// Session is live and panes are bound
    Connected,
    /// Gracefully suspended; layout preserved, session closed
    Disengaged,
}

impl fmt::Display for GatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatePhase::Disconnected => write!(f, "disconnected"),
            GatePhase::Connecting => write!(f, "connecting"),
            GatePhase::Connected => write!(f, "connected"),
            GatePhase::Disengaged => write!(f, "disengaged"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_ordering() {
        let g0 = Generation::ZERO;
        let g1 = g0.next();
        let g2 = g1.next();

        assert!(g0 < g1);
        assert!(g1 < g2);
        assert_eq!(g1, Generation(1));
    }

    #[test]
    fn test_transport_kind_display() {
        assert_eq!(format!("{}", TransportKind::Ssh), "ssh");
        assert_eq!(format!("{}", TransportKind::Hybrid), "hybrid");
    }

    #[test]
    fn test_term_size_default() {
        let size = TermSize::default();
        assert_eq!(size.columns, 80);
        assert_eq!(size.rows, 24);
    }
}
