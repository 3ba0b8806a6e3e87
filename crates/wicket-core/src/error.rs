//! Core error types for wicket

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the wicket ecosystem
#[derive(Error, Debug)]
pub enum WicketError {
    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Channel error
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Gate error
    #[error("Gate error: {0}")]
    Gate(#[from] GateError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Normalized transport failure kinds.
///
/// Every transport-level error a session can observe (ICE failure, auth
/// rejection, socket errors, timeouts) is folded into one of these before
/// it crosses into the gate, as `SessionState::Failed(kind)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Handshake or keepalive exceeded the configured timeout
    TimedOut,
    /// Transport rejected the presented credentials
    Unauthorized,
    /// Remote peer does not support a requested capability
    NotImplemented,
    /// Peer-initiated close, clean or abrupt
    Disconnected,
    /// Connection could not be established (DNS, ICE, socket)
    Unreachable,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::TimedOut => write!(f, "timed out"),
            FailureKind::Unauthorized => write!(f, "unauthorized"),
            FailureKind::NotImplemented => write!(f, "not implemented"),
            FailureKind::Disconnected => write!(f, "disconnected"),
            FailureKind::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Session-related errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Operation requires a connected session
    #[error("Session is not connected")]
    NotConnected,

    /// The transport could not allocate a channel
    #[error("Channel open failed: {0}")]
    ChannelOpen(String),

    /// Connection parameters are unusable; reported synchronously from
    /// `connect()` and never subject to retry
    #[error("Invalid connection parameters: {0}")]
    InvalidParameters(String),

    /// Runtime transport operation failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// The layout payload on the remote peer could not be parsed
    #[error("Malformed layout payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
}

/// Channel-related errors
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The channel is already closed
    #[error("Channel is closed")]
    Closed,

    /// Runtime transport operation failed
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Gate-related errors
#[derive(Error, Debug)]
pub enum GateError {
    /// Session error surfaced through the gate
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// All configured retries failed
    #[error("Could not connect after {attempts} attempts")]
    RetriesExhausted {
        /// Number of attempts made
        attempts: u32,
    },

    /// The attempt was superseded by a newer reconnect
    #[error("Connect attempt superseded")]
    Superseded,

    /// The gate has been destroyed
    #[error("Gate is destroyed")]
    Destroyed,

    /// No pane with the given id exists in this gate
    #[error("No such pane: {0}")]
    UnknownPane(crate::types::PaneId),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// No gate profile with the given name
    #[error("Unknown gate profile: {0}")]
    UnknownProfile(String),
}
