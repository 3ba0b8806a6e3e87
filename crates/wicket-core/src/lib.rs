//! wicket-core: Core abstractions and configuration for wicket
//!
//! This crate provides the shared domain types, error taxonomy, layout
//! snapshot model, and the transport-polymorphic session/channel traits
//! consumed by the gate state machine and the transport implementations.

pub mod config;
pub mod error;
pub mod layout;
pub mod state;
pub mod traits;
pub mod types;

pub use error::{FailureKind, WicketError};
pub use layout::LayoutSnapshot;
pub use state::SessionState;
pub use types::{ChannelId, PaneId, TermSize, TransportKind, WindowId};
