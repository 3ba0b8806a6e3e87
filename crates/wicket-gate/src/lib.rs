//! wicket-gate: Gate reconnection state machine
//!
//! A gate represents one remote host as the user sees it: a tree of
//! windows and panes plus the single current session. The gate owns
//! reconnection policy (retry, backoff, disengage, full reconnect) and
//! preserves pane-to-channel bindings across session replacement, so a
//! transport failure never destroys layout.

pub mod backoff;
pub mod gate;
pub mod timers;
pub mod tree;

pub use backoff::ExponentialBackoff;
pub use gate::{Gate, Notifier};
pub use timers::TimerRegistry;
pub use tree::{Pane, PaneTree, Window};
