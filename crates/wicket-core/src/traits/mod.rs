//! Transport-polymorphic contracts

mod channel;
mod session;

pub use channel::{Channel, ChannelEvent};
pub use session::{ChannelSpec, Session, SessionFactory};
