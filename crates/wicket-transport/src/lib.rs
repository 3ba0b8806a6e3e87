//! wicket-transport: Session implementations for wicket
//!
//! Three transport variants conforming to the `wicket-core` session
//! contract: SSH (russh client), WebRTC (webrtc data channels signaled
//! over WebSocket), and hybrid (the same peer connection negotiated
//! through an HTTP signaling exchange).

pub mod channel;
pub mod factory;
pub mod ssh;
pub mod webrtc;

pub use factory::TransportFactory;
pub use ssh::SshSession;
pub use webrtc::WebRtcSession;
