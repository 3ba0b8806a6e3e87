//! Session factory
//!
//! Selects the session variant from the gate profile. The gate calls
//! `create()` for every connect attempt; sessions are never reused across
//! attempts.

use async_trait::async_trait;
use std::sync::Arc;

use wicket_core::config::GateConfig;
use wicket_core::error::SessionError;
use wicket_core::traits::{Session, SessionFactory};
use wicket_core::types::TransportKind;

use crate::ssh::SshSession;
use crate::webrtc::WebRtcSession;

/// Config-driven factory over the three transport variants
pub struct TransportFactory {
    config: GateConfig,
}

impl TransportFactory {
    /// Create a factory for the given gate profile
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionFactory for TransportFactory {
    async fn create(&self) -> Result<Arc<dyn Session>, SessionError> {
        let session: Arc<dyn Session> = match self.config.transport {
            TransportKind::Ssh => Arc::new(SshSession::new(self.config.clone())),
            kind => Arc::new(WebRtcSession::new(self.config.clone(), kind)),
        };
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_factory_selects_variant() {
        let mut config = GateConfig {
            address: "devbox".to_string(),
            ..Default::default()
        };

        let session = TransportFactory::new(config.clone()).create().await.unwrap();
        assert!(session.is_ssh());

        config.transport = TransportKind::Hybrid;
        let session = TransportFactory::new(config).create().await.unwrap();
        assert_eq!(session.kind(), TransportKind::Hybrid);
        assert!(!session.is_ssh());
    }
}
