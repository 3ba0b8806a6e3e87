//! Per-gate timer registry
//!
//! Every scheduled delay a gate takes (retry backoff, reconnect grace) runs
//! through its registry so the whole group can be canceled at once on
//! disengage or gate destruction. Nothing here is process-global; a gate's
//! timers die with the gate.

use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Group-cancelable timers owned by one gate
pub struct TimerRegistry {
    root: Mutex<CancellationToken>,
}

impl TimerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            root: Mutex::new(CancellationToken::new()),
        }
    }

    /// Sleep under the registry. Returns `true` if the delay elapsed,
    /// `false` if it was canceled as part of the group.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let token = self
            .root
            .lock()
            .expect("timer registry lock poisoned")
            .child_token();
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Cancel every pending timer. The registry stays usable; later sleeps
    /// get a fresh group.
    pub fn cancel_all(&self) {
        let mut root = self.root.lock().expect("timer registry lock poisoned");
        root.cancel();
        *root = CancellationToken::new();
    }
}

impl Default for TimerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_sleep_elapses() {
        let timers = TimerRegistry::new();
        assert!(timers.sleep(Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn test_cancel_all_interrupts_pending_sleep() {
        let timers = Arc::new(TimerRegistry::new());

        let sleeper = {
            let timers = Arc::clone(&timers);
            tokio::spawn(async move { timers.sleep(Duration::from_secs(60)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        timers.cancel_all();

        let elapsed = tokio::time::timeout(Duration::from_secs(1), sleeper)
            .await
            .expect("canceled sleep did not return")
            .unwrap();
        assert!(!elapsed);
    }

    #[tokio::test]
    async fn test_registry_usable_after_cancel() {
        let timers = TimerRegistry::new();
        timers.cancel_all();
        assert!(timers.sleep(Duration::from_millis(5)).await);
    }
}
