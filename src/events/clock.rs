//! Time as a capability, so refresh scheduling stays testable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tokio::sync::watch;

/// Outcome of a cancellable delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayResult {
    Elapsed,
    Interrupted,
}

/// Cancellation handle shared between a scheduled delay and its canceller.
///
/// Cloning produces another handle on the same token; `cancel` wakes every
/// pending and future wait.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::new()
    }
}

impl CancelToken {
    pub fn new() -> CancelToken {
        let (tx, rx) = watch::channel(false);
        CancelToken {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        // The sender lives inside this token, so changed() can only fail
        // after a cancel has been observed.
        let _ = rx.changed().await;
    }
}

#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Local>;

    /// Waits for `duration` unless the token fires first.
    async fn delay(&self, duration: Duration, cancel: &CancelToken) -> DelayResult;
}

/// Production clock backed by tokio timers.
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }

    async fn delay(&self, duration: Duration, cancel: &CancelToken) -> DelayResult {
        tokio::select! {
            _ = tokio::time::sleep(duration) => DelayResult::Elapsed,
            _ = cancel.cancelled() => DelayResult::Interrupted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delay_elapses() {
        let clock = SystemClock;
        let cancel = CancelToken::new();
        let result = clock.delay(Duration::from_millis(1), &cancel).await;
        assert_eq!(DelayResult::Elapsed, result);
    }

    #[tokio::test]
    async fn test_cancel_before_delay_interrupts_immediately() {
        let clock = SystemClock;
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = clock.delay(Duration::from_secs(3600), &cancel).await;
        assert_eq!(DelayResult::Interrupted, result);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_pending_delay() {
        let clock = Arc::new(SystemClock);
        let cancel = CancelToken::new();
        let waiter = {
            let clock = clock.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { clock.delay(Duration::from_secs(3600), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        assert_eq!(DelayResult::Interrupted, waiter.await.unwrap());
    }
}
