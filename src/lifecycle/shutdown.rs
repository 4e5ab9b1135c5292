//! Shutdown coordination.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;

use crate::net::connection::ConnectionTracker;

/// Completion signal for a server's shutdown.
///
/// Any number of tasks can wait on it; all of them are released once
/// [`Shutdown::trigger`] has been called, including tasks that start
/// waiting afterwards.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Mark shutdown as complete.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`Shutdown::trigger`] has been called.
    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.tx.subscribe();
        async move {
            let _ = rx.wait_for(|done| *done).await;
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Returned when connections were still open at the deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuiesceTimedOut {
    pub remaining: u64,
}

/// Waits up to `timeout` for every tracked connection to finish.
///
/// The caller must already have called [`ConnectionTracker::begin_drain`].
/// On expiry the remaining connections are told to close immediately.
pub async fn quiesce(tracker: &ConnectionTracker, timeout: Duration) -> Result<(), QuiesceTimedOut> {
    if tokio::time::timeout(timeout, tracker.wait_idle()).await.is_ok() {
        return Ok(());
    }
    let remaining = tracker.active_count();
    tracker.force_close();
    Err(QuiesceTimedOut { remaining })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_resolves_after_trigger() {
        let shutdown = Shutdown::new();
        let early = tokio::spawn(shutdown.wait());
        assert!(!shutdown.is_triggered());

        shutdown.trigger();
        early.await.unwrap();
        // late waiters resolve immediately
        shutdown.wait().await;
    }

    #[tokio::test]
    async fn quiesce_returns_once_idle() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.track();
        tracker.begin_drain();

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(guard);
        });
        quiesce(&tracker, Duration::from_secs(5)).await.unwrap();
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn quiesce_forces_close_on_timeout() {
        let tracker = ConnectionTracker::new();
        let _guard = tracker.track();
        tracker.begin_drain();

        let result = quiesce(&tracker, Duration::from_millis(20)).await;
        assert_eq!(result, Err(QuiesceTimedOut { remaining: 1 }));
        assert_eq!(
            tracker.drain_state(),
            crate::net::connection::DrainState::ForceClose
        );
    }
}
