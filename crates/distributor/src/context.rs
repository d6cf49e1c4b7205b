//! Shared loop context handed to every long-lived distributor loop.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use uniform::Subscription;

/// Cancellation plus the shared completion counter.
///
/// Every loop is spawned on `tracker`; shutdown is complete once the tracker
/// is closed and empty.
#[derive(Clone, Default)]
pub struct LoopContext {
    pub cancel: CancellationToken,
    pub tracker: TaskTracker,
}

impl LoopContext {
    pub fn new(cancel: CancellationToken, tracker: TaskTracker) -> Self {
        Self { cancel, tracker }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drive `fut` unless the context is cancelled or `stop` is signalled
    /// first. `None` means the loop must exit.
    pub async fn until_stopped<F: Future>(&self, stop: &Notify, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            _ = stop.notified() => None,
            out = fut => Some(out),
        }
    }
}

/// Stop signal for one loop instance.
///
/// [`StopSignal::arm`] hands out a fresh [`Notify`] for each run; a stop that
/// lands after the previous run already exited is discarded with it.
#[derive(Default)]
pub struct StopSignal {
    current: Mutex<Arc<Notify>>,
}

impl StopSignal {
    pub fn arm(&self) -> Arc<Notify> {
        let fresh = Arc::new(Notify::new());
        *self.lock() = fresh.clone();
        fresh
    }

    /// Single-slot permit: a stop before the loop waits is kept.
    pub fn stop(&self) {
        self.lock().notify_one();
    }

    fn lock(&self) -> MutexGuard<'_, Arc<Notify>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Identity and initial subscription snapshot from a successful register.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrationData {
    /// Registry-assigned id; empty for integrations without identity.
    pub id: String,
    pub subscriptions: Vec<Subscription>,
}

impl RegistrationData {
    pub fn new(id: impl Into<String>, subscriptions: Vec<Subscription>) -> Self {
        Self {
            id: id.into(),
            subscriptions,
        }
    }

    pub fn has_identity(&self) -> bool {
        !self.id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_until_stopped_runs_future() {
        let ctx = LoopContext::default();
        let stop = Notify::new();
        assert_eq!(ctx.until_stopped(&stop, async { 7 }).await, Some(7));
    }

    #[tokio::test]
    async fn test_stop_permit_is_stored() {
        let ctx = LoopContext::default();
        let stop = Notify::new();
        stop.notify_one();
        stop.notify_one();
        let out = ctx
            .until_stopped(&stop, std::future::pending::<()>())
            .await;
        assert!(out.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_stop_does_not_reach_next_run() {
        let ctx = LoopContext::default();
        let signal = StopSignal::default();

        let first = signal.arm();
        signal.stop();
        assert!(ctx.until_stopped(&first, std::future::pending::<()>()).await.is_none());

        // Stop after the run exited, as shutdown does when a loop ended early.
        signal.stop();
        let second = signal.arm();
        let out = ctx
            .until_stopped(&second, tokio::time::sleep(std::time::Duration::from_secs(1)))
            .await;
        assert_eq!(out, Some(()));

        signal.stop();
        assert!(ctx.until_stopped(&second, std::future::pending::<()>()).await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_wins() {
        let ctx = LoopContext::default();
        ctx.cancel.cancel();
        let stop = Notify::new();
        assert!(ctx.until_stopped(&stop, async { 1 }).await.is_none());
        assert!(ctx.is_cancelled());
    }
}
