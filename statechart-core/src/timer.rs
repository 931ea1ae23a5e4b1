use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Monotonic generation counter owned by one currently-active state, bumped
/// on every exit of that state. A timer scheduled while the epoch was
/// `N` is safe to cancel even if it is concurrently firing: both the
/// scheduling task's `abort()` and the fired callback's epoch re-check make
/// the same stale timer a no-op either way.
#[derive(Debug, Clone)]
pub struct StateEpoch(Arc<AtomicU64>);

impl StateEpoch {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(0)))
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Called on every exit of the owning state. Returns the new epoch.
    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl Default for StateEpoch {
    fn default() -> Self {
        Self::new()
    }
}

/// A scheduled `after` timer. `cancel` (or simply dropping the handle) aborts
/// the underlying task immediately; this is the fast path. The epoch check
/// inside `fire` is the slow-path guard for the race where `cancel` loses to
/// an already-fired, already-queued callback.
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Backed by `tokio::time`; granularity inherits tokio's timer wheel, which
/// stays within a few milliseconds of the requested delay on any
/// non-degenerate executor.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimerService;

impl TimerService {
    pub fn new() -> Self {
        Self
    }

    /// Schedules `fire` to run after `delay`, but only if `epoch` still
    /// equals `expected` when the sleep completes — i.e. the owning state
    /// has not been exited (and possibly re-entered) since scheduling.
    pub fn schedule<F>(&self, delay: Duration, epoch: StateEpoch, expected: u64, fire: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if epoch.current() == expected {
                fire();
            }
        });
        TimerHandle { task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn fires_when_epoch_unchanged() {
        let service = TimerService::new();
        let epoch = StateEpoch::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let _handle = service.schedule(Duration::from_millis(5), epoch.clone(), epoch.current(), move || {
            fired_clone.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn skipped_when_epoch_bumped_before_fire() {
        let service = TimerService::new();
        let epoch = StateEpoch::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let expected = epoch.current();
        let _handle = service.schedule(Duration::from_millis(20), epoch.clone(), expected, move || {
            fired_clone.store(true, Ordering::SeqCst);
        });
        epoch.bump();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_aborts_before_fire() {
        let service = TimerService::new();
        let epoch = StateEpoch::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let handle = service.schedule(Duration::from_millis(20), epoch.clone(), epoch.current(), move || {
            fired_clone.store(true, Ordering::SeqCst);
        });
        handle.cancel();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
