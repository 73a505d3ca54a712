//! Shared cancellation scope for the worker threads of a run.
use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

/// Cloneable cancellation flag that blocked waiters observe immediately.
///
/// Every worker of a supervised run (probes, drains, signal relay, sampler) holds a clone.
/// Cancelling is idempotent and never reverts.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: Mutex<bool>,
    wakeup: Condvar,
}

impl CancelToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    fn flag(&self) -> MutexGuard<'_, bool> {
        self.inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancels the scope and wakes every waiter.
    pub fn cancel(&self) {
        let mut cancelled = self.flag();
        *cancelled = true;
        self.inner.wakeup.notify_all();
    }

    /// Returns whether the scope has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.flag()
    }

    /// Blocks for at most `timeout`. Returns `true` if the scope was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cancelled = self.flag();
        while !*cancelled {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            cancelled = self
                .inner
                .wakeup
                .wait_timeout(cancelled, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Blocks until the scope is cancelled.
    pub fn wait(&self) {
        let mut cancelled = self.flag();
        while !*cancelled {
            cancelled = self
                .inner
                .wakeup
                .wait(cancelled)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}
