//! Sweep Timer
//!
//! One-shot, cancellable timers used to wake the eviction sweep.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::error::{CacheError, Result};

/// Work run once when a timer fires.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

// == Scheduler ==
/// Runs a callback once, at or after a delay.
///
/// The cache arms timers while holding its own lock, and the callback takes
/// that lock again. `schedule` must therefore never run the callback before
/// returning, even for a zero delay; hand it to another task or thread.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> Box<dyn TimerHandle>;
}

/// Handle to a pending timer.
///
/// Dropping the handle leaves the timer armed; only `cancel` disarms it.
pub trait TimerHandle: Send {
    fn cancel(&self);
}

// == Tokio Scheduler ==
/// Schedules callbacks on a tokio runtime.
///
/// The task sleeps for the delay and then hands the callback to the
/// blocking pool, since a sweep may run user teardown code.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime the caller is running on.
    pub fn try_current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| CacheError::NoRuntime(e.to_string()))
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> Box<dyn TimerHandle> {
        trace!("Arming sweep timer for {:?}", delay);

        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;

            if let Err(e) = tokio::task::spawn_blocking(callback).await {
                warn!("Sweep timer callback failed: {}", e);
            }
        });

        Box::new(TokioTimerHandle { task })
    }
}

struct TokioTimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle for TokioTimerHandle {
    fn cancel(&self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_callback(counter: &Arc<AtomicUsize>) -> TimerCallback {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_timer_fires_after_delay() {
        let scheduler = TokioScheduler::try_current().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let _handle = scheduler.schedule(Duration::from_millis(50), counting_callback(&fired));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_timer_never_fires() {
        let scheduler = TokioScheduler::try_current().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let handle = scheduler.schedule(Duration::from_millis(50), counting_callback(&fired));
        handle.cancel();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dropped_handle_keeps_timer_armed() {
        let scheduler = TokioScheduler::try_current().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        drop(scheduler.schedule(Duration::from_millis(20), counting_callback(&fired)));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_delay_runs_after_schedule_returns() {
        let scheduler = TokioScheduler::try_current().unwrap();
        let lock = Arc::new(parking_lot::Mutex::new(0usize));

        {
            let mut guard = lock.lock();
            let inner = lock.clone();
            let _handle = scheduler.schedule(
                Duration::ZERO,
                Box::new(move || {
                    *inner.lock() += 1;
                }),
            );
            assert_eq!(*guard, 0);
            *guard += 10;
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*lock.lock(), 11);
    }

    #[test]
    fn test_try_current_outside_runtime() {
        let result = TokioScheduler::try_current();
        assert!(matches!(result, Err(CacheError::NoRuntime(_))));
    }
}
