//! Manual Scheduler
//!
//! Holds timers until the owner fires them. Useful for deterministic tests
//! and for hosts that drive sweeps from their own event loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::timer::{Scheduler, TimerCallback, TimerHandle};

struct PendingTimer {
    delay: Duration,
    callback: TimerCallback,
    cancelled: Arc<AtomicBool>,
}

impl PendingTimer {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A scheduler whose timers fire only through [`ManualScheduler::fire_all`].
#[derive(Clone, Default)]
pub struct ManualScheduler {
    pending: Arc<Mutex<Vec<PendingTimer>>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of armed, uncancelled timers.
    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .iter()
            .filter(|timer| !timer.is_cancelled())
            .count()
    }

    /// Delay of the most recently armed, uncancelled timer.
    pub fn last_delay(&self) -> Option<Duration> {
        self.pending
            .lock()
            .iter()
            .rev()
            .find(|timer| !timer.is_cancelled())
            .map(|timer| timer.delay)
    }

    /// Fires every armed timer regardless of its delay.
    ///
    /// Timers armed by the callbacks themselves stay pending for the next
    /// call. Returns the number of callbacks run.
    pub fn fire_all(&self) -> usize {
        let timers = std::mem::take(&mut *self.pending.lock());

        let mut fired = 0;
        for timer in timers {
            if !timer.is_cancelled() {
                (timer.callback)();
                fired += 1;
            }
        }
        fired
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> Box<dyn TimerHandle> {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.pending.lock().push(PendingTimer {
            delay,
            callback,
            cancelled: cancelled.clone(),
        });
        Box::new(ManualTimerHandle { cancelled })
    }
}

struct ManualTimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle for ManualTimerHandle {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}
