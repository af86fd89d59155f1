//! Background Tasks Module
//!
//! Timer services that wake the eviction sweep.
//!
//! # Schedulers
//! - [`TokioScheduler`]: sleeps on a tokio runtime, runs the sweep on the blocking pool
//! - [`ManualScheduler`]: holds callbacks until the owner fires them

mod manual;
mod timer;

pub use manual::ManualScheduler;
pub use timer::{Scheduler, TimerCallback, TimerHandle, TokioScheduler};
