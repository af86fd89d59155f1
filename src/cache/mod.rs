//! Cache Module
//!
//! Reference-counted object caching with idle and lease eviction.

mod clock;
mod entry;
mod stats;
mod store;


// Re-export public types
pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::{Disposer, Entry, ValueRef};
pub use stats::CacheStats;
pub use store::{ObjectCache, ObjectCacheBuilder};
