//! Object Cache - shared, expensive-to-build values behind reference counts
//!
//! Entries are evicted once unreferenced and past their idle or lease
//! timeout. A full cache never displaces live entries; it hands out
//! unshared shell entries instead.

pub mod cache;
pub mod config;
pub mod error;
pub mod tasks;

pub use cache::{CacheStats, Entry, ObjectCache};
pub use config::CacheSettings;
pub use error::{CacheError, Result};
