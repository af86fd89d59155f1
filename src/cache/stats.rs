//! Cache Statistics Module
//!
//! Tracks lookups, refused admissions, evictions and teardowns.

use chrono::{DateTime, Utc};
use serde::Serialize;

// == Cache Stats ==
/// Snapshot of cache activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Lookups that returned a shared entry
    pub hits: u64,
    /// Lookups that found nothing usable
    pub misses: u64,
    /// Entries handed out untracked because admission was refused
    pub shells: u64,
    /// Entries removed by the idle or lease policy
    pub evictions: u64,
    /// Values torn down (tracked and shell entries alike)
    pub disposals: u64,
    /// Completed eviction passes (timer, inline purge or manual)
    pub sweeps: u64,
    /// Current number of tracked entries
    pub total_entries: usize,
    /// Wall-clock time of the last eviction pass
    pub last_sweep_at: Option<DateTime<Utc>>,
}

impl CacheStats {
    // == Constructor ==
    pub fn new() -> Self {
        Self::default()
    }

    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no lookups have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    // == Record Activity ==
    /// Counts a lookup that returned a shared entry.
    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    /// Counts a lookup that found nothing usable.
    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    /// Counts a refused admission.
    pub fn record_shell(&mut self) {
        self.shells += 1;
    }

    /// Adds entries removed by the idle or lease policy.
    pub fn record_evictions(&mut self, count: usize) {
        self.evictions += count as u64;
    }

    /// Adds values torn down.
    pub fn record_disposals(&mut self, count: usize) {
        self.disposals += count as u64;
    }

    // == Record Sweep ==
    /// Counts an eviction pass and stamps its time.
    pub fn record_sweep(&mut self) {
        self.sweeps += 1;
        self.last_sweep_at = Some(Utc::now());
    }

    /// Sets the tracked entry count at snapshot time.
    pub fn set_total_entries(&mut self, count: usize) {
        self.total_entries = count;
    }
}
