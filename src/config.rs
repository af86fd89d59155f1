//! Configuration Module
//!
//! Settings for an [`ObjectCache`](crate::cache::ObjectCache): capacity,
//! idle and lease expiry, and the inline purge hint.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Cache settings.
///
/// The cache takes its own copy at construction, so changing a settings
/// value afterwards never affects a running cache. A timeout equal to
/// [`CacheSettings::INFINITE`] disables the corresponding policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Maximum number of tracked entries; 0 disables caching
    pub capacity_limit: usize,
    /// Unreferenced dwell time after which an entry may be evicted
    pub idle_timeout: Duration,
    /// Lifetime from creation after which an entry may be evicted
    pub lease_timeout: Duration,
    /// Refused admissions between inline purges of a full cache; 0 disables
    pub purge_frequency: usize,
}

impl CacheSettings {
    /// Sentinel timeout that disables a policy.
    pub const INFINITE: Duration = Duration::MAX;

    pub const DEFAULT_CAPACITY_LIMIT: usize = 64;
    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(2 * 60);
    pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
    pub const DEFAULT_PURGE_FREQUENCY: usize = 32;

    /// Sets the maximum number of tracked entries.
    pub fn with_capacity_limit(mut self, capacity_limit: usize) -> Self {
        self.capacity_limit = capacity_limit;
        self
    }

    /// Sets the idle timeout.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Sets the lease timeout.
    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    /// Sets how many refused admissions trigger an inline purge.
    pub fn with_purge_frequency(mut self, purge_frequency: usize) -> Self {
        self.purge_frequency = purge_frequency;
        self
    }

    /// Disables idle eviction.
    pub fn without_idle_timeout(self) -> Self {
        self.with_idle_timeout(Self::INFINITE)
    }

    /// Disables lease eviction.
    pub fn without_lease_timeout(self) -> Self {
        self.with_lease_timeout(Self::INFINITE)
    }

    /// True unless the idle timeout is [`CacheSettings::INFINITE`].
    pub fn idle_timeout_enabled(&self) -> bool {
        self.idle_timeout != Self::INFINITE
    }

    /// True unless the lease timeout is [`CacheSettings::INFINITE`].
    pub fn lease_timeout_enabled(&self) -> bool {
        self.lease_timeout != Self::INFINITE
    }

    /// Whether idle expiry needs a timer-driven sweep.
    ///
    /// A zero idle timeout evicts every entry on its last release, so no
    /// unreferenced entry is ever left behind for a sweep to find.
    pub fn idle_sweep_enabled(&self) -> bool {
        self.idle_timeout_enabled() && !self.idle_timeout.is_zero()
    }

    /// Delay before the first background sweep, or `None` when no policy
    /// needs one.
    pub fn sweep_interval(&self) -> Option<Duration> {
        if self.idle_sweep_enabled() {
            Some(self.idle_timeout)
        } else if self.lease_timeout_enabled() && !self.lease_timeout.is_zero() {
            Some(self.lease_timeout)
        } else {
            None
        }
    }

    /// Loads settings from environment variables.
    ///
    /// # Environment Variables
    /// - `OBJECT_CACHE_CAPACITY_LIMIT` - Maximum tracked entries (default: 64)
    /// - `OBJECT_CACHE_IDLE_TIMEOUT_SECS` - Idle timeout in seconds or `infinite` (default: 120)
    /// - `OBJECT_CACHE_LEASE_TIMEOUT_SECS` - Lease timeout in seconds or `infinite` (default: 300)
    /// - `OBJECT_CACHE_PURGE_FREQUENCY` - Refused admissions per inline purge (default: 32)
    ///
    /// Unset variables keep their defaults; malformed ones are an error.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            capacity_limit: env_var("OBJECT_CACHE_CAPACITY_LIMIT", parse_count)?
                .unwrap_or(defaults.capacity_limit),
            idle_timeout: env_var("OBJECT_CACHE_IDLE_TIMEOUT_SECS", parse_timeout)?
                .unwrap_or(defaults.idle_timeout),
            lease_timeout: env_var("OBJECT_CACHE_LEASE_TIMEOUT_SECS", parse_timeout)?
                .unwrap_or(defaults.lease_timeout),
            purge_frequency: env_var("OBJECT_CACHE_PURGE_FREQUENCY", parse_count)?
                .unwrap_or(defaults.purge_frequency),
        })
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity_limit: Self::DEFAULT_CAPACITY_LIMIT,
            idle_timeout: Self::DEFAULT_IDLE_TIMEOUT,
            lease_timeout: Self::DEFAULT_LEASE_TIMEOUT,
            purge_frequency: Self::DEFAULT_PURGE_FREQUENCY,
        }
    }
}

fn env_var<T>(name: &str, parse: fn(&str) -> std::result::Result<T, String>) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => parse(raw.trim())
            .map(Some)
            .map_err(|reason| CacheError::InvalidSettings(format!("{}: {}", name, reason))),
        Err(_) => Ok(None),
    }
}

fn parse_count(raw: &str) -> std::result::Result<usize, String> {
    raw.parse()
        .map_err(|_| format!("expected a non-negative integer, got {:?}", raw))
}

/// Parses whole seconds, or `infinite` for a disabled policy.
fn parse_timeout(raw: &str) -> std::result::Result<Duration, String> {
    if raw.eq_ignore_ascii_case("infinite") {
        return Ok(CacheSettings::INFINITE);
    }
    raw.parse()
        .map(Duration::from_secs)
        .map_err(|_| format!("expected seconds or \"infinite\", got {:?}", raw))
}
