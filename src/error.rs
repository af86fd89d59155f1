//! Error types for the object cache
//!
//! Cache operations never fail for policy reasons (a full cache or a key
//! collision degrades to a shell entry). Errors only arise while loading
//! settings or wiring up the background timer.

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the object cache.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// A setting could not be parsed
    #[error("Invalid setting: {0}")]
    InvalidSettings(String),

    /// No tokio runtime is available to drive the sweep timer
    #[error("No runtime available: {0}")]
    NoRuntime(String),
}

// == Result Type Alias ==
/// Convenience Result type for the object cache.
pub type Result<T> = std::result::Result<T, CacheError>;
