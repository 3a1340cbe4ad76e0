//! Error handling for the paging engine.
//!
//! All public APIs return `Result<T, RepageError>` for consistent error
//! handling. Source errors are opaque by design: callers bring their own
//! data-source error type, and the core only needs its `Display`
//! representation to surface it through [`crate::snapshot::LoadState::Error`].

use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::error;

/// Result type for paging operations.
pub type Result<T> = std::result::Result<T, RepageError>;

/// Errors produced by the paging engine.
#[derive(Debug, Error, Clone)]
pub enum RepageError {
    /// A data source (pull, local, remote, or streaming) failed.
    ///
    /// The underlying error is formatted into a string at the boundary so
    /// that `RepageError` stays `'static` and `Clone` regardless of the
    /// embedding application's own error type.
    #[error("data source error: {0}")]
    Source(String),

    /// Background work was cancelled; never surfaced as a load-state error.
    #[error("operation cancelled")]
    Cancelled,

    /// A configuration value violated an invariant at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A `std::sync::Mutex` guarding auxiliary state was poisoned by a
    /// panicking holder. The engine's hot-path state uses
    /// `parking_lot::Mutex`, which never poisons; this variant exists for
    /// the `std::sync::Mutex`es used by test support fakes.
    #[error("internal state lock poisoned")]
    PoisonedState,
}

impl RepageError {
    /// Wrap any source error (pull/local/remote/streaming) as a
    /// [`RepageError::Source`], preserving its `Display` text.
    pub fn from_source<E: std::fmt::Display>(err: E) -> Self {
        Self::Source(err.to_string())
    }
}

/// Safely acquires a `std::sync::Mutex`, converting poisoning into
/// [`RepageError::PoisonedState`] instead of panicking.
pub fn acquire_lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| {
        error!("internal lock poisoned");
        RepageError::PoisonedState
    })
}
