//! Convenience logging setup for examples, doctests, and integration tests.
//!
//! The library itself never installs a global `tracing` subscriber — it only
//! emits spans and events. Binaries embedding `repage` call
//! [`init_logging`] (or install their own subscriber) to see them.

use crate::error::{RepageError, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Installs a `tracing-subscriber` fmt subscriber filtered by `level`
/// (an `EnvFilter` directive string, e.g. `"repage=debug"`).
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| RepageError::InvalidConfig(format!("invalid log level: {e}")))?,
        )
        .with_target(true)
        .try_init()
        .map_err(|_| RepageError::InvalidConfig("logging already initialized".into()))
}
