// rust/batch-core/src/observability.rs

//! Logging setup for worker processes.

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::{BatchError, Result};

/// Installs a global fmt subscriber.
///
/// `RUST_LOG` takes precedence over `level` when set.
///
/// # Errors
///
/// Returns a configuration error if `level` is not a valid filter or a
/// global subscriber is already installed.
pub fn init_logging(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).map_err(|e| {
            BatchError::config_with_source(format!("invalid log level '{level}'"), e)
        })?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| BatchError::config_with_source("failed to install log subscriber", e))
}
