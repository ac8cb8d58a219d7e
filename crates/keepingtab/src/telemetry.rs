//! Logging setup.

use tracing_subscriber::EnvFilter;

use crate::error::{Result, ServiceError};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Build the filter: `RUST_LOG` if set and valid, otherwise `default`.
pub fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install a compact fmt subscriber for the whole process.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(default: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default))
        .with_target(true)
        .compact()
        .try_init()
        .map_err(|e| ServiceError::Telemetry(e.to_string()))
}
