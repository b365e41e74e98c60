//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence over the configured level, so a single run can
//! be made verbose without touching the config file:
//!
//! ```text
//! RUST_LOG=pixel_iv_daq=debug pixel_iv_daq --mock full-auto
//! ```

use crate::error::DaqError;
use tracing_subscriber::EnvFilter;

/// Install the global `fmt` subscriber filtered at `level`.
pub fn init(level: &str) -> Result<(), DaqError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| DaqError::Configuration(format!("invalid log filter '{}': {}", level, e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| DaqError::Configuration(format!("logging already initialised: {}", e)))
}
