//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole
//! measurement pipeline. Using the `thiserror` crate, it gives every stage
//! (configuration, hardware sessions, trace reduction, artifact persistence)
//! one consistent error vocabulary.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: an instrument, relay board or positioner could not be
//!   reached when the station was opened. Fatal for the run.
//! - **`Instrument`**: a configuration or query command failed, or the device
//!   reported an entry in its error queue. Also raised for malformed sweep
//!   readouts (wrong sample count, unparsable values).
//! - **`InstrumentTimeout`**: the sweep did not complete in time.
//! - **`EmptyTrace`** / **`ShapeMismatch`** / **`NonFiniteSample`**:
//!   data-integrity failures found while reducing a trace. They never produce
//!   a partial result.
//! - **`Io`**: persisting artifacts failed.
//! - **`Config`** / **`Configuration`**: loading or validating settings failed.
//!
//! Per-pixel failures are wrapped in [`PixelFailure`], which records the pixel
//! and the [`Stage`] so that the pixel can be retried on its own.

use crate::measurement::SweepResult;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Instrument did not complete the sweep within {0:?}")]
    InstrumentTimeout(Duration),

    #[error("Cannot reduce an empty trace")]
    EmptyTrace,

    #[error("Voltage/current length mismatch: {voltages} voltages, {currents} currents")]
    ShapeMismatch { voltages: usize, currents: usize },

    #[error("Trace sample {index} is not a finite number")]
    NonFiniteSample { index: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("A measurement is already in progress")]
    Busy,

    #[error("Measurement aborted")]
    Aborted,

    #[error("Pixel {0} is not defined in the pixel map")]
    UnknownPixel(u32),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),

    #[error(transparent)]
    Pixel(#[from] Box<PixelFailure>),
}

impl From<figment::Error> for DaqError {
    fn from(error: figment::Error) -> Self {
        DaqError::Config(Box::new(error))
    }
}

impl From<PixelFailure> for DaqError {
    fn from(failure: PixelFailure) -> Self {
        DaqError::Pixel(Box::new(failure))
    }
}

/// Step of the single-pixel flow in which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Queued,
    Positioning,
    Selecting,
    Configuring,
    Sweeping,
    Reducing,
    Persisting,
    Homing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Queued => "queued",
            Stage::Positioning => "positioning",
            Stage::Selecting => "selecting",
            Stage::Configuring => "configuring",
            Stage::Sweeping => "sweeping",
            Stage::Reducing => "reducing",
            Stage::Persisting => "persisting",
            Stage::Homing => "homing",
        };
        f.write_str(name)
    }
}

/// A failed pixel measurement with enough context to retry that pixel alone.
#[derive(Error, Debug)]
#[error("pixel {pixel} failed while {stage}: {error}")]
pub struct PixelFailure {
    pub pixel: u32,
    pub stage: Stage,
    #[source]
    pub error: DaqError,
    /// Result already computed before the failure, kept when only
    /// persisting or homing went wrong.
    pub result: Option<Box<SweepResult>>,
}

impl PixelFailure {
    pub fn new(pixel: u32, stage: Stage, error: DaqError) -> Self {
        Self {
            pixel,
            stage,
            error,
            result: None,
        }
    }

    pub fn with_result(mut self, result: SweepResult) -> Self {
        self.result = Some(Box::new(result));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::Instrument("-222,\"Data out of range\"".to_string());
        assert_eq!(
            err.to_string(),
            "Instrument error: -222,\"Data out of range\""
        );
    }

    #[test]
    fn test_shape_mismatch_display() {
        let err = DaqError::ShapeMismatch {
            voltages: 5,
            currents: 4,
        };
        assert!(err.to_string().contains("5 voltages, 4 currents"));
    }

    #[test]
    fn test_pixel_failure_names_pixel_and_stage() {
        let failure = PixelFailure::new(
            3,
            Stage::Sweeping,
            DaqError::InstrumentTimeout(Duration::from_secs(20)),
        );
        let msg = failure.to_string();
        assert!(msg.contains("pixel 3"));
        assert!(msg.contains("sweeping"));
    }

    #[test]
    fn test_errors_stay_small() {
        // both travel inside Result on every fallible path
        assert!(std::mem::size_of::<DaqError>() <= 64);
        assert!(std::mem::size_of::<PixelFailure>() <= 128);
    }

    #[test]
    fn test_pixel_failure_keeps_result() {
        let trace = crate::measurement::RawTrace::from_interleaved(&[0.0, 2.0, 1.0, 1.8]).unwrap();
        let result = crate::data::reducer::reduce(&trace, 0.0).unwrap();
        let failure = PixelFailure::new(2, Stage::Persisting, DaqError::Aborted)
            .with_result(result.clone());
        assert_eq!(failure.result.as_deref(), Some(&result));
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = DaqError::ShutdownFailed(vec![
            DaqError::Connection("relay port vanished".into()),
            DaqError::Instrument("close failed".into()),
        ]);
        assert!(err.to_string().contains("Shutdown failed"));
    }
}
