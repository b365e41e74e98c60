//! Configuration System using Figment
//!
//! Strongly-typed settings for the measurement station. Configuration is
//! loaded from:
//! 1. `config/default.toml` (or a path given on the command line)
//! 2. Environment variables prefixed with `PIXEL_IV_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! PIXEL_IV_APPLICATION__LOG_LEVEL=debug
//! PIXEL_IV_INSTRUMENT__RESOURCE="USB0::0x05E6::0x2450::04387860::INSTR"
//! PIXEL_IV_RUN__INPUT_POWER_WATTS=0.1
//! ```
//!
//! # Example
//!
//! ```no_run
//! use pixel_iv_daq::config::Settings;
//!
//! let settings = Settings::load_from("config/default.toml")?;
//! println!("{} pixels configured", settings.pixels.len());
//! # Ok::<(), pixel_iv_daq::error::DaqError>(())
//! ```

use crate::error::DaqError;
use crate::measurement::SweepConfig;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level station configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub application: ApplicationConfig,
    pub instrument: InstrumentConfig,
    pub relay: RelayConfig,
    pub positioner: PositionerConfig,
    /// Default sweep used when the caller does not override it
    pub sweep: SweepConfig,
    pub run: RunConfig,
    /// Pixel map in measurement order
    pub pixels: Vec<PixelDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Base directory; each run writes into a sub-directory of it
    pub output_dir: PathBuf,
}

/// Which SMU transport to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentBackend {
    Mock,
    Visa,
}

/// Source-measure unit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    pub backend: InstrumentBackend,
    /// VISA resource string (e.g., "USB0::0x05E6::0x2450::04387860::INSTR")
    pub resource: String,
    /// Per-command I/O timeout
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,
    /// Upper bound on waiting for a sweep to complete
    #[serde(with = "humantime_serde")]
    pub sweep_timeout: Duration,
    /// Interval between completion polls
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub line_terminator: String,
}

/// Which relay-board driver to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayBackend {
    Mock,
    Serial,
}

/// Pixel-selector relay board configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub backend: RelayBackend,
    /// Serial port (e.g., "/dev/ttyACM0", "COM7")
    pub port: String,
    pub baud_rate: u32,
    /// Wait after switching before the sweep starts
    #[serde(with = "humantime_serde")]
    pub settle: Duration,
}

/// Which positioner to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionerBackend {
    /// Probe does not move; pixels are only switched by the relay board
    Fixed,
    Mock,
}

/// XY positioner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionerConfig {
    pub backend: PositionerBackend,
    /// Delay after reaching a pixel
    #[serde(with = "humantime_serde")]
    pub move_settle: Duration,
    /// Delay after returning home
    #[serde(with = "humantime_serde")]
    pub home_settle: Duration,
    /// Travel speed of the simulated stage
    pub speed_mm_per_sec: f64,
}

/// What a batch does after a pixel fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the failure and move on to the next pixel
    Continue,
    /// Stop the batch at the first failure
    Abort,
}

/// Run-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Incident optical power used for efficiency (W)
    pub input_power_watts: f64,
    /// Orchestrator-level bound on one pixel, independent of the instrument timeout
    #[serde(with = "humantime_serde")]
    pub pixel_timeout: Duration,
    pub on_pixel_error: FailurePolicy,
    /// Pending requests accepted by the measurement queue
    pub queue_capacity: usize,
}

/// One pixel of the device under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PixelDefinition {
    pub id: u32,
    pub x_mm: f64,
    pub y_mm: f64,
    /// Bytes written to the relay board to route the SMU to this pixel
    pub relay_command: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application: ApplicationConfig {
                name: "Pixel I-V Station".to_string(),
                log_level: "info".to_string(),
                output_dir: PathBuf::from("data"),
            },
            instrument: InstrumentConfig {
                backend: InstrumentBackend::Mock,
                resource: "USB0::0x05E6::0x2450::04387860::INSTR".to_string(),
                io_timeout: Duration::from_secs(5),
                sweep_timeout: Duration::from_secs(20),
                poll_interval: Duration::from_millis(50),
                line_terminator: "\n".to_string(),
            },
            relay: RelayConfig {
                backend: RelayBackend::Mock,
                port: "COM7".to_string(),
                baud_rate: 9600,
                settle: Duration::from_secs(1),
            },
            positioner: PositionerConfig {
                backend: PositionerBackend::Mock,
                move_settle: Duration::from_secs(2),
                home_settle: Duration::from_secs(1),
                speed_mm_per_sec: 10.0,
            },
            sweep: SweepConfig::default(),
            run: RunConfig {
                input_power_watts: 0.0,
                pixel_timeout: Duration::from_secs(60),
                on_pixel_error: FailurePolicy::Continue,
                queue_capacity: 8,
            },
            pixels: default_pixels(),
        }
    }
}

/// Eight-pixel substrate: two columns, relay tokens in wiring order.
fn default_pixels() -> Vec<PixelDefinition> {
    [
        (1, 0.0, 5.0, "r"),
        (2, 0.0, 10.0, "g"),
        (3, 0.0, 15.0, "b"),
        (4, 0.0, 20.0, "f"),
        (5, 5.0, 20.0, "y"),
        (6, 5.0, 15.0, "u"),
        (7, 5.0, 10.0, "i"),
        (8, 5.0, 5.0, "k"),
    ]
    .into_iter()
    .map(|(id, x_mm, y_mm, token)| PixelDefinition {
        id,
        x_mm,
        y_mm,
        relay_command: token.to_string(),
    })
    .collect()
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load `config/default.toml` plus environment overrides.
    pub fn load() -> Result<Self, DaqError> {
        Self::load_from("config/default.toml")
    }

    /// Load configuration from a specific file path.
    ///
    /// Precedence (highest first): `PIXEL_IV_` environment variables, the
    /// TOML file, built-in defaults. A missing file falls back to defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, DaqError> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PIXEL_IV_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML string (no environment overrides).
    pub fn from_toml_str(toml: &str) -> Result<Self, DaqError> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::string(toml))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), DaqError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        self.sweep.validate()?;

        if self.instrument.sweep_timeout.is_zero() {
            return Err(DaqError::Configuration(
                "instrument.sweep_timeout must be non-zero".to_string(),
            ));
        }
        if self.instrument.poll_interval.is_zero() {
            return Err(DaqError::Configuration(
                "instrument.poll_interval must be non-zero".to_string(),
            ));
        }
        if self.run.pixel_timeout <= self.instrument.sweep_timeout {
            return Err(DaqError::Configuration(format!(
                "run.pixel_timeout ({:?}) must exceed instrument.sweep_timeout ({:?})",
                self.run.pixel_timeout, self.instrument.sweep_timeout
            )));
        }
        if self.run.queue_capacity == 0 {
            return Err(DaqError::Configuration(
                "run.queue_capacity must be at least 1".to_string(),
            ));
        }
        if !self.run.input_power_watts.is_finite() {
            return Err(DaqError::Configuration(
                "run.input_power_watts must be finite".to_string(),
            ));
        }
        if self.positioner.speed_mm_per_sec <= 0.0 {
            return Err(DaqError::Configuration(
                "positioner.speed_mm_per_sec must be positive".to_string(),
            ));
        }

        if self.pixels.is_empty() {
            return Err(DaqError::Configuration(
                "at least one pixel must be defined".to_string(),
            ));
        }
        let mut ids = HashSet::new();
        for pixel in &self.pixels {
            if !ids.insert(pixel.id) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate pixel id: {}",
                    pixel.id
                )));
            }
            if pixel.relay_command.is_empty() {
                return Err(DaqError::Configuration(format!(
                    "pixel {} has an empty relay_command",
                    pixel.id
                )));
            }
        }

        Ok(())
    }

    /// Look up a pixel by id.
    pub fn pixel(&self, id: u32) -> Result<&PixelDefinition, DaqError> {
        self.pixels
            .iter()
            .find(|p| p.id == id)
            .ok_or(DaqError::UnknownPixel(id))
    }

    /// Pixel ids in configured order.
    pub fn pixel_ids(&self) -> Vec<u32> {
        self.pixels.iter().map(|p| p.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.pixel_ids(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(settings.pixel(5).unwrap().relay_command, "y");
    }

    #[test]
    fn toml_overrides_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            [instrument]
            backend = "visa"
            sweep_timeout = "30s"

            [run]
            input_power_watts = 0.1
            pixel_timeout = "2m"
            on_pixel_error = "abort"

            [sweep]
            start_voltage = -0.2
            stop_voltage = 1.2
            step_count = 50
            step_delay_secs = 0.05
            current_limit_amps = 0.1
            voltage_range_volts = 2.0
            "#,
        )
        .unwrap();

        assert_eq!(settings.instrument.backend, InstrumentBackend::Visa);
        assert_eq!(settings.instrument.sweep_timeout, Duration::from_secs(30));
        assert_eq!(settings.run.pixel_timeout, Duration::from_secs(120));
        assert_eq!(settings.run.on_pixel_error, FailurePolicy::Abort);
        assert_eq!(settings.sweep.step_count, 50);
        // Untouched sections keep their defaults
        assert_eq!(settings.relay.baud_rate, 9600);
        assert_eq!(settings.pixels.len(), 8);
    }

    #[test]
    fn invalid_log_level_rejected() {
        let err = Settings::from_toml_str(
            r#"
            [application]
            log_level = "loud"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Invalid log level"));
    }

    #[test]
    fn duplicate_pixel_ids_rejected() {
        let mut settings = Settings::default();
        settings.pixels[1].id = 1;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate pixel id"));
    }

    #[test]
    fn pixel_timeout_must_exceed_sweep_timeout() {
        let mut settings = Settings::default();
        settings.run.pixel_timeout = Duration::from_secs(10);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn unknown_pixel_lookup() {
        let settings = Settings::default();
        assert!(matches!(settings.pixel(42), Err(DaqError::UnknownPixel(42))));
    }
}
