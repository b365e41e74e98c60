//! Sweep parameters and the raw instrument trace.

use crate::error::DaqError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parameters of one linear voltage sweep.
///
/// Supplied by the caller per measurement (or once per batch) and never
/// mutated by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    /// First source voltage (V)
    pub start_voltage: f64,
    /// Last source voltage (V)
    pub stop_voltage: f64,
    /// Number of sweep points, at least 1
    pub step_count: u32,
    /// Dwell per sweep point (s)
    pub step_delay_secs: f64,
    /// Source current limit (A)
    pub current_limit_amps: f64,
    /// Source voltage range (V)
    pub voltage_range_volts: f64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            start_voltage: 0.0,
            stop_voltage: 1.0,
            step_count: 28,
            step_delay_secs: 0.1,
            current_limit_amps: 1.0,
            voltage_range_volts: 2.0,
        }
    }
}

impl SweepConfig {
    /// Check the invariants the instrument and the reducer rely on.
    pub fn validate(&self) -> Result<(), DaqError> {
        if self.step_count < 1 {
            return Err(DaqError::Configuration(
                "sweep step_count must be at least 1".to_string(),
            ));
        }
        if !self.start_voltage.is_finite() || !self.stop_voltage.is_finite() {
            return Err(DaqError::Configuration(
                "sweep start/stop voltages must be finite".to_string(),
            ));
        }
        if !self.step_delay_secs.is_finite() || self.step_delay_secs < 0.0 {
            return Err(DaqError::Configuration(format!(
                "sweep step delay must be >= 0 s, got {}",
                self.step_delay_secs
            )));
        }
        if !self.current_limit_amps.is_finite() || self.current_limit_amps <= 0.0 {
            return Err(DaqError::Configuration(format!(
                "current limit must be positive, got {} A",
                self.current_limit_amps
            )));
        }
        if !self.voltage_range_volts.is_finite() || self.voltage_range_volts <= 0.0 {
            return Err(DaqError::Configuration(format!(
                "voltage range must be positive, got {} V",
                self.voltage_range_volts
            )));
        }
        let peak = self.start_voltage.abs().max(self.stop_voltage.abs());
        if peak > self.voltage_range_volts {
            return Err(DaqError::Configuration(format!(
                "sweep endpoint {} V exceeds the {} V source range",
                peak, self.voltage_range_volts
            )));
        }
        Ok(())
    }

    /// Nominal time the instrument spends dwelling on sweep points.
    pub fn nominal_duration(&self) -> Duration {
        Duration::from_secs_f64(self.step_delay_secs * f64::from(self.step_count))
    }

    /// Number of scalar values the trace buffer readout must contain.
    pub fn expected_readings(&self) -> usize {
        2 * self.step_count as usize
    }
}

/// One sweep point: sourced voltage and measured current.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TracePoint {
    pub voltage: f64,
    pub current: f64,
}

impl TracePoint {
    pub fn new(voltage: f64, current: f64) -> Self {
        Self { voltage, current }
    }

    /// Electrical power at this point, sign preserved.
    pub fn power(&self) -> f64 {
        self.voltage * self.current
    }
}

/// The instrument's sweep readout in sweep order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTrace {
    points: Vec<TracePoint>,
}

impl RawTrace {
    pub fn new(points: Vec<TracePoint>) -> Self {
        Self { points }
    }

    /// Build a trace from separate voltage and current columns.
    pub fn from_columns(voltages: &[f64], currents: &[f64]) -> Result<Self, DaqError> {
        if voltages.len() != currents.len() {
            return Err(DaqError::ShapeMismatch {
                voltages: voltages.len(),
                currents: currents.len(),
            });
        }
        Ok(Self::new(
            voltages
                .iter()
                .zip(currents)
                .map(|(&v, &i)| TracePoint::new(v, i))
                .collect(),
        ))
    }

    /// De-interleave a `v0, i0, v1, i1, ...` readout.
    pub fn from_interleaved(values: &[f64]) -> Result<Self, DaqError> {
        if values.len() % 2 != 0 {
            return Err(DaqError::ShapeMismatch {
                voltages: values.len().div_ceil(2),
                currents: values.len() / 2,
            });
        }
        Ok(Self::new(
            values
                .chunks_exact(2)
                .map(|pair| TracePoint::new(pair[0], pair[1]))
                .collect(),
        ))
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[TracePoint] {
        &self.points
    }

    pub fn voltages(&self) -> impl Iterator<Item = f64> + '_ {
        self.points.iter().map(|p| p.voltage)
    }

    pub fn currents(&self) -> impl Iterator<Item = f64> + '_ {
        self.points.iter().map(|p| p.current)
    }
}
