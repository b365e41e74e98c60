//! Reduction of a raw I-V trace to photovoltaic figures of merit.
//!
//! The reducer is a pure function of the trace and the incident optical
//! power; it performs no I/O. Three independent full-trace scans pick the
//! sample indices:
//!
//! - maximum power point: `argmax |V * I|`
//! - short-circuit current: current at `argmin |V|`
//! - open-circuit voltage: voltage at `argmin |I|`
//!
//! Ties resolve to the earliest sample in sweep order. The scans may (and
//! usually do) land on different indices.

use crate::error::DaqError;
use crate::measurement::{OperatingPoint, RawTrace, SweepResult, TracePoint};

/// Reduce a trace to a [`SweepResult`].
///
/// # Errors
/// - [`DaqError::EmptyTrace`] when the trace has no samples
/// - [`DaqError::NonFiniteSample`] when a voltage or current is NaN/inf
pub fn reduce(trace: &RawTrace, input_power_watts: f64) -> Result<SweepResult, DaqError> {
    let samples = trace.points();
    if samples.is_empty() {
        return Err(DaqError::EmptyTrace);
    }
    if let Some(index) = samples
        .iter()
        .position(|p| !p.voltage.is_finite() || !p.current.is_finite())
    {
        return Err(DaqError::NonFiniteSample { index });
    }

    let power: Vec<f64> = samples.iter().map(TracePoint::power).collect();

    let max_power_index = first_extremum(power.iter().map(|p| p.abs()), |c, best| c > best);
    let short_circuit_index =
        first_extremum(samples.iter().map(|p| p.voltage.abs()), |c, best| c < best);
    let open_circuit_index =
        first_extremum(samples.iter().map(|p| p.current.abs()), |c, best| c < best);

    let mpp = samples[max_power_index];
    let max_power_point = OperatingPoint {
        voltage: mpp.voltage,
        current: mpp.current,
        power: power[max_power_index],
    };

    Ok(SweepResult {
        identifier: None,
        input_power_watts,
        samples: samples.to_vec(),
        max_power_point,
        max_power_index,
        short_circuit_current: samples[short_circuit_index].current,
        short_circuit_index,
        open_circuit_voltage: samples[open_circuit_index].voltage,
        open_circuit_index,
        efficiency_percent: efficiency_percent(max_power_point.power, input_power_watts),
    })
}

/// Reduce separate voltage/current columns.
///
/// # Errors
/// [`DaqError::ShapeMismatch`] when the columns differ in length, plus the
/// errors of [`reduce`].
pub fn reduce_columns(
    voltages: &[f64],
    currents: &[f64],
    input_power_watts: f64,
) -> Result<SweepResult, DaqError> {
    let trace = RawTrace::from_columns(voltages, currents)?;
    reduce(&trace, input_power_watts)
}

/// Conversion efficiency in percent; zero unless the input power is positive.
pub fn efficiency_percent(max_power: f64, input_power_watts: f64) -> f64 {
    if input_power_watts > 0.0 {
        100.0 * max_power.abs() / input_power_watts
    } else {
        0.0
    }
}

/// Index of the first value that `better` prefers over every earlier one.
/// Strict comparison keeps the first occurrence on ties.
fn first_extremum<I, F>(values: I, better: F) -> usize
where
    I: IntoIterator<Item = f64>,
    F: Fn(f64, f64) -> bool,
{
    let mut values = values.into_iter().enumerate();
    let Some((mut best_index, mut best)) = values.next() else {
        return 0;
    };
    for (index, value) in values {
        if better(value, best) {
            best_index = index;
            best = value;
        }
    }
    best_index
}
