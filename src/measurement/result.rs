//! Photovoltaic figures of merit derived from one sweep.

use super::sweep::TracePoint;
use serde::Serialize;

/// A voltage/current pair together with its (signed) power.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OperatingPoint {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
}

/// Reduced result of one I-V sweep.
///
/// Every scalar is computed from the same trace snapshot, which is kept in
/// `samples` so curve artifacts are written from exactly the data the metrics
/// came from. Fields are read-only once the reducer has built the value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepResult {
    pub(crate) identifier: Option<String>,
    pub(crate) input_power_watts: f64,
    pub(crate) samples: Vec<TracePoint>,
    pub(crate) max_power_point: OperatingPoint,
    pub(crate) max_power_index: usize,
    pub(crate) short_circuit_current: f64,
    pub(crate) short_circuit_index: usize,
    pub(crate) open_circuit_voltage: f64,
    pub(crate) open_circuit_index: usize,
    pub(crate) efficiency_percent: f64,
}

impl SweepResult {
    /// Attach a label (e.g. the pixel number) used for artifact naming.
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    pub fn input_power_watts(&self) -> f64 {
        self.input_power_watts
    }

    pub fn samples(&self) -> &[TracePoint] {
        &self.samples
    }

    pub fn max_power_point(&self) -> OperatingPoint {
        self.max_power_point
    }

    /// Magnitude of the maximum power point, as reported to the user.
    pub fn max_power_watts(&self) -> f64 {
        self.max_power_point.power.abs()
    }

    pub fn max_power_index(&self) -> usize {
        self.max_power_index
    }

    pub fn short_circuit_current(&self) -> f64 {
        self.short_circuit_current
    }

    pub fn short_circuit_index(&self) -> usize {
        self.short_circuit_index
    }

    pub fn open_circuit_voltage(&self) -> f64 {
        self.open_circuit_voltage
    }

    pub fn open_circuit_index(&self) -> usize {
        self.open_circuit_index
    }

    pub fn efficiency_percent(&self) -> f64 {
        self.efficiency_percent
    }

    /// Text report, one field per line.
    pub fn report(&self) -> String {
        format!(
            "Maximum Power (Pmax): {:.4} W\n\
             Short Circuit Current (Isc): {:.4} A\n\
             Open Circuit Voltage (Voc): {:.4} V\n\
             Efficiency: {:.2}%\n",
            self.max_power_watts(),
            self.short_circuit_current,
            self.open_circuit_voltage,
            self.efficiency_percent
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::data::reducer::reduce;
    use crate::measurement::RawTrace;

    #[test]
    fn report_uses_fixed_precision() {
        let trace = RawTrace::from_interleaved(&[0.0, 2.0, 1.0, 1.8, 2.0, 0.0]).unwrap();
        let result = reduce(&trace, 5.0).unwrap();
        assert_eq!(
            result.report(),
            "Maximum Power (Pmax): 1.8000 W\n\
             Short Circuit Current (Isc): 2.0000 A\n\
             Open Circuit Voltage (Voc): 2.0000 V\n\
             Efficiency: 36.00%\n"
        );
    }

    #[test]
    fn report_prints_power_magnitude() {
        // Fourth-quadrant convention: current flows out of the cell.
        let trace = RawTrace::from_interleaved(&[0.0, -0.02, 0.4, -0.015, 0.6, 0.0]).unwrap();
        let result = reduce(&trace, 0.0).unwrap();
        assert!(result.max_power_point().power < 0.0);
        assert!(result.report().starts_with("Maximum Power (Pmax): 0.0060 W"));
    }

    #[test]
    fn identifier_does_not_change_metrics() {
        let trace = RawTrace::from_interleaved(&[0.0, 2.0, 1.0, 1.8]).unwrap();
        let plain = reduce(&trace, 5.0).unwrap();
        let labelled = plain.clone().with_identifier("4");
        assert_eq!(labelled.identifier(), Some("4"));
        assert_eq!(labelled.max_power_point(), plain.max_power_point());
        assert_eq!(labelled.efficiency_percent(), plain.efficiency_percent());
    }
}
