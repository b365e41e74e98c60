//! Value types carried through the measurement pipeline.
//!
//! - [`SweepConfig`] - parameters of one linear voltage sweep
//! - [`RawTrace`] - the instrument readout, one [`TracePoint`] per step
//! - [`SweepResult`] - photovoltaic figures of merit derived from a trace

pub mod result;
pub mod sweep;

pub use result::{OperatingPoint, SweepResult};
pub use sweep::{RawTrace, SweepConfig, TracePoint};
