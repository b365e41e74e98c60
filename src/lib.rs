//! Automated I-V characterization of solar-cell pixel arrays.
//!
//! A source-measure unit sweeps each pixel's voltage and records the current;
//! the trace is reduced to the photovoltaic figures of merit (maximum power
//! point, short-circuit current, open-circuit voltage, efficiency) and
//! persisted as curve data plus a text report.
//!
//! # Layout
//!
//! - [`measurement`] - sweep parameters, raw traces, reduced results
//! - [`data`] - the reducer and result sinks
//! - [`instrument`] - capability traits, the SMU sweep session, relay board
//! - [`adapters`] - VISA and serial transports
//! - [`station`] / [`orchestrator`] - hardware bundle and run sequencing
//! - [`app_actor`] / [`messages`] - single-worker queue for front ends
//! - [`config`] / [`logging`] / [`error`] - ambient plumbing

pub mod adapters;
pub mod app_actor;
pub mod config;
pub mod data;
pub mod error;
pub mod error_recovery;
pub mod hardware;
pub mod instrument;
pub mod logging;
pub mod measurement;
pub mod messages;
pub mod orchestrator;
pub mod station;

pub use app_actor::MeasurementHandle;
pub use config::Settings;
pub use error::{AppResult, DaqError, PixelFailure, Stage};
pub use orchestrator::{
    BatchReport, MeasurementOrchestrator, MeasurementRecord, RunRequest, RunState,
};
pub use station::Station;
