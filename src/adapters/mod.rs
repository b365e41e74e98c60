//! Transport adapters for the station hardware.
//!
//! Feature-gated: without `instrument_visa` / `instrument_serial` the
//! adapters still compile but refuse to connect.

pub mod serial_adapter;
pub mod visa_adapter;

pub use serial_adapter::SerialAdapter;
pub use visa_adapter::VisaAdapter;
