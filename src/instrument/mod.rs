//! Station instruments: the SMU sweep session, relay board and positioner.

pub mod capabilities;
pub mod positioner;
pub mod relay;
pub mod session;

pub use capabilities::{PersistedArtifacts, PixelSelector, Positioner, ResultSink, ScpiTransport};
pub use positioner::FixedProbe;
pub use relay::RelayBoard;
pub use session::InstrumentSession;
