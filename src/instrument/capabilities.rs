//! Capability traits for the collaborators around the measurement core.
//!
//! The orchestrator only talks to hardware through these traits, so the same
//! sequencing runs against real drivers, mocks, or a stationary probe.

use crate::config::PixelDefinition;
use crate::measurement::SweepResult;
use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Line-oriented SCPI link to an instrument.
#[async_trait]
pub trait ScpiTransport: Send {
    /// Open the link.
    async fn connect(&mut self) -> Result<()>;

    /// Close the link. Closing an already closed link is a no-op.
    async fn disconnect(&mut self) -> Result<()>;

    /// Send a command without reading a response.
    async fn write(&mut self, command: &str) -> Result<()>;

    /// Send a command and read one response line (trimmed).
    async fn query(&mut self, command: &str) -> Result<String>;

    fn is_connected(&self) -> bool;

    /// Human-readable description for logs.
    fn info(&self) -> String;
}

/// XY positioner carrying the probe (pen-plotter style stage).
#[async_trait]
pub trait Positioner: Send {
    /// Open the session. `Ok(false)` means the device did not answer.
    async fn connect(&mut self) -> Result<bool>;

    /// Absolute move in millimetres; returns once the move has settled.
    async fn move_to(&mut self, x_mm: f64, y_mm: f64) -> Result<()>;

    /// Move back to the origin.
    async fn return_home(&mut self) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;

    /// Last commanded position.
    fn position(&self) -> (f64, f64);
}

/// Relay board routing the SMU to one pixel.
#[async_trait]
pub trait PixelSelector: Send {
    async fn open(&mut self) -> Result<()>;

    /// Write the pixel's command token(s) to the board.
    async fn select(&mut self, pixel: &PixelDefinition) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Paths of the artifacts written for one result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedArtifacts {
    pub iv_curve: PathBuf,
    pub pv_curve: PathBuf,
    pub report: PathBuf,
}

/// Destination for reduced results (curve data and text report).
#[async_trait]
pub trait ResultSink: Send {
    async fn persist(
        &mut self,
        result: &SweepResult,
        destination: &Path,
    ) -> Result<PersistedArtifacts>;
}
