//! Message types for actor-based communication
//!
//! Front ends (CLI, GUI) never touch the orchestrator directly while a run
//! is in flight; they submit these commands to the
//! [`MeasurementActor`](crate::app_actor::MeasurementActor) and await the
//! oneshot reply.

use crate::error::{AppResult, PixelFailure};
use crate::orchestrator::{BatchReport, MeasurementRecord, RunRequest};
use tokio::sync::oneshot;

/// Commands that can be sent to the MeasurementActor
#[derive(Debug)]
pub enum MeasurementCommand {
    /// Measure a single pixel
    MeasurePixel {
        pixel: u32,
        request: RunRequest,
        response: oneshot::Sender<Result<MeasurementRecord, PixelFailure>>,
    },

    /// Measure a list of pixels in order ("full auto")
    FullAuto {
        pixels: Vec<u32>,
        request: RunRequest,
        response: oneshot::Sender<AppResult<BatchReport>>,
    },

    /// Release the station and stop the actor
    Shutdown {
        response: oneshot::Sender<AppResult<()>>,
    },
}

impl MeasurementCommand {
    /// Helper to create a MeasurePixel command
    pub fn measure_pixel(
        pixel: u32,
        request: RunRequest,
    ) -> (Self, oneshot::Receiver<Result<MeasurementRecord, PixelFailure>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::MeasurePixel {
                pixel,
                request,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a FullAuto command
    pub fn full_auto(
        pixels: Vec<u32>,
        request: RunRequest,
    ) -> (Self, oneshot::Receiver<AppResult<BatchReport>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::FullAuto {
                pixels,
                request,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}
