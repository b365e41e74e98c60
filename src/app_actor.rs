//! Single-worker measurement queue
//!
//! All hardware work happens in one async task that drains a bounded command
//! queue. Front ends hold a cloneable [`MeasurementHandle`]: submitting to a
//! full queue fails fast with [`DaqError::Busy`], and `abort()` bypasses the
//! queue entirely so it reaches a running batch immediately.

use crate::{
    error::{AppResult, DaqError, PixelFailure, Stage},
    messages::MeasurementCommand,
    orchestrator::{BatchReport, MeasurementOrchestrator, MeasurementRecord, RunRequest, RunState},
};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{info, warn};

/// Actor that owns all measurement work
pub struct MeasurementActor {
    orchestrator: Arc<MeasurementOrchestrator>,
}

impl MeasurementActor {
    pub fn new(orchestrator: Arc<MeasurementOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Runs the actor event loop, processing commands until shutdown
    pub async fn run(self, mut command_rx: mpsc::Receiver<MeasurementCommand>) {
        info!("MeasurementActor started");

        while let Some(command) = command_rx.recv().await {
            match command {
                MeasurementCommand::MeasurePixel {
                    pixel,
                    request,
                    response,
                } => {
                    let result = self.orchestrator.measure_pixel(pixel, &request).await;
                    let _ = response.send(result);
                }

                MeasurementCommand::FullAuto {
                    pixels,
                    request,
                    response,
                } => {
                    let result = self.orchestrator.run_batch(&pixels, &request).await;
                    let _ = response.send(result);
                }

                MeasurementCommand::Shutdown { response } => {
                    info!("Shutdown command received");
                    let _ = response.send(self.orchestrator.release().await);
                    break; // Exit event loop
                }
            }

            if self.orchestrator.abort_flag().is_triggered() {
                if let Some(response) = Self::cancel_pending(&mut command_rx) {
                    info!("Shutdown command received");
                    let _ = response.send(self.orchestrator.release().await);
                    break;
                }
            }
        }

        info!("MeasurementActor shutting down");
    }

    /// Answer requests queued before an abort without running them. A queued
    /// shutdown is handed back to the caller instead of being cancelled.
    fn cancel_pending(
        command_rx: &mut mpsc::Receiver<MeasurementCommand>,
    ) -> Option<oneshot::Sender<AppResult<()>>> {
        let mut shutdown = None;
        while let Ok(command) = command_rx.try_recv() {
            match command {
                MeasurementCommand::MeasurePixel { pixel, response, .. } => {
                    warn!(pixel, "Dropping queued measurement after abort");
                    let _ = response.send(Err(PixelFailure::new(
                        pixel,
                        Stage::Queued,
                        DaqError::Aborted,
                    )));
                }
                MeasurementCommand::FullAuto { response, .. } => {
                    warn!("Dropping queued batch after abort");
                    let _ = response.send(Err(DaqError::Aborted));
                }
                MeasurementCommand::Shutdown { response } => {
                    shutdown = Some(response);
                }
            }
        }
        shutdown
    }
}

/// Cloneable front-end handle to the measurement actor.
#[derive(Clone)]
pub struct MeasurementHandle {
    sender: mpsc::Sender<MeasurementCommand>,
    orchestrator: Arc<MeasurementOrchestrator>,
}

impl MeasurementHandle {
    /// Spawn the actor on the current runtime with a queue of `capacity`.
    pub fn spawn(orchestrator: MeasurementOrchestrator, capacity: usize) -> (Self, JoinHandle<()>) {
        let orchestrator = Arc::new(orchestrator);
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(MeasurementActor::new(orchestrator.clone()).run(receiver));
        (
            Self {
                sender,
                orchestrator,
            },
            task,
        )
    }

    pub async fn measure_pixel(
        &self,
        pixel: u32,
        request: RunRequest,
    ) -> AppResult<MeasurementRecord> {
        let (command, reply) = MeasurementCommand::measure_pixel(pixel, request);
        self.submit(command)?;
        reply
            .await
            .map_err(|_| DaqError::Aborted)?
            .map_err(DaqError::from)
    }

    pub async fn full_auto(&self, pixels: Vec<u32>, request: RunRequest) -> AppResult<BatchReport> {
        let (command, reply) = MeasurementCommand::full_auto(pixels, request);
        self.submit(command)?;
        reply.await.map_err(|_| DaqError::Aborted)?
    }

    /// Cancel the running request and everything queued behind it.
    pub fn abort(&self) {
        self.orchestrator.abort();
    }

    /// Release the station and stop the actor. Waits for queue space.
    pub async fn shutdown(&self) -> AppResult<()> {
        let (command, reply) = MeasurementCommand::shutdown();
        self.sender
            .send(command)
            .await
            .map_err(|_| DaqError::Aborted)?;
        reply.await.map_err(|_| DaqError::Aborted)?
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.orchestrator.subscribe()
    }

    fn submit(&self, command: MeasurementCommand) -> AppResult<()> {
        self.sender.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DaqError::Busy,
            mpsc::error::TrySendError::Closed(_) => DaqError::Aborted,
        })
    }
}
