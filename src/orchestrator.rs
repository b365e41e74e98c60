//! Measurement orchestration for one pixel and for whole substrates.
//!
//! The orchestrator sequences positioning, relay selection, sweep
//! configuration, acquisition, reduction and persistence against a
//! [`Station`]. The station sits behind a `tokio::sync::Mutex` and every entry
//! point uses `try_lock`, so an overlapping request is rejected with
//! [`DaqError::Busy`] instead of queueing behind a running batch.
//!
//! # Run state
//!
//! ```text
//! Idle -> Configuring -> Sweeping -> Reducing -> Persisting -> Idle
//!   any non-idle state -> Aborting -> Idle
//! ```
//!
//! `Configuring` is entered as soon as a request holds the station, so it
//! also covers opening connections, positioning and relay selection.
//!
//! Observers follow the state through [`MeasurementOrchestrator::subscribe`].

use crate::config::{FailurePolicy, PixelDefinition, Settings};
use crate::data::reducer::reduce;
use crate::error::{AppResult, DaqError, PixelFailure, Stage};
use crate::error_recovery::{recover_with_retry, RetryPolicy};
use crate::instrument::PersistedArtifacts;
use crate::measurement::{SweepConfig, SweepResult};
use crate::station::Station;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Observable phase of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Configuring,
    Sweeping,
    Reducing,
    Persisting,
    Aborting,
}

/// Out-of-band cancellation, checked between pixels.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Parameters shared by every pixel of a request.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub sweep: SweepConfig,
    pub input_power_watts: f64,
    /// Directory the artifacts are written into
    pub destination: PathBuf,
}

impl RunRequest {
    /// Request using the configured default sweep and input power.
    pub fn from_settings(settings: &Settings, destination: PathBuf) -> Self {
        Self {
            sweep: settings.sweep,
            input_power_watts: settings.run.input_power_watts,
            destination,
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        self.sweep.validate()?;
        if !self.input_power_watts.is_finite() {
            return Err(DaqError::Configuration(
                "input power must be a finite number".to_string(),
            ));
        }
        Ok(())
    }
}

/// A persisted pixel measurement.
#[derive(Debug, Clone)]
pub struct MeasurementRecord {
    pub pixel: u32,
    pub result: SweepResult,
    pub artifacts: PersistedArtifacts,
}

/// Outcome of a batch. Partial batches are reported here, not as errors.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub completed: Vec<MeasurementRecord>,
    pub failed: Vec<PixelFailure>,
    /// Pixels never started, in request order
    pub skipped: Vec<u32>,
    pub aborted: bool,
    /// Pixel whose failure stopped the batch
    pub halted_at: Option<u32>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty() && !self.aborted
    }

    pub fn completed_pixels(&self) -> Vec<u32> {
        self.completed.iter().map(|r| r.pixel).collect()
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Upper bound on one pixel, independent of the instrument's sweep timeout
    pub pixel_timeout: Duration,
    pub on_pixel_error: FailurePolicy,
    /// Instrument reset attempts after a rejected command or timeout
    pub retry: RetryPolicy,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            pixel_timeout: Duration::from_secs(60),
            on_pixel_error: FailurePolicy::Continue,
            retry: RetryPolicy::default(),
        }
    }
}

impl OrchestratorOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            pixel_timeout: settings.run.pixel_timeout,
            on_pixel_error: settings.run.on_pixel_error,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct MeasurementOrchestrator {
    station: Mutex<Station>,
    pixels: Vec<PixelDefinition>,
    state: watch::Sender<RunState>,
    abort: AbortFlag,
    options: OrchestratorOptions,
}

impl MeasurementOrchestrator {
    pub fn new(
        station: Station,
        pixels: Vec<PixelDefinition>,
        options: OrchestratorOptions,
    ) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            station: Mutex::new(station),
            pixels,
            state,
            abort: AbortFlag::new(),
            options,
        }
    }

    pub fn from_settings(settings: &Settings, station: Station) -> Self {
        Self::new(
            station,
            settings.pixels.clone(),
            OrchestratorOptions::from_settings(settings),
        )
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn abort_flag(&self) -> AbortFlag {
        self.abort.clone()
    }

    pub fn pixel_ids(&self) -> Vec<u32> {
        self.pixels.iter().map(|p| p.id).collect()
    }

    /// Request cancellation. A running request finishes its current pixel,
    /// then homes the probe and releases the station.
    pub fn abort(&self) {
        self.abort.trigger();
        self.state.send_if_modified(|state| {
            if *state == RunState::Idle {
                false
            } else {
                *state = RunState::Aborting;
                true
            }
        });
        warn!("Abort requested");
    }

    /// Measure one pixel. The probe returns home on every exit path.
    pub async fn measure_pixel(
        &self,
        pixel_id: u32,
        request: &RunRequest,
    ) -> Result<MeasurementRecord, PixelFailure> {
        let queued = |error: DaqError| PixelFailure::new(pixel_id, Stage::Queued, error);
        let pixel = self.pixel(pixel_id).map_err(queued)?.clone();
        request.validate().map_err(queued)?;
        let mut station = self.station.try_lock().map_err(|_| queued(DaqError::Busy))?;

        self.abort.clear();
        self.state.send_replace(RunState::Configuring);
        if let Err(e) = station.open().await {
            self.state.send_replace(RunState::Idle);
            return Err(queued(e));
        }
        let outcome = self.run_pixel(&mut station, &pixel, request).await;
        if self.abort.is_triggered() {
            warn!(pixel = pixel_id, "Measurement aborted");
            self.shut_down(&mut station).await;
        }
        self.state.send_replace(RunState::Idle);
        outcome
    }

    /// Measure `pixel_ids` in order with one shared request.
    ///
    /// # Errors
    /// Request validation, unknown pixels, `Busy` and station connection
    /// failures are returned before any pixel starts. Everything after that
    /// is reported in the [`BatchReport`].
    pub async fn run_batch(
        &self,
        pixel_ids: &[u32],
        request: &RunRequest,
    ) -> AppResult<BatchReport> {
        request.validate()?;
        let pixels = pixel_ids
            .iter()
            .map(|&id| self.pixel(id).cloned())
            .collect::<AppResult<Vec<_>>>()?;
        let mut station = self.station.try_lock().map_err(|_| DaqError::Busy)?;

        self.abort.clear();
        self.state.send_replace(RunState::Configuring);
        if let Err(e) = station.open().await {
            self.state.send_replace(RunState::Idle);
            return Err(e);
        }
        info!(
            pixels = pixels.len(),
            destination = %request.destination.display(),
            "Batch started"
        );

        let mut report = BatchReport::default();
        for (position, pixel) in pixels.iter().enumerate() {
            if self.abort.is_triggered() {
                report.aborted = true;
                report.skipped = pixels[position..].iter().map(|p| p.id).collect();
                break;
            }

            match self.run_pixel(&mut station, pixel, request).await {
                Ok(record) => report.completed.push(record),
                Err(failure) => {
                    error!(pixel = failure.pixel, stage = %failure.stage, "{}", failure.error);
                    let halt = self.should_halt(&mut station, &failure).await;
                    report.failed.push(failure);
                    if halt {
                        report.halted_at = Some(pixel.id);
                        report.skipped = pixels[position + 1..].iter().map(|p| p.id).collect();
                        break;
                    }
                }
            }
        }
        if self.abort.is_triggered() {
            report.aborted = true;
        }

        if report.aborted {
            warn!(
                completed = report.completed.len(),
                skipped = report.skipped.len(),
                "Batch aborted"
            );
            self.shut_down(&mut station).await;
        }
        self.state.send_replace(RunState::Idle);

        info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Batch finished"
        );
        Ok(report)
    }

    /// Home the probe and close every connection. Waits for a running
    /// request to finish.
    pub async fn release(&self) -> AppResult<()> {
        let mut station = self.station.lock().await;
        if !station.is_open() {
            return Ok(());
        }
        if let Err(e) = self.go_home(&mut station).await {
            warn!("Return home before release failed: {}", e);
        }
        station.release().await
    }

    fn pixel(&self, id: u32) -> AppResult<&PixelDefinition> {
        self.pixels
            .iter()
            .find(|p| p.id == id)
            .ok_or(DaqError::UnknownPixel(id))
    }

    fn enter(&self, state: RunState) {
        // an abort keeps the state at Aborting until the request unwinds
        if !self.abort.is_triggered() {
            self.state.send_replace(state);
        }
    }

    /// Home the probe and release the station after an abort.
    async fn shut_down(&self, station: &mut Station) {
        self.state.send_replace(RunState::Aborting);
        if let Err(e) = self.go_home(station).await {
            warn!("Return home after abort failed: {}", e);
        }
        if let Err(e) = station.release().await {
            warn!("Station release after abort failed: {}", e);
        }
    }

    async fn run_pixel(
        &self,
        station: &mut Station,
        pixel: &PixelDefinition,
        request: &RunRequest,
    ) -> Result<MeasurementRecord, PixelFailure> {
        info!(pixel = pixel.id, x_mm = pixel.x_mm, y_mm = pixel.y_mm, "Measuring pixel");

        let mut stage = Stage::Positioning;
        let bounded = timeout(
            self.options.pixel_timeout,
            self.pixel_steps(station, pixel, request, &mut stage),
        )
        .await;
        let outcome = match bounded {
            Ok(outcome) => outcome,
            Err(_) => Err(PixelFailure::new(
                pixel.id,
                stage,
                DaqError::InstrumentTimeout(self.options.pixel_timeout),
            )),
        };

        let homed = self.go_home(station).await;
        match (outcome, homed) {
            (Ok(record), Ok(())) => Ok(record),
            (Ok(record), Err(e)) => {
                Err(PixelFailure::new(pixel.id, Stage::Homing, e).with_result(record.result))
            }
            (Err(failure), Ok(())) => Err(failure),
            (Err(failure), Err(e)) => {
                warn!(pixel = pixel.id, "Return home failed after pixel failure: {}", e);
                Err(failure)
            }
        }
    }

    /// Return the probe to the origin. A stalled stage is bounded by the
    /// pixel timeout so it cannot hold the station forever.
    async fn go_home(&self, station: &mut Station) -> AppResult<()> {
        let limit = self.options.pixel_timeout;
        match timeout(limit, station.positioner.return_home()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DaqError::Connection(format!("positioner: {:#}", e))),
            Err(_) => Err(DaqError::Connection(format!(
                "positioner did not return home within {:?}",
                limit
            ))),
        }
    }

    async fn pixel_steps(
        &self,
        station: &mut Station,
        pixel: &PixelDefinition,
        request: &RunRequest,
        stage: &mut Stage,
    ) -> Result<MeasurementRecord, PixelFailure> {
        let fail = |stage: Stage, error: DaqError| PixelFailure::new(pixel.id, stage, error);

        // positioning and relay switching count as configuration
        self.enter(RunState::Configuring);
        *stage = Stage::Positioning;
        station
            .positioner
            .move_to(pixel.x_mm, pixel.y_mm)
            .await
            .map_err(|e| {
                fail(
                    Stage::Positioning,
                    DaqError::Connection(format!("positioner: {:#}", e)),
                )
            })?;

        *stage = Stage::Selecting;
        station.selector.select(pixel).await.map_err(|e| {
            fail(
                Stage::Selecting,
                DaqError::Connection(format!("relay board: {:#}", e)),
            )
        })?;

        *stage = Stage::Configuring;
        station
            .instrument
            .configure(&request.sweep)
            .await
            .map_err(|e| fail(Stage::Configuring, e))?;

        *stage = Stage::Sweeping;
        self.enter(RunState::Sweeping);
        let trace = station
            .instrument
            .run_and_fetch(&request.sweep)
            .await
            .map_err(|e| fail(Stage::Sweeping, e))?;

        *stage = Stage::Reducing;
        self.enter(RunState::Reducing);
        let result = reduce(&trace, request.input_power_watts)
            .map_err(|e| fail(Stage::Reducing, e))?
            .with_identifier(pixel.id.to_string());

        *stage = Stage::Persisting;
        self.enter(RunState::Persisting);
        let artifacts = match station.sink.persist(&result, &request.destination).await {
            Ok(artifacts) => artifacts,
            Err(e) => return Err(fail(Stage::Persisting, sink_error(e)).with_result(result)),
        };

        info!(
            pixel = pixel.id,
            pmax_w = result.max_power_watts(),
            isc_a = result.short_circuit_current(),
            voc_v = result.open_circuit_voltage(),
            efficiency = result.efficiency_percent(),
            "Pixel measured"
        );
        Ok(MeasurementRecord {
            pixel: pixel.id,
            result,
            artifacts,
        })
    }

    /// Apply the batch failure policy, resetting the instrument where it
    /// allows the batch to continue.
    async fn should_halt(&self, station: &mut Station, failure: &PixelFailure) -> bool {
        let abort_on_error = self.options.on_pixel_error == FailurePolicy::Abort;
        match &failure.error {
            DaqError::Connection(_) => true,
            DaqError::Instrument(_) => {
                if abort_on_error {
                    return true;
                }
                match recover_with_retry(&mut station.instrument, &self.options.retry).await {
                    Ok(()) => false,
                    Err(e) => {
                        error!(pixel = failure.pixel, "Instrument reset failed: {}", e);
                        true
                    }
                }
            }
            DaqError::InstrumentTimeout(_) => {
                if abort_on_error {
                    return true;
                }
                let recovered =
                    recover_with_retry(&mut station.instrument, &self.options.retry).await;
                if let Err(e) = recovered {
                    warn!(pixel = failure.pixel, "Instrument reset after timeout failed: {}", e);
                }
                false
            }
            _ => abort_on_error,
        }
    }
}

/// Sink errors are I/O failures unless the sink already raised a `DaqError`.
fn sink_error(error: anyhow::Error) -> DaqError {
    match error.downcast::<DaqError>() {
        Ok(daq) => daq,
        Err(other) => DaqError::Io(std::io::Error::other(format!("{:#}", other))),
    }
}
