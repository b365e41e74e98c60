//! End-to-end orchestrator runs against simulated station hardware.

use anyhow::Result;
use async_trait::async_trait;
use pixel_iv_daq::{
    config::{FailurePolicy, Settings},
    data::storage::CsvReportSink,
    error::{DaqError, Stage},
    hardware::mock::{MockPositioner, MockRelay, MockSmu},
    instrument::{InstrumentSession, PersistedArtifacts, Positioner, ResultSink},
    measurement::{SweepConfig, SweepResult},
    orchestrator::{AbortFlag, MeasurementOrchestrator, OrchestratorOptions, RunRequest, RunState},
    station::Station,
};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tempfile::TempDir;

/// Sink that triggers an abort once a given number of results is on disk.
struct AbortAfter {
    inner: CsvReportSink,
    remaining: usize,
    flag: Arc<OnceLock<AbortFlag>>,
}

#[async_trait]
impl ResultSink for AbortAfter {
    async fn persist(
        &mut self,
        result: &SweepResult,
        destination: &Path,
    ) -> Result<PersistedArtifacts> {
        let artifacts = self.inner.persist(result, destination).await?;
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            if let Some(flag) = self.flag.get() {
                flag.trigger();
            }
        }
        Ok(artifacts)
    }
}

struct Bench {
    smu: MockSmu,
    stage: MockPositioner,
    relay: MockRelay,
    dir: TempDir,
}

impl Bench {
    fn new() -> Self {
        Self {
            smu: MockSmu::new().with_time_scale(0.0),
            stage: MockPositioner::new(),
            relay: MockRelay::new(),
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn station(&self, sink: Box<dyn ResultSink>) -> Station {
        Station::new(
            Box::new(self.stage.clone()),
            Box::new(self.relay.clone()),
            InstrumentSession::new(Box::new(self.smu.clone()))
                .with_sweep_timeout(Duration::from_millis(200))
                .with_poll_interval(Duration::from_millis(2)),
            sink,
        )
    }

    fn request(&self, steps: u32) -> RunRequest {
        RunRequest {
            sweep: SweepConfig {
                start_voltage: 0.0,
                stop_voltage: 0.8,
                step_count: steps,
                step_delay_secs: 0.0,
                current_limit_amps: 0.1,
                voltage_range_volts: 2.0,
            },
            input_power_watts: 0.1,
            destination: self.dir.path().join("run"),
        }
    }

    fn reports_on_disk(&self) -> usize {
        match std::fs::read_dir(self.dir.path().join("run")) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with("Calculated_Values"))
                .count(),
            Err(_) => 0,
        }
    }
}

#[tokio::test]
async fn full_batch_measures_every_pixel_in_order() {
    let bench = Bench::new();
    let settings = Settings::default();
    let orchestrator = MeasurementOrchestrator::from_settings(
        &settings,
        bench.station(Box::new(CsvReportSink::new())),
    );

    let report = orchestrator
        .run_batch(&settings.pixel_ids(), &bench.request(21))
        .await
        .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.completed_pixels(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(
        bench.relay.sent(),
        vec!["r", "g", "b", "f", "y", "u", "i", "k"]
    );
    assert_eq!(bench.reports_on_disk(), 8);

    // diode model: positive Isc, Voc between the sweep endpoints
    let first = &report.completed[0].result;
    assert!(first.short_circuit_current() > 0.0);
    assert!(first.open_circuit_voltage() > 0.5 && first.open_circuit_voltage() <= 0.8);
    assert!(first.efficiency_percent() > 0.0);

    // every pixel visit is followed by a return home
    let moves = bench.stage.moves();
    assert_eq!(moves.len(), 16);
    assert!(moves.iter().skip(1).step_by(2).all(|&p| p == (0.0, 0.0)));
    assert_eq!(orchestrator.state(), RunState::Idle);
}

#[tokio::test]
async fn abort_after_third_pixel_releases_the_station() {
    let bench = Bench::new();
    let flag = Arc::new(OnceLock::new());
    let sink = AbortAfter {
        inner: CsvReportSink::new(),
        remaining: 3,
        flag: flag.clone(),
    };
    let orchestrator =
        MeasurementOrchestrator::from_settings(&Settings::default(), bench.station(Box::new(sink)));
    flag.set(orchestrator.abort_flag()).unwrap();

    let report = orchestrator
        .run_batch(&[1, 2, 3, 4, 5, 6, 7, 8], &bench.request(11))
        .await
        .unwrap();

    assert!(report.aborted);
    assert_eq!(report.completed_pixels(), vec![1, 2, 3]);
    assert_eq!(report.skipped, vec![4, 5, 6, 7, 8]);
    assert!(report.failed.is_empty());

    assert_eq!(bench.smu.sweeps_started(), 3);
    assert_eq!(bench.relay.sent(), vec!["r", "g", "b"]);
    assert_eq!(bench.stage.position(), (0.0, 0.0));
    assert!(!bench.stage.is_connected());
    assert!(!bench.relay.is_open());
    assert!(!bench.smu.is_open());
    assert_eq!(bench.reports_on_disk(), 3);
    assert_eq!(orchestrator.state(), RunState::Idle);
}

#[tokio::test]
async fn short_readout_fails_before_reduction() {
    let bench = Bench::new();
    bench.smu.drop_trace_points(1);
    let orchestrator = MeasurementOrchestrator::from_settings(
        &Settings::default(),
        bench.station(Box::new(CsvReportSink::new())),
    );

    let failure = orchestrator
        .measure_pixel(1, &bench.request(5))
        .await
        .unwrap_err();

    assert_eq!(failure.pixel, 1);
    assert_eq!(failure.stage, Stage::Sweeping);
    assert!(matches!(failure.error, DaqError::Instrument(ref m) if m.contains("got 8")));
    assert!(failure.result.is_none());
    assert_eq!(bench.reports_on_disk(), 0);
}

#[tokio::test]
async fn timed_out_sweep_is_skipped_under_continue_policy() {
    let bench = Bench::new();
    bench.smu.hang_sweeps(true);
    let orchestrator = MeasurementOrchestrator::new(
        bench.station(Box::new(CsvReportSink::new())),
        Settings::default().pixels,
        OrchestratorOptions {
            on_pixel_error: FailurePolicy::Continue,
            ..OrchestratorOptions::default()
        },
    );

    let report = orchestrator
        .run_batch(&[1, 2], &bench.request(5))
        .await
        .unwrap();

    assert_eq!(report.failed.len(), 2);
    assert!(report
        .failed
        .iter()
        .all(|f| matches!(f.error, DaqError::InstrumentTimeout(_))));
    assert!(report.halted_at.is_none());
    // reset after each timeout
    let resets = bench.smu.call_log().iter().filter(|c| *c == "*RST").count();
    assert!(resets >= 4);
}

#[tokio::test]
async fn failed_persist_keeps_the_computed_result() {
    struct FailingSink;

    #[async_trait]
    impl ResultSink for FailingSink {
        async fn persist(&mut self, _: &SweepResult, _: &Path) -> Result<PersistedArtifacts> {
            Err(anyhow::anyhow!("disk full"))
        }
    }

    let bench = Bench::new();
    let orchestrator = MeasurementOrchestrator::from_settings(
        &Settings::default(),
        bench.station(Box::new(FailingSink)),
    );

    let failure = orchestrator
        .measure_pixel(6, &bench.request(9))
        .await
        .unwrap_err();

    assert_eq!(failure.stage, Stage::Persisting);
    assert!(matches!(failure.error, DaqError::Io(_)));
    let result = failure.result.expect("result kept for retry");
    assert_eq!(result.identifier(), Some("6"));
    assert_eq!(result.samples().len(), 9);
}

#[tokio::test]
async fn unknown_pixel_in_batch_is_rejected_before_any_motion() {
    let bench = Bench::new();
    let orchestrator = MeasurementOrchestrator::from_settings(
        &Settings::default(),
        bench.station(Box::new(CsvReportSink::new())),
    );

    let err = orchestrator
        .run_batch(&[1, 99], &bench.request(5))
        .await
        .unwrap_err();

    assert!(matches!(err, DaqError::UnknownPixel(99)));
    assert!(bench.stage.moves().is_empty());
}

#[tokio::test]
async fn release_closes_an_open_station() {
    let bench = Bench::new();
    let orchestrator = MeasurementOrchestrator::from_settings(
        &Settings::default(),
        bench.station(Box::new(CsvReportSink::new())),
    );
    orchestrator.measure_pixel(2, &bench.request(5)).await.unwrap();
    assert!(bench.smu.is_open());

    orchestrator.release().await.unwrap();
    assert!(!bench.smu.is_open());
    assert!(!bench.stage.is_connected());
    // releasing twice is harmless
    orchestrator.release().await.unwrap();
}
