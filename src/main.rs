//! # pixel_iv_daq
//!
//! Command-line front end for the pixel I-V station.
//!
//! ```bash
//! # Validate and print the effective configuration
//! pixel_iv_daq check-config
//!
//! # Measure pixel 3 on simulated hardware
//! pixel_iv_daq --mock measure --pixel 3
//!
//! # Measure every configured pixel with a custom sweep
//! pixel_iv_daq full-auto --start -0.2 --stop 0.8 --steps 51 --input-power 0.1
//! ```
//!
//! Ctrl-C aborts a running batch: the current pixel finishes, the probe
//! returns home and every connection is closed before the program exits.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use pixel_iv_daq::{
    config::Settings,
    data::storage::run_directory,
    logging,
    orchestrator::{BatchReport, MeasurementRecord},
    MeasurementHandle, MeasurementOrchestrator, RunRequest, Station,
};
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// Automated I-V characterization of solar-cell pixels
#[derive(Parser)]
#[command(name = "pixel_iv_daq")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (missing files fall back to built-in defaults)
    #[arg(short, long, value_name = "FILE", default_value = "config/default.toml")]
    config: PathBuf,

    /// Use simulated hardware regardless of the configured backends
    #[arg(long, global = true)]
    mock: bool,

    /// Print results as JSON instead of text reports
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    sweep: SweepArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Per-run overrides of the configured sweep.
#[derive(Args, Debug, Default)]
struct SweepArgs {
    /// Sweep start voltage (V)
    #[arg(long, global = true, allow_hyphen_values = true)]
    start: Option<f64>,

    /// Sweep stop voltage (V)
    #[arg(long, global = true, allow_hyphen_values = true)]
    stop: Option<f64>,

    /// Number of sweep points
    #[arg(long, global = true)]
    steps: Option<u32>,

    /// Dwell per sweep point (s)
    #[arg(long, global = true)]
    step_delay: Option<f64>,

    /// Optical input power used for the efficiency (W)
    #[arg(long, global = true)]
    input_power: Option<f64>,

    /// Output sub-directory name (defaults to run_<timestamp>)
    #[arg(long, global = true)]
    run_name: Option<String>,
}

impl SweepArgs {
    fn apply(&self, request: &mut RunRequest) {
        if let Some(start) = self.start {
            request.sweep.start_voltage = start;
        }
        if let Some(stop) = self.stop {
            request.sweep.stop_voltage = stop;
        }
        if let Some(steps) = self.steps {
            request.sweep.step_count = steps;
        }
        if let Some(delay) = self.step_delay {
            request.sweep.step_delay_secs = delay;
        }
        if let Some(power) = self.input_power {
            request.input_power_watts = power;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Measure a single pixel
    Measure {
        /// Pixel number from the pixel map
        #[arg(short, long)]
        pixel: u32,
    },

    /// Measure a list of pixels in order (all configured pixels by default)
    FullAuto {
        /// Comma-separated pixel numbers, e.g. 1,2,5
        #[arg(short, long, value_delimiter = ',')]
        pixels: Vec<u32>,
    },

    /// Validate the configuration and print the effective settings
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;
    logging::init(&settings.application.log_level)?;

    if let Commands::CheckConfig = cli.command {
        let rendered = toml::to_string_pretty(&settings).context("Failed to render settings")?;
        println!("{}", rendered);
        info!(pixels = settings.pixels.len(), "Configuration is valid");
        return Ok(());
    }

    let destination = run_directory(
        &settings.application.output_dir,
        cli.sweep.run_name.as_deref(),
    );
    let mut request = RunRequest::from_settings(&settings, destination);
    cli.sweep.apply(&mut request);
    request.validate()?;

    let station = Station::from_settings(&settings, cli.mock);
    let orchestrator = MeasurementOrchestrator::from_settings(&settings, station);
    let (handle, actor) = MeasurementHandle::spawn(orchestrator, settings.run.queue_capacity);

    let ctrl_c_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, aborting");
            ctrl_c_handle.abort();
        }
    });

    let mut states = handle.subscribe();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            debug!(state = ?*states.borrow(), "Run state changed");
        }
    });

    let outcome = match cli.command {
        Commands::Measure { pixel } => handle
            .measure_pixel(pixel, request)
            .await
            .map(|record| print_record(&record, cli.json))
            .map_err(anyhow::Error::from),
        Commands::FullAuto { pixels } => {
            let ids = if pixels.is_empty() {
                settings.pixel_ids()
            } else {
                pixels
            };
            match handle.full_auto(ids, request).await {
                Ok(report) => {
                    print_batch(&report, cli.json);
                    if report.is_complete() {
                        Ok(())
                    } else {
                        Err(anyhow::anyhow!(
                            "batch incomplete: {} failed, {} skipped",
                            report.failed.len(),
                            report.skipped.len()
                        ))
                    }
                }
                Err(e) => Err(e.into()),
            }
        }
        Commands::CheckConfig => Ok(()),
    };

    if let Err(e) = handle.shutdown().await {
        error!("Shutdown failed: {}", e);
    }
    actor.await.context("Measurement actor panicked")?;

    if let Err(e) = outcome {
        bail!("{:#}", e);
    }
    Ok(())
}

fn print_record(record: &MeasurementRecord, json: bool) {
    if json {
        let value = serde_json::json!({
            "pixel": record.pixel,
            "result": record.result,
            "artifacts": {
                "iv_curve": record.artifacts.iv_curve,
                "pv_curve": record.artifacts.pv_curve,
                "report": record.artifacts.report,
            },
        });
        println!("{}", value);
    } else {
        println!("Pixel {}", record.pixel);
        print!("{}", record.result.report());
        println!("Saved to {}", record.artifacts.report.display());
    }
}

fn print_batch(report: &BatchReport, json: bool) {
    for record in &report.completed {
        print_record(record, json);
    }
    for failure in &report.failed {
        eprintln!("{}", failure);
    }
    if report.aborted {
        eprintln!("Aborted; skipped pixels: {:?}", report.skipped);
    } else if let Some(pixel) = report.halted_at {
        eprintln!("Halted at pixel {}; skipped pixels: {:?}", pixel, report.skipped);
    }
}
