//! Result persistence with clean feature flag handling.
//!
//! [`CsvReportSink`] writes three artifacts per result into the destination
//! directory:
//!
//! - `IV_Curve_<id>.csv` - `voltage,current` per sample
//! - `PV_Curve_<id>.csv` - `voltage,power` per sample, preceded by `# key: value`
//!   comment lines locating the maximum power point
//! - `Calculated_Values_<id>.txt` - the text report
//!
//! Results without an identifier drop the `_<id>` suffix.
use crate::{
    instrument::capabilities::{PersistedArtifacts, ResultSink},
    measurement::SweepResult,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Artifact paths for `result` under `destination`.
pub fn artifact_paths(result: &SweepResult, destination: &Path) -> PersistedArtifacts {
    let suffix = result
        .identifier()
        .map(|id| format!("_{}", id))
        .unwrap_or_default();
    PersistedArtifacts {
        iv_curve: destination.join(format!("IV_Curve{}.csv", suffix)),
        pv_curve: destination.join(format!("PV_Curve{}.csv", suffix)),
        report: destination.join(format!("Calculated_Values{}.txt", suffix)),
    }
}

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tracing::info;

    #[derive(Debug, Default, Clone)]
    pub struct CsvReportSink;

    impl CsvReportSink {
        pub fn new() -> Self {
            Self
        }

        fn write_iv(result: &SweepResult, path: &Path) -> Result<()> {
            let mut writer = csv::Writer::from_path(path)
                .with_context(|| format!("Failed to create CSV file at {:?}", path))?;
            writer
                .write_record(["voltage", "current"])
                .context("Failed to write CSV header")?;
            for sample in result.samples() {
                writer
                    .write_record(&[sample.voltage.to_string(), sample.current.to_string()])
                    .context("Failed to write I-V sample")?;
            }
            writer.flush().context("Failed to flush CSV writer")?;
            Ok(())
        }

        fn write_pv(result: &SweepResult, path: &Path) -> Result<()> {
            let mut file = File::create(path)
                .with_context(|| format!("Failed to create CSV file at {:?}", path))?;

            let mpp = result.max_power_point();
            let header = [
                ("max_power_index", result.max_power_index().to_string()),
                ("max_power_voltage", mpp.voltage.to_string()),
                ("max_power_current", mpp.current.to_string()),
                ("max_power_watts", result.max_power_watts().to_string()),
            ];
            for (key, value) in header {
                writeln!(file, "# {}: {}", key, value)
                    .context("Failed to write metadata to CSV file")?;
            }

            let mut writer = csv::Writer::from_writer(file);
            writer
                .write_record(["voltage", "power"])
                .context("Failed to write CSV header")?;
            for sample in result.samples() {
                writer
                    .write_record(&[sample.voltage.to_string(), sample.power().to_string()])
                    .context("Failed to write P-V sample")?;
            }
            writer.flush().context("Failed to flush CSV writer")?;
            Ok(())
        }
    }

    #[async_trait]
    impl ResultSink for CsvReportSink {
        async fn persist(
            &mut self,
            result: &SweepResult,
            destination: &Path,
        ) -> Result<PersistedArtifacts> {
            std::fs::create_dir_all(destination).with_context(|| {
                format!("Failed to create output directory at {:?}", destination)
            })?;

            let artifacts = artifact_paths(result, destination);
            Self::write_iv(result, &artifacts.iv_curve)?;
            Self::write_pv(result, &artifacts.pv_curve)?;
            std::fs::write(&artifacts.report, result.report())
                .with_context(|| format!("Failed to write report at {:?}", artifacts.report))?;

            info!(
                "Saved {} samples and report to '{}'.",
                result.samples().len(),
                destination.display()
            );
            Ok(artifacts)
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;
    use crate::error::DaqError;

    #[derive(Debug, Default, Clone)]
    pub struct CsvReportSink;

    impl CsvReportSink {
        pub fn new() -> Self {
            Self
        }
    }

    #[async_trait]
    impl ResultSink for CsvReportSink {
        async fn persist(
            &mut self,
            _result: &SweepResult,
            _destination: &Path,
        ) -> Result<PersistedArtifacts> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()).into())
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::CsvReportSink;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::CsvReportSink;

/// Per-run output directory: `<root>/<name>` or `<root>/run_<YYYYmmdd_HHMMSS>`.
pub fn run_directory(root: &Path, run_name: Option<&str>) -> PathBuf {
    match run_name {
        Some(name) if !name.trim().is_empty() => root.join(name.trim()),
        _ => root.join(format!(
            "run_{}",
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        )),
    }
}

#[cfg(all(test, feature = "storage_csv"))]
mod tests {
    use super::*;
    use crate::data::reducer::reduce;
    use crate::measurement::RawTrace;

    fn sample_result(id: Option<&str>) -> SweepResult {
        let trace = RawTrace::from_interleaved(&[0.0, 2.0, 1.0, 1.8, 2.0, 0.0]).unwrap();
        let result = reduce(&trace, 5.0).unwrap();
        match id {
            Some(id) => result.with_identifier(id),
            None => result,
        }
    }

    #[tokio::test]
    async fn writes_three_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("nested").join("run");
        let mut sink = CsvReportSink::new();

        let artifacts = sink
            .persist(&sample_result(Some("3")), &destination)
            .await
            .unwrap();

        assert!(artifacts.iv_curve.ends_with("IV_Curve_3.csv"));
        assert!(artifacts.pv_curve.ends_with("PV_Curve_3.csv"));
        assert!(artifacts.report.ends_with("Calculated_Values_3.txt"));

        let iv = std::fs::read_to_string(&artifacts.iv_curve).unwrap();
        assert_eq!(iv, "voltage,current\n0,2\n1,1.8\n2,0\n");

        let pv = std::fs::read_to_string(&artifacts.pv_curve).unwrap();
        assert!(pv.starts_with("# max_power_index: 1\n"));
        assert!(pv.contains("voltage,power\n0,0\n1,1.8\n2,0\n"));

        let report = std::fs::read_to_string(&artifacts.report).unwrap();
        assert_eq!(report, sample_result(None).report());
    }

    #[test]
    fn unnamed_results_drop_the_suffix() {
        let paths = artifact_paths(&sample_result(None), Path::new("out"));
        assert_eq!(paths.iv_curve, Path::new("out/IV_Curve.csv"));
        assert_eq!(paths.report, Path::new("out/Calculated_Values.txt"));
    }

    #[test]
    fn run_directory_uses_name_or_timestamp() {
        assert_eq!(
            run_directory(Path::new("data"), Some("batch_a")),
            Path::new("data/batch_a")
        );
        let stamped = run_directory(Path::new("data"), None);
        let name = stamped.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("run_"));
        assert_eq!(name.len(), "run_20260101_120000".len());
    }
}
