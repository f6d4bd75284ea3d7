//! # Result Recording
//!
//! Accumulates per-point outcomes into the run artifacts:
//!
//! - `result_summary.csv`: one row per measured point with a fixed column
//!   schema (result, test name, power level, iteration, direction, targets,
//!   actuals, band bounds, dataset filename).
//! - One dataset CSV per (test, power level, iteration): every captured
//!   sample row with its scratch-channel annotations, for later plotting.
//! - `run.json`: a small sidecar with the configuration name, timestamps,
//!   totals, and the overall verdict.
//!
//! The summary is append-only; a [`TestPointResult`] is immutable once
//! recorded.

use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;

use crate::band::Band;
use crate::instrument::{channels, ChannelValue, Dataset};
use crate::sweep::SweepDirection;

/// Errors writing result artifacts. Fatal: a run whose evidence cannot be
/// recorded is not a certification.
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV serialization failure.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// JSON sidecar serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One measurement tuple captured for a setpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Seconds since the run clock origin.
    pub elapsed: f64,
    /// Measured independent-variable value.
    pub independent: f64,
    /// Measured dependent-variable value.
    pub dependent: f64,
}

/// Pass/fail outcome of one measured point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointOutcome {
    /// The measured response fell inside the acceptance band.
    Pass,
    /// The measured response fell outside the band, or could not be read.
    Fail,
}

/// Why a point failed.
#[derive(Debug, Clone, PartialEq)]
pub enum FailReason {
    /// The response fell outside the acceptance band.
    OutOfBand,
    /// A required channel was missing from the sample.
    NoData {
        /// The absent channel.
        channel: String,
    },
    /// Hysteresis check: power rose before the return delay elapsed.
    EarlyRise,
    /// Hysteresis check: power deviated from the expected return ramp.
    RampDeviation,
}

impl FailReason {
    /// Summary-row text for this reason.
    pub fn as_str(&self) -> String {
        match self {
            FailReason::OutOfBand => "out of band".to_string(),
            FailReason::NoData { channel } => format!("no data ({})", channel),
            FailReason::EarlyRise => "power rose before return delay".to_string(),
            FailReason::RampDeviation => "return ramp outside accuracy".to_string(),
        }
    }
}

/// One scored point: the commanded setpoint, its band, the measurement (if
/// any), and the outcome. Immutable once recorded.
#[derive(Debug, Clone)]
pub struct TestPointResult {
    /// Commanded independent-variable value.
    pub setpoint: f64,
    /// Target and acceptance bounds at the measured point.
    pub band: Band,
    /// The measurement, absent when the channel was missing.
    pub sample: Option<Sample>,
    /// Pass or fail.
    pub outcome: PointOutcome,
    /// Failure reason, when failed.
    pub reason: Option<FailReason>,
}

impl TestPointResult {
    /// Whether this point passed.
    pub fn passed(&self) -> bool {
        self.outcome == PointOutcome::Pass
    }
}

/// Identity of one sweep: which curve variant, at which power level, which
/// iteration, in which direction.
#[derive(Debug, Clone)]
pub struct RunId {
    /// Test name from the configuration.
    pub test_name: String,
    /// Power level as a fraction of rated.
    pub power_level: f64,
    /// 1-based iteration number.
    pub iteration: usize,
    /// Sweep direction.
    pub direction: SweepDirection,
}

impl RunId {
    /// Dataset filename stem: `label_power_direction_iteration`.
    pub fn file_stem(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.test_name,
            (self.power_level * 100.0).round() as i64,
            self.direction.label(),
            self.iteration
        )
    }
}

/// One completed sweep: its identity, dataset filename, and ordered points.
#[derive(Debug, Clone)]
pub struct TestRun {
    /// Sweep identity.
    pub id: RunId,
    /// Dataset file written for this sweep.
    pub dataset_file: String,
    /// Point results in sweep order.
    pub points: Vec<TestPointResult>,
}

impl TestRun {
    /// Whether every point passed.
    pub fn passed(&self) -> bool {
        self.points.iter().all(|p| p.passed())
    }
}

/// Totals for a finished run, serialized into the JSON sidecar.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Configuration name.
    pub config_name: String,
    /// Run start time.
    pub started: DateTime<Utc>,
    /// Run finish time.
    pub finished: DateTime<Utc>,
    /// Number of sweeps executed.
    pub sweeps: usize,
    /// Number of points scored.
    pub points: usize,
    /// Number of failed points.
    pub failures: usize,
    /// Overall verdict: `"Pass"` or `"Fail"`.
    pub verdict: String,
}

/// Accumulates sweep results into the run artifacts.
pub struct ResultRecorder {
    out_dir: PathBuf,
    config_name: String,
    summary: csv::Writer<File>,
    started: DateTime<Utc>,
    sweeps: usize,
    points: usize,
    failures: usize,
}

/// Fixed column schema of `result_summary.csv`.
pub const SUMMARY_COLUMNS: [&str; 13] = [
    "Result",
    "Test Name",
    "Power Level",
    "Iteration",
    "Direction",
    "X Target",
    "X Actual",
    "Y Target",
    "Y Actual",
    "Y Min",
    "Y Max",
    "Reason",
    "Dataset File",
];

impl ResultRecorder {
    /// Create the output directory, the summary file, and its header row.
    pub fn create(out_dir: &Path, config_name: &str) -> Result<Self, RecorderError> {
        std::fs::create_dir_all(out_dir)?;
        let summary_path = out_dir.join("result_summary.csv");
        let mut summary = csv::Writer::from_path(&summary_path)?;
        summary.write_record(SUMMARY_COLUMNS)?;
        summary.flush()?;
        info!("result summary: {}", summary_path.display());
        Ok(Self {
            out_dir: out_dir.to_path_buf(),
            config_name: config_name.to_string(),
            summary,
            started: Utc::now(),
            sweeps: 0,
            points: 0,
            failures: 0,
        })
    }

    /// Where artifacts are written.
    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Append one summary row per point of a completed sweep.
    pub fn record_run(&mut self, run: &TestRun) -> Result<(), RecorderError> {
        for point in &run.points {
            let (x_actual, y_actual) = match &point.sample {
                Some(s) => (format!("{:.3}", s.independent), format!("{:.3}", s.dependent)),
                None => ("No Data".to_string(), "No Data".to_string()),
            };
            let result = match point.outcome {
                PointOutcome::Pass => "Pass",
                PointOutcome::Fail => "Fail",
            };
            let reason = point
                .reason
                .as_ref()
                .map(|r| r.as_str())
                .unwrap_or_default();
            self.summary.write_record(&[
                result.to_string(),
                run.id.test_name.clone(),
                format!("{}", run.id.power_level * 100.0),
                run.id.iteration.to_string(),
                run.id.direction.label().to_string(),
                format!("{:.3}", point.setpoint),
                x_actual,
                format!("{:.3}", point.band.target),
                y_actual,
                format!("{:.1}", point.band.lower),
                format!("{:.1}", point.band.upper),
                reason,
                run.dataset_file.clone(),
            ])?;
            self.points += 1;
            if !point.passed() {
                self.failures += 1;
            }
        }
        self.summary.flush()?;
        self.sweeps += 1;
        Ok(())
    }

    /// Write one captured dataset to `filename` in the output directory.
    /// Rows carry the elapsed time plus every channel, with scratch
    /// annotations present only on the rows they were set for.
    pub fn write_dataset(
        &mut self,
        filename: &str,
        dataset: &Dataset,
    ) -> Result<PathBuf, RecorderError> {
        let path = self.out_dir.join(filename);
        let mut writer = csv::Writer::from_path(&path)?;
        let columns = dataset.columns();
        let mut header = vec![channels::TIME.to_string()];
        header.extend(columns.iter().cloned());
        writer.write_record(&header)?;
        for row in &dataset.rows {
            let mut record = vec![format!("{:.3}", row.elapsed)];
            for column in &columns {
                record.push(match row.values.get(column) {
                    Some(ChannelValue::Number(n)) => format!("{}", n),
                    Some(ChannelValue::Text(s)) => s.clone(),
                    None => String::new(),
                });
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;
        info!("saved dataset {}", path.display());
        Ok(path)
    }

    /// Finish the run: write the JSON sidecar and return the totals.
    pub fn finish(mut self) -> Result<RunReport, RecorderError> {
        self.summary.flush()?;
        let report = RunReport {
            config_name: self.config_name.clone(),
            started: self.started,
            finished: Utc::now(),
            sweeps: self.sweeps,
            points: self.points,
            failures: self.failures,
            verdict: if self.failures == 0 { "Pass" } else { "Fail" }.to_string(),
        };
        let sidecar = self.out_dir.join("run.json");
        std::fs::write(&sidecar, serde_json::to_string_pretty(&report)?)?;
        info!(
            "run finished: {} sweeps, {} points, {} failures -> {}",
            report.sweeps, report.points, report.failures, report.verdict
        );
        Ok(report)
    }
}
