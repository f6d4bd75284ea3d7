//! # droopcert - Grid-Support Droop Function Certification
//!
//! `droopcert` is a certification engine for the grid-support droop functions
//! of distributed energy resource inverters: fixed power factor, volt-var,
//! frequency-watt, and volt-watt. It drives a grid simulator, an input
//! source, a data-acquisition system, and the EUT's control channel through
//! swept stimulus profiles, and scores every measured response against an
//! accuracy-derived acceptance band around the target curve.
//!
//! ## Key Features
//!
//! - **Curve Engine**: Piecewise-linear target characteristics with flat
//!   extrapolation beyond the breakpoints, extended to the sweep boundaries.
//!
//! - **Acceptance Bands**: Asymmetric pass/fail bounds derived from the
//!   manufacturer's stated accuracies, evaluated at the *measured* stimulus
//!   value so stimulus error never penalizes the EUT.
//!
//! - **Sweep State Machine**: Evenly spaced setpoints across every curve
//!   segment, swept up and down, repeated per configured power level.
//!
//! - **Hysteresis Check**: Timed return-ramp verification for volt-watt
//!   functions with a return delay and ramp-rate limit.
//!
//! - **Simulated Bench**: A deterministic in-process implementation of every
//!   instrument, so whole certification runs execute in tests and demos
//!   without hardware.
//!
//! - **Auditable Artifacts**: A CSV summary row per scored point, a CSV
//!   dataset per sweep with per-point annotations, and a JSON run report.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//!
//! use droopcert::config::TestConfig;
//! use droopcert::recorder::ResultRecorder;
//! use droopcert::sequencer::{Instruments, TestSequencer};
//! use droopcert::sim::{SimBench, SimBenchConfig};
//!
//! // Load and validate the test matrix.
//! let config = TestConfig::load(Path::new("cert.toml"))?;
//!
//! // Run it against the simulated bench.
//! let bench = SimBench::new(SimBenchConfig {
//!     p_rated: config.eut.p_rated,
//!     v_nom: config.eut.v_nom,
//!     f_nom: config.eut.f_nom,
//!     phases: config.eut.phases,
//! });
//! let instruments = Instruments {
//!     grid: Box::new(bench.grid()),
//!     source: Box::new(bench.source()),
//!     daq: Box::new(bench.daq()),
//!     eut: Box::new(bench.eut()),
//!     clock: Box::new(bench.clock()),
//! };
//! let recorder = ResultRecorder::create(Path::new("results"), &config.name)?;
//! let report = TestSequencer::new(config, instruments, recorder).run()?;
//! println!("verdict: {}", report.verdict);
//! # Ok::<(), droopcert::error::CertError>(())
//! ```
//!
//! This writes a results directory:
//! ```text
//! results/
//! ├── result_summary.csv      # One row per scored point
//! ├── vv_ma_100_up_1.csv      # Captured dataset per sweep
//! ├── vv_ma_100_down_1.csv
//! └── run.json                # Totals and the overall verdict
//! ```
//!
//! ## Architecture
//!
//! - [`curve`]: piecewise-linear target characteristics
//! - [`band`]: acceptance-band evaluation from stated accuracies
//! - [`sweep`]: setpoint generation and sweep ordering
//! - [`config`]: TOML test matrix, validation, and sweep-plan resolution
//! - [`instrument`]: collaborator traits and channel conventions
//! - [`sim`]: the deterministic simulated bench
//! - [`sequencer`]: run orchestration, scoring, and teardown
//! - [`recorder`]: summary, dataset, and report artifacts
//! - [`error`]: the fatal fault taxonomy

#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

pub mod band;
pub mod config;
pub mod curve;
pub mod error;
pub mod instrument;
pub mod recorder;
pub mod sequencer;
pub mod sim;
pub mod sweep;

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::band::{band_at, Band, Msa};
    pub use crate::config::{
        ConfigError, PowerPriority, ReactiveSign, SweepPlan, TestConfig, TestDef,
    };
    pub use crate::curve::{Breakpoint, Curve, CurveError};
    pub use crate::error::CertError;
    pub use crate::instrument::{
        Clock, Daq, Dataset, EquipmentError, EutControl, GridSimulator, Phases, Reading,
        ResponseKind, SourceSimulator, StimulusKind, WallClock,
    };
    pub use crate::recorder::{ResultRecorder, RunReport, TestPointResult, TestRun};
    pub use crate::sequencer::{Instruments, TestSequencer};
    pub use crate::sim::{SimBench, SimBenchConfig, SimHysteresis, SimHysteresisMode};
    pub use crate::sweep::{sample_points, segment_points, SweepDirection};
}
