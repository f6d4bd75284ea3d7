//! # Fatal Fault Taxonomy
//!
//! Faults that unwind a certification run. Recoverable per-point conditions
//! (a channel missing from a sample) never appear here: they are scored as
//! failed points with an explicit reason and the sweep continues. Everything
//! in [`CertError`] aborts the run and triggers the sequencer's unconditional
//! teardown.

use crate::config::ConfigError;
use crate::curve::CurveError;
use crate::instrument::EquipmentError;
use crate::recorder::RecorderError;

/// A fatal fault that aborts the certification run.
#[derive(Debug, thiserror::Error)]
pub enum CertError {
    /// Invalid or unrecognized parameter combination.
    #[error("configuration fault: {0}")]
    Config(#[from] ConfigError),

    /// Degenerate curve definition reaching past configuration validation.
    #[error("curve fault: {0}")]
    Curve(#[from] CurveError),

    /// Failure raised by an external collaborator.
    #[error("equipment fault: {0}")]
    Equipment(#[from] EquipmentError),

    /// Failure writing a result artifact.
    #[error("recorder fault: {0}")]
    Recorder(#[from] RecorderError),
}
