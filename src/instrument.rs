//! # Instrument Collaborator Contracts
//!
//! The certification core never talks to hardware directly. It drives four
//! external collaborators through the traits defined here:
//!
//! - [`GridSimulator`]: the AC stimulus source (voltage and frequency).
//! - [`SourceSimulator`]: the DC/PV input source feeding the EUT.
//! - [`Daq`]: the data-acquisition system, including the scratch-channel
//!   mechanism that annotates captured rows with per-point targets and
//!   bounds.
//! - [`EutControl`]: the EUT communication layer used to configure the droop
//!   function under test.
//!
//! A fifth trait, [`Clock`], abstracts the settling waits and the timed
//! hysteresis polling loop so tests can run against simulated time.
//!
//! All collaborator failures surface as [`EquipmentError`], which the
//! sequencer treats as fatal: the run unwinds and teardown is guaranteed.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::curve::Breakpoint;

/// Measurement and scratch channel names shared by the DAQ contract, the
/// sequencer, and the report artifacts.
pub mod channels {
    /// Elapsed-time column of every dataset row.
    pub const TIME: &str = "TIME";
    /// Per-phase RMS voltage.
    pub const AC_VRMS: [&str; 3] = ["AC_VRMS_1", "AC_VRMS_2", "AC_VRMS_3"];
    /// Per-phase frequency.
    pub const AC_FREQ: [&str; 3] = ["AC_FREQ_1", "AC_FREQ_2", "AC_FREQ_3"];
    /// Per-phase active power.
    pub const AC_P: [&str; 3] = ["AC_P_1", "AC_P_2", "AC_P_3"];
    /// Per-phase reactive power.
    pub const AC_Q: [&str; 3] = ["AC_Q_1", "AC_Q_2", "AC_Q_3"];
    /// Per-phase displacement power factor.
    pub const AC_PF: [&str; 3] = ["AC_PF_1", "AC_PF_2", "AC_PF_3"];
    /// Scratch channel tagging sweep events (step, settling done, ramp check).
    pub const EVENT: &str = "EVENT";
}

/// Number of AC phases the EUT presents to the measurement equipment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phases {
    /// One phase: channel `_1` only.
    Single,
    /// Split phase: channels `_1` and `_2`.
    Split,
    /// Three phase: channels `_1` through `_3`.
    Three,
}

impl Phases {
    /// Number of per-phase channels to aggregate.
    pub fn count(&self) -> usize {
        match self {
            Phases::Single => 1,
            Phases::Split => 2,
            Phases::Three => 3,
        }
    }
}

impl Default for Phases {
    fn default() -> Self {
        Phases::Single
    }
}

/// The independent quantity a sweep commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StimulusKind {
    /// Grid voltage (volt-var, volt-watt, fixed power factor).
    Voltage,
    /// Grid frequency (frequency-watt).
    Frequency,
}

impl StimulusKind {
    /// Per-phase measurement channels for the commanded quantity.
    pub fn measurement_channels(&self) -> &'static [&'static str; 3] {
        match self {
            StimulusKind::Voltage => &channels::AC_VRMS,
            StimulusKind::Frequency => &channels::AC_FREQ,
        }
    }

    /// Scratch channel carrying the commanded setpoint.
    pub fn target_channel(&self) -> &'static str {
        match self {
            StimulusKind::Voltage => "V_TARGET",
            StimulusKind::Frequency => "F_TARGET",
        }
    }

    /// Scratch channel carrying the measured value at evaluation time.
    pub fn actual_channel(&self) -> &'static str {
        match self {
            StimulusKind::Voltage => "V_ACT",
            StimulusKind::Frequency => "F_ACT",
        }
    }
}

/// The dependent quantity a sweep scores against the target curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    /// Reactive power in vars (volt-var).
    ReactivePower,
    /// Active power as a percentage of rated power (frequency-watt,
    /// volt-watt).
    ActivePowerPct,
    /// Displacement power factor (fixed power factor).
    PowerFactor,
}

impl ResponseKind {
    /// Per-phase measurement channels for the response quantity.
    pub fn measurement_channels(&self) -> &'static [&'static str; 3] {
        match self {
            ResponseKind::ReactivePower => &channels::AC_Q,
            ResponseKind::ActivePowerPct => &channels::AC_P,
            ResponseKind::PowerFactor => &channels::AC_PF,
        }
    }

    /// Scratch channel carrying the target response.
    pub fn target_channel(&self) -> &'static str {
        match self {
            ResponseKind::ReactivePower => "Q_TARGET",
            ResponseKind::ActivePowerPct => "P_TARGET",
            ResponseKind::PowerFactor => "PF_TARGET",
        }
    }

    /// Scratch channel carrying the lower acceptance bound.
    pub fn min_channel(&self) -> &'static str {
        match self {
            ResponseKind::ReactivePower => "Q_MIN",
            ResponseKind::ActivePowerPct => "P_MIN",
            ResponseKind::PowerFactor => "PF_MIN",
        }
    }

    /// Scratch channel carrying the upper acceptance bound.
    pub fn max_channel(&self) -> &'static str {
        match self {
            ResponseKind::ReactivePower => "Q_MAX",
            ResponseKind::ActivePowerPct => "P_MAX",
            ResponseKind::PowerFactor => "PF_MAX",
        }
    }

    /// Scratch channel carrying the measured response.
    pub fn actual_channel(&self) -> &'static str {
        match self {
            ResponseKind::ReactivePower => "Q_ACT",
            ResponseKind::ActivePowerPct => "P_ACT",
            ResponseKind::PowerFactor => "PF_ACT",
        }
    }
}

/// Selects whether curve percentages are relative to available or maximum
/// capability when configuring the EUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependentRef {
    /// Percent of currently available reactive power (active power priority).
    VarAvailPct,
    /// Percent of maximum reactive power (reactive power priority).
    VarMaxPct,
    /// Percent of maximum active power (watt curves).
    WattMaxPct,
}

impl fmt::Display for DependentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DependentRef::VarAvailPct => "VAR_AVAL_PCT",
            DependentRef::VarMaxPct => "VAR_MAX_PCT",
            DependentRef::WattMaxPct => "W_MAX_PCT",
        };
        f.write_str(s)
    }
}

/// Failure raised by an external collaborator. Always fatal to the run.
#[derive(Debug, thiserror::Error)]
pub enum EquipmentError {
    /// A device rejected a command or lost communication.
    #[error("{device} fault: {message}")]
    Device {
        /// Which collaborator failed.
        device: &'static str,
        /// Driver-reported detail.
        message: String,
    },

    /// An I/O error from the collaborator's transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EquipmentError {
    /// Shorthand for a device-level fault.
    pub fn device(device: &'static str, message: impl Into<String>) -> Self {
        Self::Device {
            device,
            message: message.into(),
        }
    }
}

/// One captured channel value. Scratch channels may carry event text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelValue {
    /// A numeric measurement or annotation.
    Number(f64),
    /// A textual event tag.
    Text(String),
}

impl fmt::Display for ChannelValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelValue::Number(n) => write!(f, "{}", n),
            ChannelValue::Text(s) => f.write_str(s),
        }
    }
}

/// The most recent reading from the DAQ: numeric measurement channels only.
#[derive(Debug, Clone)]
pub struct Reading {
    /// Seconds since the run clock origin.
    pub elapsed: f64,
    /// Channel name to measured value.
    pub values: BTreeMap<String, f64>,
}

impl Reading {
    /// Fetch one channel, if present.
    pub fn get(&self, channel: &str) -> Option<f64> {
        self.values.get(channel).copied()
    }
}

/// One row of a captured dataset: measurements plus scratch annotations.
#[derive(Debug, Clone)]
pub struct DatasetRow {
    /// Seconds since the run clock origin.
    pub elapsed: f64,
    /// Channel name to captured value.
    pub values: BTreeMap<String, ChannelValue>,
}

/// A completed capture: every sampled row between start and stop.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    /// Rows in capture order.
    pub rows: Vec<DatasetRow>,
}

impl Dataset {
    /// Union of channel names across all rows, sorted.
    pub fn columns(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .rows
            .iter()
            .flat_map(|row| row.values.keys().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// The AC stimulus source. Commands are synchronous and assumed to take
/// effect before the following settling wait completes.
pub trait GridSimulator {
    /// Command the grid voltage in volts.
    fn set_voltage(&mut self, volts: f64) -> Result<(), EquipmentError>;
    /// Command the grid frequency in hertz.
    fn set_frequency(&mut self, hz: f64) -> Result<(), EquipmentError>;
    /// Release the instrument.
    fn close(&mut self) -> Result<(), EquipmentError>;
}

/// The input source feeding the EUT.
pub trait SourceSimulator {
    /// Command the available input power in watts.
    fn set_power(&mut self, watts: f64) -> Result<(), EquipmentError>;
    /// Energize the source.
    fn power_on(&mut self) -> Result<(), EquipmentError>;
    /// Release the instrument.
    fn close(&mut self) -> Result<(), EquipmentError>;
}

/// The data-acquisition system.
///
/// Scratch channels set before a [`Daq::sample`] call are recorded on that
/// row and cleared afterwards by the caller, so each captured row carries
/// its per-point annotations.
pub trait Daq {
    /// Begin accumulating rows into a new in-progress dataset.
    fn start_capture(&mut self) -> Result<(), EquipmentError>;
    /// Stop accumulating rows.
    fn stop_capture(&mut self) -> Result<(), EquipmentError>;
    /// Append one row to the in-progress dataset.
    fn sample(&mut self) -> Result<(), EquipmentError>;
    /// Read the latest values of all measurement channels.
    fn read_last(&mut self) -> Result<Reading, EquipmentError>;
    /// Set or clear (`None`) a named scratch channel.
    fn set_scratch(&mut self, name: &str, value: Option<ChannelValue>);
    /// Take ownership of the captured dataset, leaving the DAQ empty.
    fn take_dataset(&mut self) -> Dataset;
    /// Release the instrument.
    fn close(&mut self) -> Result<(), EquipmentError>;
}

/// The EUT communication layer used to configure the function under test.
pub trait EutControl {
    /// Load a droop curve into the EUT.
    fn apply_curve(
        &mut self,
        curve_id: u32,
        points: &[Breakpoint],
        independent: StimulusKind,
        dept_ref: DependentRef,
    ) -> Result<(), EquipmentError>;
    /// Enable or disable the configured droop function.
    fn enable_function(&mut self, enabled: bool) -> Result<(), EquipmentError>;
    /// Set (and enable/disable) the fixed power factor function.
    fn set_fixed_pf(&mut self, enabled: bool, pf: f64) -> Result<(), EquipmentError>;
    /// Read back the current configuration for logging.
    fn read_settings(&mut self) -> Result<BTreeMap<String, String>, EquipmentError>;
    /// Release the control channel.
    fn close(&mut self) -> Result<(), EquipmentError>;
}

/// Time source for settling waits and the hysteresis polling loop.
pub trait Clock {
    /// Seconds since the clock origin.
    fn now(&self) -> f64;
    /// Block for `seconds` of this clock's time. Not preemptible.
    fn sleep(&mut self, seconds: f64);
}

/// Real-time clock backed by [`Instant`] and [`std::thread::sleep`].
#[derive(Debug)]
pub struct WallClock {
    origin: Instant,
}

impl WallClock {
    /// Create a clock with its origin at construction time.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for WallClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn sleep(&mut self, seconds: f64) {
        if seconds > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(seconds));
        }
    }
}
