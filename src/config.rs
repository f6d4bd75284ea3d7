//! # Test Configuration
//!
//! TOML-backed test parameters: EUT ratings, stated accuracies, sweep
//! timing, power levels, and the droop-function definitions to certify.
//! Loading and validation happen before any instrument is touched, so a
//! malformed parameter combination (unknown power priority, degenerate
//! zero-width curve, inverted voltage range) is a fatal configuration fault
//! rather than a mid-sweep surprise.
//!
//! [`TestDef::plan`] resolves one function definition at one power level into
//! a [`SweepPlan`]: the concrete target curve, the ordered setpoints, the
//! accuracy pair in the response's units, and the EUT configuration to apply.
//! The sequencer consumes plans and never re-derives curves itself.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::band::Msa;
use crate::curve::{Breakpoint, Curve, CurveError};
use crate::instrument::{DependentRef, Phases, ResponseKind, StimulusKind};
use crate::sweep::{sample_points, SweepDirection};

/// Fatal configuration faults. Any of these aborts the run before it starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Offending path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for this schema. Unknown
    /// enum values (for example an unrecognized power priority) surface here.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// Offending path.
        path: String,
        /// Underlying TOML error.
        source: toml::de::Error,
    },

    /// A parameter or parameter combination is out of range.
    #[error("invalid parameter: {0}")]
    Invalid(String),

    /// A derived or specified curve is degenerate.
    #[error("curve definition fault in '{label}': {source}")]
    Curve {
        /// Test label whose curve failed to build.
        label: String,
        /// Underlying curve error.
        source: CurveError,
    },
}

/// Which output the EUT prioritizes when both cannot be met. Maps to the
/// dependent reference type used when loading volt-var curves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerPriority {
    /// Active power priority: curve percentages relative to available vars.
    Active,
    /// Reactive power priority: curve percentages relative to maximum vars.
    Reactive,
}

impl Default for PowerPriority {
    fn default() -> Self {
        PowerPriority::Active
    }
}

impl PowerPriority {
    /// The dependent reference type for volt-var curves under this priority.
    pub fn var_dependent_ref(&self) -> DependentRef {
        match self {
            PowerPriority::Active => DependentRef::VarAvailPct,
            PowerPriority::Reactive => DependentRef::VarMaxPct,
        }
    }
}

/// Sign convention for reactive-power curve points. The certification
/// procedures disagree across functions about whether over-excited
/// (capacitive) injection is positive, so the choice is explicit
/// configuration rather than a built-in assumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactiveSign {
    /// Over-excited injection is positive (the volt-var procedure's default).
    OverexcitedPositive,
    /// Over-excited injection is negative.
    OverexcitedNegative,
}

impl Default for ReactiveSign {
    fn default() -> Self {
        ReactiveSign::OverexcitedPositive
    }
}

/// Nameplate ratings and operating ranges of the EUT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EutRatings {
    /// Rated active power in watts.
    pub p_rated: f64,
    /// Nominal AC voltage in volts.
    pub v_nom: f64,
    /// Minimum AC voltage with the function enabled.
    pub v_min: f64,
    /// Maximum AC voltage with the function enabled.
    pub v_max: f64,
    /// Nominal frequency in hertz.
    pub f_nom: f64,
    /// Minimum frequency with the function enabled.
    pub f_min: f64,
    /// Maximum frequency with the function enabled.
    pub f_max: f64,
    /// Nominal voltage at the grid simulator terminals, when line drop or a
    /// transformer makes it differ from the EUT nominal. Commands are scaled
    /// by `v_nom_grid / v_nom`.
    #[serde(default)]
    pub v_nom_grid: Option<f64>,
    /// Number of AC phases.
    #[serde(default)]
    pub phases: Phases,
}

impl EutRatings {
    /// Voltage-command scale factor for line-drop correction.
    pub fn grid_scale(&self) -> f64 {
        match self.v_nom_grid {
            Some(v_grid) => v_grid / self.v_nom,
            None => 1.0,
        }
    }
}

/// Manufacturer's stated accuracies, in the units of each quantity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccuracyConfig {
    /// Voltage accuracy in volts.
    pub voltage: f64,
    /// Frequency accuracy in hertz.
    pub frequency: f64,
    /// Active power accuracy in watts (converted to percent of rated when a
    /// plan scores percent power).
    pub active_power: f64,
    /// Reactive power accuracy in vars.
    pub reactive_power: f64,
    /// Power factor accuracy (dimensionless).
    #[serde(default = "default_pf_accuracy")]
    pub power_factor: f64,
    /// Timing accuracy in seconds, used by the hysteresis ramp check.
    #[serde(default)]
    pub time: f64,
}

fn default_pf_accuracy() -> f64 {
    0.01
}

impl AccuracyConfig {
    /// Active power accuracy as percent of rated power.
    pub fn active_power_pct(&self, p_rated: f64) -> f64 {
        self.active_power / p_rated * 100.0
    }
}

/// Sweep timing and density parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Settling time in seconds after each stimulus change.
    pub settling_time: f64,
    /// Interior measurement points per curve segment.
    #[serde(default = "default_segment_points")]
    pub segment_points: usize,
    /// Polling interval of the hysteresis ramp check, in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
}

fn default_segment_points() -> usize {
    3
}

fn default_poll_interval() -> f64 {
    0.2
}

/// One output power level of the test matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerLevel {
    /// Fraction of rated power, in `(0, 1]`.
    pub fraction: f64,
    /// Number of sweep iterations at this level.
    pub repetitions: usize,
    /// Conversion efficiency at this level; the input source is commanded
    /// `p_rated * fraction / efficiency` to hit the output target.
    #[serde(default = "default_efficiency")]
    pub efficiency: f64,
}

fn default_efficiency() -> f64 {
    1.0
}

/// EUT volt-var capability parameters, shared by the derived characteristic
/// curves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoltVarParams {
    /// Maximum reactive power production, over-excited, in vars.
    pub q_max_over: f64,
    /// Maximum reactive power absorption, under-excited, in vars. Normalized
    /// to negative regardless of the configured sign.
    pub q_max_under: f64,
    /// Maximum volt-var slope in var/V.
    pub k_var_max: f64,
    /// Minimum volt-var slope in var/V; derived from the capability window
    /// when absent.
    #[serde(default)]
    pub k_var_min: Option<f64>,
    /// Deadband minimum width in volts.
    pub deadband_min: f64,
    /// Deadband maximum width in volts.
    pub deadband_max: f64,
}

/// Which derived volt-var characteristic to test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoltVarShape {
    /// Steepest slope, narrowest deadband, full capability.
    MostAggressive,
    /// Mid slope and deadband at half capability.
    Average,
    /// Shallowest slope at quarter capability.
    LeastAggressive,
    /// Explicit four-point curve in percentages.
    Specified {
        /// Four voltage points as percent of nominal voltage.
        v_pct: Vec<f64>,
        /// Four reactive points as percent of `q_max_over`.
        q_pct: Vec<f64>,
    },
}

/// Frequency-watt definition style.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreqWattMode {
    /// Slope start plus gradient; the stop point is derived per power level
    /// as `f_start + 100 * power / k_pf`.
    Parametric {
        /// Frequency where power reduction begins, in hertz.
        f_start: f64,
        /// Power reduction gradient in percent of rated per hertz.
        k_pf: f64,
    },
    /// Explicit breakpoints; power points scale with the power level.
    Pointwise {
        /// Frequency points in hertz, strictly increasing.
        f: Vec<f64>,
        /// Power points in percent of rated.
        p: Vec<f64>,
    },
}

/// Return-to-normal behavior of the volt-watt function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HysteresisConfig {
    /// Voltage below which curtailment releases, in volts.
    pub v_stop: f64,
    /// Delay before output may begin returning, in seconds.
    pub t_return: f64,
    /// Return ramp rate in percent of rated power per second.
    pub ramp_rate: f64,
}

/// One droop function definition in the test matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "function", rename_all = "snake_case")]
pub enum TestDef {
    /// Fixed power factor at a single commanded value.
    FixedPowerFactor {
        /// Test name used in summaries and dataset filenames.
        label: String,
        /// Commanded displacement power factor, in `[-1, 1]`, nonzero.
        pf: f64,
    },
    /// Volt-var reactive power droop.
    VoltVar {
        /// Test name used in summaries and dataset filenames.
        label: String,
        /// Characteristic selection.
        shape: VoltVarShape,
    },
    /// Frequency-watt active power droop.
    FreqWatt {
        /// Test name used in summaries and dataset filenames.
        label: String,
        /// Parametric or pointwise definition.
        mode: FreqWattMode,
    },
    /// Volt-watt active power droop, optionally with hysteresis.
    VoltWatt {
        /// Test name used in summaries and dataset filenames.
        label: String,
        /// Voltage where power reduction begins, in volts.
        v_start: f64,
        /// Power reduction gradient in percent of rated per volt.
        k_power_volt: f64,
        /// Return-to-normal behavior, when the EUT implements it.
        #[serde(default)]
        hysteresis: Option<HysteresisConfig>,
    },
}

impl TestDef {
    /// The test name used in summaries and dataset filenames.
    pub fn label(&self) -> &str {
        match self {
            TestDef::FixedPowerFactor { label, .. } => label,
            TestDef::VoltVar { label, .. } => label,
            TestDef::FreqWatt { label, .. } => label,
            TestDef::VoltWatt { label, .. } => label,
        }
    }
}

/// Resolved hysteresis parameters for one sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct HysteresisSpec {
    /// Voltage below which curtailment releases.
    pub v_stop: f64,
    /// Delay before output may begin returning, in seconds.
    pub t_return: f64,
    /// Return ramp rate in percent of rated power per second.
    pub ramp_rate: f64,
    /// Expected post-return plateau in percent of rated power.
    pub plateau_pct: f64,
}

/// EUT configuration to apply before a sweep.
#[derive(Debug, Clone)]
pub struct EutCurveSpec {
    /// Curve points in engineering units (the slope region, without the
    /// flat sweep-boundary extensions).
    pub points: Vec<Breakpoint>,
    /// Which quantity drives the curve.
    pub independent: StimulusKind,
    /// Reference for the dependent percentages.
    pub dept_ref: DependentRef,
}

/// Everything the sequencer needs to execute one (function, power level)
/// combination: target curve, setpoints, accuracies, timing, and EUT setup.
#[derive(Debug, Clone)]
pub struct SweepPlan {
    /// Test name for summaries and filenames.
    pub test_label: String,
    /// Commanded quantity.
    pub stimulus: StimulusKind,
    /// Scored quantity.
    pub response: ResponseKind,
    /// Target characteristic, domain extended to the sweep boundaries.
    pub curve: Curve,
    /// Ascending setpoint sequence.
    pub setpoints: Vec<f64>,
    /// Sweep directions to execute, in order.
    pub directions: Vec<SweepDirection>,
    /// Settling wait is `settling_time * settle_multiplier`.
    pub settle_multiplier: f64,
    /// Accuracy pair in (stimulus units, response units).
    pub msa: Msa,
    /// Return-to-normal check, for volt-watt with hysteresis.
    pub hysteresis: Option<HysteresisSpec>,
    /// Droop curve to load into the EUT, when the function uses one.
    pub eut_curve: Option<EutCurveSpec>,
    /// Fixed power factor command, for the power factor function.
    pub fixed_pf: Option<f64>,
}

/// Complete configuration for one certification run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConfig {
    /// Configuration name, used for the summary artifacts.
    pub name: String,
    /// EUT ratings and ranges.
    pub eut: EutRatings,
    /// Stated accuracies.
    pub accuracy: AccuracyConfig,
    /// Sweep timing and density.
    pub sweep: SweepConfig,
    /// Power priority selection.
    #[serde(default)]
    pub power_priority: PowerPriority,
    /// Reactive sign convention.
    #[serde(default)]
    pub reactive_sign: ReactiveSign,
    /// Volt-var capability parameters; required when any volt-var test is
    /// defined.
    #[serde(default)]
    pub volt_var: Option<VoltVarParams>,
    /// Power levels of the test matrix.
    pub power_levels: Vec<PowerLevel>,
    /// Droop functions to certify.
    pub tests: Vec<TestDef>,
}

impl TestConfig {
    /// Load and validate a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: TestConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: TestConfig = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check ranges and dry-run every (test, power level) plan so degenerate
    /// curve definitions fail before equipment is configured.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let eut = &self.eut;
        if eut.p_rated <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "p_rated must be positive, got {}",
                eut.p_rated
            )));
        }
        if !(eut.v_min < eut.v_nom && eut.v_nom < eut.v_max) {
            return Err(ConfigError::Invalid(format!(
                "voltage range must satisfy v_min < v_nom < v_max, got {} / {} / {}",
                eut.v_min, eut.v_nom, eut.v_max
            )));
        }
        if !(eut.f_min < eut.f_nom && eut.f_nom < eut.f_max) {
            return Err(ConfigError::Invalid(format!(
                "frequency range must satisfy f_min < f_nom < f_max, got {} / {} / {}",
                eut.f_min, eut.f_nom, eut.f_max
            )));
        }
        if self.sweep.settling_time <= 0.0 {
            return Err(ConfigError::Invalid(
                "settling_time must be positive".to_string(),
            ));
        }
        if self.sweep.poll_interval <= 0.0 {
            return Err(ConfigError::Invalid(
                "poll_interval must be positive".to_string(),
            ));
        }
        for msa in [
            self.accuracy.voltage,
            self.accuracy.frequency,
            self.accuracy.active_power,
            self.accuracy.reactive_power,
            self.accuracy.power_factor,
            self.accuracy.time,
        ] {
            if msa < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "accuracies must be non-negative, got {}",
                    msa
                )));
            }
        }
        if self.power_levels.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one power level is required".to_string(),
            ));
        }
        for level in &self.power_levels {
            if !(level.fraction > 0.0 && level.fraction <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "power level fraction must be in (0, 1], got {}",
                    level.fraction
                )));
            }
            if level.repetitions == 0 {
                return Err(ConfigError::Invalid(
                    "power level repetitions must be at least 1".to_string(),
                ));
            }
            if !(level.efficiency > 0.0 && level.efficiency <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "efficiency must be in (0, 1], got {}",
                    level.efficiency
                )));
            }
        }
        if self.tests.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one test is required".to_string(),
            ));
        }
        for test in &self.tests {
            for level in &self.power_levels {
                test.plan(self, level.fraction)?;
            }
        }
        Ok(())
    }
}

impl TestDef {
    /// Resolve this definition at one power level into a concrete sweep plan.
    pub fn plan(&self, config: &TestConfig, power: f64) -> Result<SweepPlan, ConfigError> {
        let eut = &config.eut;
        let acc = &config.accuracy;
        match self {
            TestDef::FixedPowerFactor { label, pf } => {
                if !(*pf >= -1.0 && *pf <= 1.0) || *pf == 0.0 {
                    return Err(ConfigError::Invalid(format!(
                        "power factor must be in [-1, 1] and nonzero, got {}",
                        pf
                    )));
                }
                let curve = Curve::constant(*pf);
                Ok(SweepPlan {
                    test_label: label.clone(),
                    stimulus: StimulusKind::Voltage,
                    response: ResponseKind::PowerFactor,
                    setpoints: vec![eut.v_nom],
                    // A single held setpoint; a reversed pass adds nothing.
                    directions: vec![SweepDirection::Up],
                    settle_multiplier: 3.0,
                    msa: Msa::new(acc.voltage, acc.power_factor),
                    hysteresis: None,
                    eut_curve: None,
                    fixed_pf: Some(*pf),
                    curve,
                })
            }
            TestDef::VoltVar { label, shape } => {
                let params = config.volt_var.as_ref().ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "test '{}' requires the [volt_var] capability section",
                        label
                    ))
                })?;
                let slope = build_volt_var_points(shape, params, eut)
                    .map_err(|source| ConfigError::Curve {
                        label: label.clone(),
                        source,
                    })
                    .map(|points| apply_reactive_sign(points, config.reactive_sign))?;
                let curve = Curve::from_points(slope.clone())
                    .and_then(|c| c.with_bounds(eut.v_min, eut.v_max))
                    .map_err(|source| ConfigError::Curve {
                        label: label.clone(),
                        source,
                    })?;
                let setpoints = sample_points(&curve, config.sweep.segment_points);
                Ok(SweepPlan {
                    test_label: label.clone(),
                    stimulus: StimulusKind::Voltage,
                    response: ResponseKind::ReactivePower,
                    setpoints,
                    directions: vec![SweepDirection::Up, SweepDirection::Down],
                    settle_multiplier: 1.0,
                    msa: Msa::new(acc.voltage, acc.reactive_power),
                    hysteresis: None,
                    eut_curve: Some(EutCurveSpec {
                        points: slope,
                        independent: StimulusKind::Voltage,
                        dept_ref: config.power_priority.var_dependent_ref(),
                    }),
                    fixed_pf: None,
                    curve,
                })
            }
            TestDef::FreqWatt { label, mode } => {
                let (slope, curve) = match mode {
                    FreqWattMode::Parametric { f_start, k_pf } => ramp_with_bounds(
                        *f_start,
                        *k_pf,
                        power,
                        eut.f_min,
                        eut.f_max,
                    )
                    .map_err(|source| ConfigError::Curve {
                        label: label.clone(),
                        source,
                    })?,
                    FreqWattMode::Pointwise { f, p } => {
                        if f.len() != p.len() || f.is_empty() {
                            return Err(ConfigError::Invalid(format!(
                                "pointwise test '{}' needs matching non-empty f and p lists",
                                label
                            )));
                        }
                        let points: Vec<Breakpoint> = f
                            .iter()
                            .zip(p.iter())
                            .map(|(&x, &y)| Breakpoint::new(x, y * power))
                            .collect();
                        let curve = Curve::from_points(points.clone())
                            .and_then(|c| c.with_bounds(eut.f_min, eut.f_max))
                            .map_err(|source| ConfigError::Curve {
                                label: label.clone(),
                                source,
                            })?;
                        (points, curve)
                    }
                };
                let setpoints = sample_points(&curve, config.sweep.segment_points);
                Ok(SweepPlan {
                    test_label: label.clone(),
                    stimulus: StimulusKind::Frequency,
                    response: ResponseKind::ActivePowerPct,
                    setpoints,
                    directions: vec![SweepDirection::Up, SweepDirection::Down],
                    settle_multiplier: 2.0,
                    msa: Msa::new(acc.frequency, acc.active_power_pct(eut.p_rated)),
                    hysteresis: None,
                    eut_curve: Some(EutCurveSpec {
                        points: slope,
                        independent: StimulusKind::Frequency,
                        dept_ref: DependentRef::WattMaxPct,
                    }),
                    fixed_pf: None,
                    curve,
                })
            }
            TestDef::VoltWatt {
                label,
                v_start,
                k_power_volt,
                hysteresis,
            } => {
                let (slope, curve) = ramp_with_bounds(
                    *v_start,
                    *k_power_volt,
                    power,
                    eut.v_min,
                    eut.v_max,
                )
                .map_err(|source| ConfigError::Curve {
                    label: label.clone(),
                    source,
                })?;
                let setpoints = sample_points(&curve, config.sweep.segment_points);
                let hysteresis = hysteresis.as_ref().map(|h| HysteresisSpec {
                    v_stop: h.v_stop,
                    t_return: h.t_return,
                    ramp_rate: h.ramp_rate,
                    plateau_pct: 100.0 * power,
                });
                if let Some(spec) = &hysteresis {
                    if spec.ramp_rate <= 0.0 {
                        return Err(ConfigError::Invalid(format!(
                            "hysteresis ramp_rate must be positive in test '{}'",
                            label
                        )));
                    }
                    if spec.t_return < 0.0 {
                        return Err(ConfigError::Invalid(format!(
                            "hysteresis t_return must be non-negative in test '{}'",
                            label
                        )));
                    }
                }
                Ok(SweepPlan {
                    test_label: label.clone(),
                    stimulus: StimulusKind::Voltage,
                    response: ResponseKind::ActivePowerPct,
                    setpoints,
                    directions: vec![SweepDirection::Up, SweepDirection::Down],
                    settle_multiplier: 2.0,
                    msa: Msa::new(acc.voltage, acc.active_power_pct(eut.p_rated)),
                    hysteresis,
                    eut_curve: Some(EutCurveSpec {
                        points: slope,
                        independent: StimulusKind::Voltage,
                        dept_ref: DependentRef::WattMaxPct,
                    }),
                    fixed_pf: None,
                    curve,
                })
            }
        }
    }
}

/// Build a parametric downward ramp at one power level, clipping the slope at
/// the sweep maximum when `start + 100 * power / k` runs past it, and extend
/// the domain to the sweep boundaries.
fn ramp_with_bounds(
    start: f64,
    k: f64,
    power: f64,
    x_min: f64,
    x_max: f64,
) -> Result<(Vec<Breakpoint>, Curve), CurveError> {
    if k <= 0.0 {
        return Err(CurveError::ZeroWidthSegment { x: start });
    }
    let stop = start + 100.0 * power / k;
    let ramp = if stop < x_max {
        Curve::ramp_down(start, stop, power)?
    } else {
        // Slope extends past the trip point: the sweep's final flat segment
        // is skipped and the curve ends mid-slope.
        let y_at_max = 100.0 * power * (1.0 - (x_max - start) / (stop - start));
        Curve::from_points(vec![
            Breakpoint::new(start, 100.0 * power),
            Breakpoint::new(x_max, y_at_max),
        ])?
    };
    let slope = ramp.breakpoints().to_vec();
    let curve = ramp.with_bounds(x_min, x_max)?;
    Ok((slope, curve))
}

/// Derive the four slope breakpoints of a volt-var characteristic from the
/// EUT capability parameters.
fn build_volt_var_points(
    shape: &VoltVarShape,
    params: &VoltVarParams,
    eut: &EutRatings,
) -> Result<Vec<Breakpoint>, CurveError> {
    let q_max_over = params.q_max_over;
    let q_max_under = -params.q_max_under.abs();
    let q_min_over = q_max_over / 4.0;
    let q_min_under = q_max_under / 4.0;
    let v_dev = (eut.v_nom - eut.v_min).min(eut.v_max - eut.v_nom);
    let k_var_min = params
        .k_var_min
        .unwrap_or((q_max_over / 4.0) / (v_dev - params.deadband_max / 2.0));
    let k_var_avg = (k_var_min + params.k_var_max) / 2.0;
    let deadband_avg = (params.deadband_min + params.deadband_max) / 2.0;

    let (q1, q4, deadband, k) = match shape {
        VoltVarShape::MostAggressive => (q_max_over, q_max_under, params.deadband_min, params.k_var_max),
        VoltVarShape::Average => (
            q_max_over * 0.5,
            q_max_under * 0.5,
            deadband_avg,
            k_var_avg,
        ),
        VoltVarShape::LeastAggressive => (q_min_over, q_min_under, params.deadband_min, k_var_min),
        VoltVarShape::Specified { v_pct, q_pct } => {
            if v_pct.len() != 4 || q_pct.len() != 4 {
                // Surfaced as a curve fault: the point count is part of the
                // curve definition.
                return Err(CurveError::Empty);
            }
            let points: Vec<Breakpoint> = v_pct
                .iter()
                .zip(q_pct.iter())
                .map(|(&vp, &qp)| {
                    Breakpoint::new(vp / 100.0 * eut.v_nom, qp / 100.0 * q_max_over)
                })
                .collect();
            // Validation (monotonic x, zero-width) happens in from_points.
            return Ok(points);
        }
    };

    let v2 = eut.v_nom - deadband / 2.0;
    let v3 = eut.v_nom + deadband / 2.0;
    let (v1, v4) = if k == 0.0 {
        // Zero minimum slope: pinch the slope segments to 1% of the deadband
        // edges, as the volt-var procedure prescribes.
        (0.99 * v2, 1.01 * v3)
    } else {
        (v2 - q1.abs() / k, v3 + q4.abs() / k)
    };
    Ok(vec![
        Breakpoint::new(v1, q1),
        Breakpoint::new(v2, 0.0),
        Breakpoint::new(v3, 0.0),
        Breakpoint::new(v4, q4),
    ])
}

fn apply_reactive_sign(points: Vec<Breakpoint>, sign: ReactiveSign) -> Vec<Breakpoint> {
    match sign {
        ReactiveSign::OverexcitedPositive => points,
        ReactiveSign::OverexcitedNegative => points
            .into_iter()
            .map(|p| Breakpoint::new(p.x, -p.y))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_toml() -> String {
        r#"
            name = "cert_demo"

            [eut]
            p_rated = 3000.0
            v_nom = 120.0
            v_min = 108.0
            v_max = 132.0
            f_nom = 60.0
            f_min = 57.0
            f_max = 63.0
            phases = "single"

            [accuracy]
            voltage = 0.1
            frequency = 0.01
            active_power = 10.0
            reactive_power = 10.0

            [sweep]
            settling_time = 1.0

            [[power_levels]]
            fraction = 1.0
            repetitions = 2

            [volt_var]
            q_max_over = 1500.0
            q_max_under = 1500.0
            k_var_max = 500.0
            deadband_min = 2.0
            deadband_max = 6.0

            [[tests]]
            function = "volt_var"
            label = "vv_most_aggressive"
            shape = "most_aggressive"

            [[tests]]
            function = "freq_watt"
            label = "fw_param"

            [tests.mode.parametric]
            f_start = 60.5
            k_pf = 50.0

            [[tests]]
            function = "fixed_power_factor"
            label = "spf_min_ind"
            pf = 0.85
        "#
        .to_string()
    }

    #[test]
    fn test_parse_and_validate() {
        let config = TestConfig::from_toml_str(&base_toml()).unwrap();
        assert_eq!(config.tests.len(), 3);
        assert_eq!(config.power_priority, PowerPriority::Active);
        assert_eq!(config.reactive_sign, ReactiveSign::OverexcitedPositive);
    }

    #[test]
    fn test_unknown_power_priority_is_parse_error() {
        // Top-level key, so it must land before the first table header.
        let toml = base_toml().replace(
            "name = \"cert_demo\"",
            "name = \"cert_demo\"\npower_priority = \"maximum\"",
        );
        let err = TestConfig::from_toml_str(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_volt_var_plan_builds_six_point_curve() {
        let config = TestConfig::from_toml_str(&base_toml()).unwrap();
        let plan = config.tests[0].plan(&config, 1.0).unwrap();
        // Four slope points plus the two flat boundary extensions.
        assert_eq!(plan.curve.breakpoints().len(), 6);
        assert_eq!(plan.curve.domain_min(), 108.0);
        assert_eq!(plan.curve.domain_max(), 132.0);
        // Deadband center evaluates to zero, below-deadband injects.
        assert_eq!(plan.curve.evaluate(120.0), 0.0);
        assert!(plan.curve.evaluate(110.0) > 0.0);
        assert!(plan.curve.evaluate(130.0) < 0.0);
        let spec = plan.eut_curve.expect("volt-var configures the EUT");
        assert_eq!(spec.points.len(), 4);
        assert_eq!(spec.dept_ref, DependentRef::VarAvailPct);
    }

    #[test]
    fn test_reactive_sign_flips_curve() {
        let toml = base_toml().replace(
            "name = \"cert_demo\"",
            "name = \"cert_demo\"\nreactive_sign = \"overexcited_negative\"",
        );
        let config = TestConfig::from_toml_str(&toml).unwrap();
        assert_eq!(config.reactive_sign, ReactiveSign::OverexcitedNegative);
        let plan = config.tests[0].plan(&config, 1.0).unwrap();
        assert!(plan.curve.evaluate(110.0) < 0.0);
    }

    #[test]
    fn test_parametric_stop_recomputed_per_power_level() {
        let config = TestConfig::from_toml_str(&base_toml()).unwrap();
        let full = config.tests[1].plan(&config, 1.0).unwrap();
        let third = config.tests[1].plan(&config, 0.33).unwrap();
        // Full power: stop at 60.5 + 100/50 = 62.5 Hz.
        assert_eq!(full.curve.evaluate(62.5), 0.0);
        assert!(full.curve.evaluate(62.4) > 0.0);
        // Reduced power: plateau scales, stop pulls in to 61.16 Hz.
        assert!((third.curve.evaluate(60.0) - 33.0).abs() < 1e-9);
        assert_eq!(third.curve.evaluate(61.2), 0.0);
    }

    #[test]
    fn test_parametric_slope_clipped_at_f_max() {
        let toml = base_toml().replace("k_pf = 50.0", "k_pf = 10.0");
        let config = TestConfig::from_toml_str(&toml).unwrap();
        let plan = config.tests[1].plan(&config, 1.0).unwrap();
        // Stop would be 70.5 Hz; the curve ends mid-slope at f_max.
        assert_eq!(plan.curve.domain_max(), 63.0);
        assert!(plan.curve.evaluate(63.0) > 0.0);
    }

    #[test]
    fn test_zero_slope_curve_rejected_at_validation() {
        // A zero gradient makes the ramp degenerate; the plan dry-run inside
        // validate() catches it before any equipment is touched.
        let toml = base_toml().replace("k_pf = 50.0", "k_pf = 0.0");
        let err = TestConfig::from_toml_str(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::Curve { .. }));
    }

    #[test]
    fn test_volt_var_requires_capability_section() {
        let toml = base_toml().replace("[volt_var]", "[volt_var_unused]");
        let err = TestConfig::from_toml_str(&toml).unwrap_err();
        // Either the parse rejects the stray table or validation flags the
        // missing section; both are configuration faults.
        assert!(matches!(
            err,
            ConfigError::Invalid(_) | ConfigError::Parse { .. }
        ));
    }

    #[test]
    fn test_specified_curve_wrong_point_count_rejected() {
        let toml = base_toml().replace(
            "shape = \"most_aggressive\"",
            "shape = { specified = { v_pct = [97.0, 99.0, 101.0], q_pct = [100.0, 0.0, 0.0] } }",
        );
        let err = TestConfig::from_toml_str(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::Curve { .. }));
    }

    #[test]
    fn test_power_factor_plan_is_single_setpoint() {
        let config = TestConfig::from_toml_str(&base_toml()).unwrap();
        let plan = config.tests[2].plan(&config, 1.0).unwrap();
        assert_eq!(plan.setpoints, vec![120.0]);
        assert_eq!(plan.directions, vec![SweepDirection::Up]);
        assert_eq!(plan.fixed_pf, Some(0.85));
        assert_eq!(plan.curve.evaluate(120.0), 0.85);
    }

    #[test]
    fn test_invalid_power_level_rejected() {
        let toml = base_toml().replace("fraction = 1.0", "fraction = 1.5");
        let err = TestConfig::from_toml_str(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
