//! # Simulated Test Bench
//!
//! A deterministic, in-process implementation of every instrument
//! collaborator, sharing one bench state: grid stimulus, input source, DAQ,
//! EUT control, and a simulated clock whose sleeps advance instantly. The
//! simulated EUT tracks whatever droop curve was loaded into it, so a
//! conforming configuration produces an all-pass certification run.
//!
//! The bench also supports targeted misbehavior for exercising the failure
//! paths: dropping a measurement channel (recoverable per-point failure),
//! failing a stimulus command (fatal equipment fault), and violating the
//! volt-watt return delay (hysteresis check failure).

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;

use crate::curve::{Breakpoint, Curve};
use crate::instrument::{
    channels, ChannelValue, Clock, Daq, Dataset, DatasetRow, DependentRef, EquipmentError,
    EutControl, GridSimulator, Phases, Reading, SourceSimulator, StimulusKind,
};

/// Ratings of the simulated bench.
#[derive(Debug, Clone)]
pub struct SimBenchConfig {
    /// Rated active power of the simulated EUT in watts.
    pub p_rated: f64,
    /// Nominal grid voltage in volts.
    pub v_nom: f64,
    /// Nominal grid frequency in hertz.
    pub f_nom: f64,
    /// Number of AC phases presented.
    pub phases: Phases,
}

/// How the simulated EUT honors the volt-watt return delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimHysteresisMode {
    /// Waits out the return delay, then ramps at the configured rate.
    Conforming,
    /// Starts ramping immediately after the release crossing.
    RisesEarly,
}

/// Return-to-normal behavior of the simulated EUT.
#[derive(Debug, Clone)]
pub struct SimHysteresis {
    /// Voltage at or above which output latches fully curtailed.
    pub v_curtail: f64,
    /// Voltage below which curtailment releases.
    pub v_stop: f64,
    /// Delay before output begins returning, in seconds.
    pub t_return: f64,
    /// Return ramp rate in percent of rated power per second.
    pub ramp_rate: f64,
    /// Conforming or deliberately early.
    pub mode: SimHysteresisMode,
}

#[derive(Debug, Clone)]
enum SimFunction {
    Off,
    Droop {
        curve: Curve,
        independent: StimulusKind,
        dept_ref: DependentRef,
        enabled: bool,
    },
    FixedPf {
        pf: f64,
        enabled: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum HysPhase {
    Inactive,
    Curtailed,
    Releasing { released_at: f64 },
}

#[derive(Debug)]
struct BenchState {
    cfg: SimBenchConfig,
    now: f64,
    voltage: f64,
    frequency: f64,
    source_power: f64,
    powered_on: bool,
    function: SimFunction,
    capturing: bool,
    rows: Vec<DatasetRow>,
    scratch: BTreeMap<String, ChannelValue>,
    dropped: HashSet<String>,
    hysteresis: Option<SimHysteresis>,
    hys_phase: HysPhase,
    fail_next_voltage: bool,
    grid_closed: bool,
    source_closed: bool,
    daq_closed: bool,
    eut_closed: bool,
}

impl BenchState {
    /// Active power output in percent of rated, honoring the droop curve,
    /// the available input power, and any hysteresis state.
    fn watt_pct(&self) -> f64 {
        if !self.powered_on {
            return 0.0;
        }
        let available_pct = (self.source_power / self.cfg.p_rated * 100.0).min(100.0);
        let curve_pct = match &self.function {
            SimFunction::Droop {
                curve,
                independent,
                dept_ref: DependentRef::WattMaxPct,
                enabled: true,
            } => {
                let stimulus = match independent {
                    StimulusKind::Voltage => self.voltage,
                    StimulusKind::Frequency => self.frequency,
                };
                curve.evaluate(stimulus)
            }
            _ => 100.0,
        };
        let base = curve_pct.min(available_pct);
        match (&self.hysteresis, self.hys_phase) {
            (Some(_), HysPhase::Curtailed) => 0.0,
            (Some(h), HysPhase::Releasing { released_at }) => {
                let start = match h.mode {
                    SimHysteresisMode::Conforming => released_at + h.t_return,
                    SimHysteresisMode::RisesEarly => released_at,
                };
                if self.now < start {
                    0.0
                } else {
                    (h.ramp_rate * (self.now - start)).min(base)
                }
            }
            _ => base,
        }
    }

    /// Reactive power output in vars.
    fn var_output(&self) -> f64 {
        match &self.function {
            SimFunction::Droop {
                curve,
                dept_ref: DependentRef::VarAvailPct | DependentRef::VarMaxPct,
                enabled: true,
                ..
            } => curve.evaluate(self.voltage),
            _ => 0.0,
        }
    }

    fn power_factor(&self) -> f64 {
        match &self.function {
            SimFunction::FixedPf { pf, enabled: true } => *pf,
            _ => 1.0,
        }
    }

    fn measurements(&self) -> BTreeMap<String, f64> {
        let n = self.cfg.phases.count();
        let watts = self.watt_pct() / 100.0 * self.cfg.p_rated;
        let vars = self.var_output();
        let pf = self.power_factor();
        let mut values = BTreeMap::new();
        for i in 0..n {
            values.insert(channels::AC_VRMS[i].to_string(), self.voltage);
            values.insert(channels::AC_FREQ[i].to_string(), self.frequency);
            values.insert(channels::AC_P[i].to_string(), watts / n as f64);
            values.insert(channels::AC_Q[i].to_string(), vars / n as f64);
            values.insert(channels::AC_PF[i].to_string(), pf);
        }
        for name in &self.dropped {
            values.remove(name);
        }
        values
    }

    fn update_hysteresis_phase(&mut self) {
        let Some(h) = &self.hysteresis else {
            self.hys_phase = HysPhase::Inactive;
            return;
        };
        if self.voltage >= h.v_curtail {
            self.hys_phase = HysPhase::Curtailed;
        } else if self.hys_phase == HysPhase::Curtailed && self.voltage < h.v_stop {
            self.hys_phase = HysPhase::Releasing {
                released_at: self.now,
            };
        }
    }
}

/// Shared handle to the simulated bench. Clones share state.
#[derive(Clone)]
pub struct SimBench {
    state: Rc<RefCell<BenchState>>,
}

impl SimBench {
    /// Create a bench at nominal voltage and frequency, powered off.
    pub fn new(cfg: SimBenchConfig) -> Self {
        let state = BenchState {
            voltage: cfg.v_nom,
            frequency: cfg.f_nom,
            cfg,
            now: 0.0,
            source_power: 0.0,
            powered_on: false,
            function: SimFunction::Off,
            capturing: false,
            rows: Vec::new(),
            scratch: BTreeMap::new(),
            dropped: HashSet::new(),
            hysteresis: None,
            hys_phase: HysPhase::Inactive,
            fail_next_voltage: false,
            grid_closed: false,
            source_closed: false,
            daq_closed: false,
            eut_closed: false,
        };
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    /// Grid stimulus handle.
    pub fn grid(&self) -> SimGrid {
        SimGrid {
            state: self.state.clone(),
        }
    }

    /// Input source handle.
    pub fn source(&self) -> SimSource {
        SimSource {
            state: self.state.clone(),
        }
    }

    /// DAQ handle.
    pub fn daq(&self) -> SimDaq {
        SimDaq {
            state: self.state.clone(),
        }
    }

    /// EUT control handle.
    pub fn eut(&self) -> SimEut {
        SimEut {
            state: self.state.clone(),
        }
    }

    /// Simulated clock handle; sleeps advance time instantly.
    pub fn clock(&self) -> SimClock {
        SimClock {
            state: self.state.clone(),
        }
    }

    /// Configure the simulated EUT's return-to-normal behavior.
    pub fn set_hysteresis(&self, hysteresis: Option<SimHysteresis>) {
        let mut state = self.state.borrow_mut();
        state.hysteresis = hysteresis;
        state.hys_phase = HysPhase::Inactive;
    }

    /// Remove a channel from all subsequent readings.
    pub fn drop_channel(&self, name: &str) {
        self.state.borrow_mut().dropped.insert(name.to_string());
    }

    /// Make the next voltage command fail with an equipment fault.
    pub fn fail_next_voltage_command(&self) {
        self.state.borrow_mut().fail_next_voltage = true;
    }

    /// Current commanded voltage.
    pub fn voltage(&self) -> f64 {
        self.state.borrow().voltage
    }

    /// Current commanded frequency.
    pub fn frequency(&self) -> f64 {
        self.state.borrow().frequency
    }

    /// Current commanded input power.
    pub fn source_power(&self) -> f64 {
        self.state.borrow().source_power
    }

    /// Whether every collaborator handle has been closed.
    pub fn all_closed(&self) -> bool {
        let s = self.state.borrow();
        s.grid_closed && s.source_closed && s.daq_closed && s.eut_closed
    }
}

/// Simulated grid stimulus.
pub struct SimGrid {
    state: Rc<RefCell<BenchState>>,
}

impl GridSimulator for SimGrid {
    fn set_voltage(&mut self, volts: f64) -> Result<(), EquipmentError> {
        let mut state = self.state.borrow_mut();
        if state.fail_next_voltage {
            state.fail_next_voltage = false;
            return Err(EquipmentError::device("grid simulator", "output stage trip"));
        }
        state.voltage = volts;
        state.update_hysteresis_phase();
        Ok(())
    }

    fn set_frequency(&mut self, hz: f64) -> Result<(), EquipmentError> {
        self.state.borrow_mut().frequency = hz;
        Ok(())
    }

    fn close(&mut self) -> Result<(), EquipmentError> {
        self.state.borrow_mut().grid_closed = true;
        Ok(())
    }
}

/// Simulated input source.
pub struct SimSource {
    state: Rc<RefCell<BenchState>>,
}

impl SourceSimulator for SimSource {
    fn set_power(&mut self, watts: f64) -> Result<(), EquipmentError> {
        self.state.borrow_mut().source_power = watts;
        Ok(())
    }

    fn power_on(&mut self) -> Result<(), EquipmentError> {
        self.state.borrow_mut().powered_on = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), EquipmentError> {
        self.state.borrow_mut().source_closed = true;
        Ok(())
    }
}

/// Simulated DAQ.
pub struct SimDaq {
    state: Rc<RefCell<BenchState>>,
}

impl Daq for SimDaq {
    fn start_capture(&mut self) -> Result<(), EquipmentError> {
        let mut state = self.state.borrow_mut();
        state.capturing = true;
        state.rows.clear();
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<(), EquipmentError> {
        self.state.borrow_mut().capturing = false;
        Ok(())
    }

    fn sample(&mut self) -> Result<(), EquipmentError> {
        let mut state = self.state.borrow_mut();
        if !state.capturing {
            return Ok(());
        }
        let mut values: BTreeMap<String, ChannelValue> = state
            .measurements()
            .into_iter()
            .map(|(k, v)| (k, ChannelValue::Number(v)))
            .collect();
        for (name, value) in &state.scratch {
            values.insert(name.clone(), value.clone());
        }
        let elapsed = state.now;
        state.rows.push(DatasetRow { elapsed, values });
        Ok(())
    }

    fn read_last(&mut self) -> Result<Reading, EquipmentError> {
        let state = self.state.borrow();
        Ok(Reading {
            elapsed: state.now,
            values: state.measurements(),
        })
    }

    fn set_scratch(&mut self, name: &str, value: Option<ChannelValue>) {
        let mut state = self.state.borrow_mut();
        match value {
            Some(v) => {
                state.scratch.insert(name.to_string(), v);
            }
            None => {
                state.scratch.remove(name);
            }
        }
    }

    fn take_dataset(&mut self) -> Dataset {
        Dataset {
            rows: std::mem::take(&mut self.state.borrow_mut().rows),
        }
    }

    fn close(&mut self) -> Result<(), EquipmentError> {
        self.state.borrow_mut().daq_closed = true;
        Ok(())
    }
}

/// Simulated EUT control channel.
pub struct SimEut {
    state: Rc<RefCell<BenchState>>,
}

impl EutControl for SimEut {
    fn apply_curve(
        &mut self,
        _curve_id: u32,
        points: &[Breakpoint],
        independent: StimulusKind,
        dept_ref: DependentRef,
    ) -> Result<(), EquipmentError> {
        let curve = Curve::from_points(points.to_vec())
            .map_err(|e| EquipmentError::device("EUT", format!("rejected curve: {}", e)))?;
        let mut state = self.state.borrow_mut();
        state.function = SimFunction::Droop {
            curve,
            independent,
            dept_ref,
            enabled: false,
        };
        // Reconfiguration clears any curtailment latch.
        state.hys_phase = HysPhase::Inactive;
        Ok(())
    }

    fn enable_function(&mut self, on: bool) -> Result<(), EquipmentError> {
        let mut state = self.state.borrow_mut();
        match &mut state.function {
            SimFunction::Droop { enabled, .. } => *enabled = on,
            SimFunction::FixedPf { enabled, .. } => *enabled = on,
            SimFunction::Off => {
                return Err(EquipmentError::device("EUT", "no function configured"));
            }
        }
        Ok(())
    }

    fn set_fixed_pf(&mut self, enabled: bool, pf: f64) -> Result<(), EquipmentError> {
        let mut state = self.state.borrow_mut();
        state.function = SimFunction::FixedPf { pf, enabled };
        state.hys_phase = HysPhase::Inactive;
        Ok(())
    }

    fn read_settings(&mut self) -> Result<BTreeMap<String, String>, EquipmentError> {
        let state = self.state.borrow();
        let mut settings = BTreeMap::new();
        match &state.function {
            SimFunction::Off => {
                settings.insert("function".to_string(), "off".to_string());
            }
            SimFunction::Droop {
                curve,
                dept_ref,
                enabled,
                ..
            } => {
                settings.insert("function".to_string(), "droop".to_string());
                settings.insert("enabled".to_string(), enabled.to_string());
                settings.insert("dept_ref".to_string(), dept_ref.to_string());
                settings.insert(
                    "points".to_string(),
                    format!("{}", curve.breakpoints().len()),
                );
            }
            SimFunction::FixedPf { pf, enabled } => {
                settings.insert("function".to_string(), "fixed_pf".to_string());
                settings.insert("enabled".to_string(), enabled.to_string());
                settings.insert("pf".to_string(), format!("{}", pf));
            }
        }
        Ok(settings)
    }

    fn close(&mut self) -> Result<(), EquipmentError> {
        self.state.borrow_mut().eut_closed = true;
        Ok(())
    }
}

/// Simulated clock: `sleep` advances bench time without blocking.
pub struct SimClock {
    state: Rc<RefCell<BenchState>>,
}

impl Clock for SimClock {
    fn now(&self) -> f64 {
        self.state.borrow().now
    }

    fn sleep(&mut self, seconds: f64) {
        if seconds > 0.0 {
            self.state.borrow_mut().now += seconds;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bench() -> SimBench {
        SimBench::new(SimBenchConfig {
            p_rated: 3000.0,
            v_nom: 120.0,
            f_nom: 60.0,
            phases: Phases::Single,
        })
    }

    #[test]
    fn test_eut_tracks_var_droop_curve() {
        let bench = bench();
        let mut grid = bench.grid();
        let mut source = bench.source();
        let mut eut = bench.eut();
        let mut daq = bench.daq();

        source.set_power(3000.0).unwrap();
        source.power_on().unwrap();
        eut.apply_curve(
            1,
            &[
                Breakpoint::new(116.0, 1500.0),
                Breakpoint::new(119.0, 0.0),
                Breakpoint::new(121.0, 0.0),
                Breakpoint::new(124.0, -1500.0),
            ],
            StimulusKind::Voltage,
            DependentRef::VarAvailPct,
        )
        .unwrap();
        eut.enable_function(true).unwrap();

        grid.set_voltage(117.5).unwrap();
        let reading = daq.read_last().unwrap();
        assert!((reading.get("AC_Q_1").unwrap() - 750.0).abs() < 1e-9);
    }

    #[test]
    fn test_watt_droop_limited_by_source() {
        let bench = bench();
        let mut grid = bench.grid();
        let mut source = bench.source();
        let mut eut = bench.eut();
        let mut daq = bench.daq();

        source.set_power(1000.0).unwrap();
        source.power_on().unwrap();
        eut.apply_curve(
            1,
            &[Breakpoint::new(123.6, 100.0), Breakpoint::new(128.6, 0.0)],
            StimulusKind::Voltage,
            DependentRef::WattMaxPct,
        )
        .unwrap();
        eut.enable_function(true).unwrap();

        grid.set_voltage(110.0).unwrap();
        let reading = daq.read_last().unwrap();
        // Curve allows 100% but the source only provides a third.
        assert!((reading.get("AC_P_1").unwrap() - 1000.0).abs() < 1e-9);

        grid.set_voltage(126.1).unwrap();
        let reading = daq.read_last().unwrap();
        // Mid-slope: 50% of rated exceeds the source limit as well.
        assert!((reading.get("AC_P_1").unwrap() - 1000.0).abs() < 1e-9);

        grid.set_voltage(128.0).unwrap();
        let reading = daq.read_last().unwrap();
        // Near the stop the curve is the binding limit: 12% of 3 kW.
        assert!((reading.get("AC_P_1").unwrap() - 360.0).abs() < 1.0);
    }

    #[test]
    fn test_hysteresis_holds_then_ramps() {
        let bench = bench();
        let mut grid = bench.grid();
        let mut source = bench.source();
        let mut eut = bench.eut();
        let mut daq = bench.daq();
        let mut clock = bench.clock();

        source.set_power(3000.0).unwrap();
        source.power_on().unwrap();
        eut.apply_curve(
            1,
            &[Breakpoint::new(123.6, 100.0), Breakpoint::new(128.6, 0.0)],
            StimulusKind::Voltage,
            DependentRef::WattMaxPct,
        )
        .unwrap();
        eut.enable_function(true).unwrap();
        bench.set_hysteresis(Some(SimHysteresis {
            v_curtail: 128.6,
            v_stop: 124.0,
            t_return: 5.0,
            ramp_rate: 10.0,
            mode: SimHysteresisMode::Conforming,
        }));

        // Drive into curtailment, then release.
        grid.set_voltage(130.0).unwrap();
        assert_eq!(daq.read_last().unwrap().get("AC_P_1").unwrap(), 0.0);
        grid.set_voltage(120.0).unwrap();

        // Still zero during the return delay.
        clock.sleep(3.0);
        assert_eq!(daq.read_last().unwrap().get("AC_P_1").unwrap(), 0.0);

        // 4 s into the ramp: 40% of rated.
        clock.sleep(6.0);
        let p = daq.read_last().unwrap().get("AC_P_1").unwrap();
        assert!((p - 1200.0).abs() < 1e-6);

        // Ramp completes and holds at the curve value.
        clock.sleep(20.0);
        let p = daq.read_last().unwrap().get("AC_P_1").unwrap();
        assert!((p - 3000.0).abs() < 1e-6);
    }

    #[test]
    fn test_dropped_channel_missing_from_reading() {
        let bench = bench();
        bench.drop_channel("AC_Q_1");
        let mut daq = bench.daq();
        let reading = daq.read_last().unwrap();
        assert!(reading.get("AC_Q_1").is_none());
        assert!(reading.get("AC_VRMS_1").is_some());
    }

    #[test]
    fn test_capture_includes_scratch_annotations() {
        let bench = bench();
        let mut daq = bench.daq();
        daq.start_capture().unwrap();
        daq.set_scratch("V_TARGET", Some(ChannelValue::Number(118.0)));
        daq.sample().unwrap();
        daq.set_scratch("V_TARGET", None);
        daq.sample().unwrap();
        daq.stop_capture().unwrap();

        let ds = daq.take_dataset();
        assert_eq!(ds.rows.len(), 2);
        assert!(ds.rows[0].values.contains_key("V_TARGET"));
        assert!(!ds.rows[1].values.contains_key("V_TARGET"));
    }
}
