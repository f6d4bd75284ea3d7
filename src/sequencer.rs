//! # Certification Sequencer
//!
//! Drives a full certification run: for every configured droop function and
//! power level, resolves a [`SweepPlan`], configures the EUT, and executes
//! the planned iterations in each direction. Each sweep commands the
//! setpoints in order, waits out the settling time, scores one measurement
//! per setpoint against its acceptance band, and writes the captured dataset
//! and summary rows through the [`ResultRecorder`].
//!
//! A missing measurement channel is recoverable: the point fails with an
//! explicit reason and the sweep continues. Everything else (an instrument
//! command rejected, an artifact that cannot be written) is fatal. In both
//! cases teardown runs unconditionally: the grid returns to nominal, the
//! input source returns to rated power, and every collaborator is released.

use log::{debug, info, warn};

use crate::band::{band_at, Band};
use crate::config::{HysteresisSpec, SweepPlan, TestConfig};
use crate::error::CertError;
use crate::instrument::{
    channels, ChannelValue, Clock, Daq, EquipmentError, EutControl, GridSimulator, Reading,
    ResponseKind, SourceSimulator, StimulusKind,
};
use crate::recorder::{
    FailReason, PointOutcome, ResultRecorder, RunId, RunReport, Sample, TestPointResult, TestRun,
};
use crate::sweep::{ordered_for, SweepDirection};

/// The collaborator set a run drives. Boxed so real instruments and the
/// simulated bench plug in interchangeably.
pub struct Instruments {
    /// AC stimulus source.
    pub grid: Box<dyn GridSimulator>,
    /// Input source feeding the EUT.
    pub source: Box<dyn SourceSimulator>,
    /// Data-acquisition system.
    pub daq: Box<dyn Daq>,
    /// EUT communication layer.
    pub eut: Box<dyn EutControl>,
    /// Time source for settling waits and the ramp check.
    pub clock: Box<dyn Clock>,
}

/// Executes one certification run against a validated configuration.
pub struct TestSequencer {
    config: TestConfig,
    instruments: Instruments,
    recorder: ResultRecorder,
}

impl TestSequencer {
    /// Bind a validated configuration to a collaborator set and a recorder.
    pub fn new(config: TestConfig, instruments: Instruments, recorder: ResultRecorder) -> Self {
        Self {
            config,
            instruments,
            recorder,
        }
    }

    /// Run the full test matrix. Teardown happens whether or not the matrix
    /// completes; the report is only produced on a clean run.
    pub fn run(mut self) -> Result<RunReport, CertError> {
        let outcome = self.execute();
        self.teardown();
        outcome?;
        Ok(self.recorder.finish()?)
    }

    fn execute(&mut self) -> Result<(), CertError> {
        let eut = self.config.eut.clone();
        info!(
            "starting run '{}': {} tests x {} power levels",
            self.config.name,
            self.config.tests.len(),
            self.config.power_levels.len()
        );
        self.instruments.grid.set_frequency(eut.f_nom)?;
        self.instruments
            .grid
            .set_voltage(eut.v_nom * eut.grid_scale())?;
        self.instruments.source.set_power(eut.p_rated)?;
        self.instruments.source.power_on()?;

        let tests = self.config.tests.clone();
        let levels = self.config.power_levels.clone();
        for test in &tests {
            for level in &levels {
                let plan = test.plan(&self.config, level.fraction)?;
                self.configure_eut(&plan)?;
                self.instruments
                    .source
                    .set_power(eut.p_rated * level.fraction / level.efficiency)?;
                for iteration in 1..=level.repetitions {
                    for &direction in &plan.directions {
                        let id = RunId {
                            test_name: plan.test_label.clone(),
                            power_level: level.fraction,
                            iteration,
                            direction,
                        };
                        let run = self.run_sweep(&plan, id)?;
                        self.recorder.record_run(&run)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn configure_eut(&mut self, plan: &SweepPlan) -> Result<(), EquipmentError> {
        if let Some(pf) = plan.fixed_pf {
            self.instruments.eut.set_fixed_pf(true, pf)?;
        }
        if let Some(spec) = &plan.eut_curve {
            self.instruments
                .eut
                .apply_curve(1, &spec.points, spec.independent, spec.dept_ref)?;
            self.instruments.eut.enable_function(true)?;
        }
        for (key, value) in self.instruments.eut.read_settings()? {
            debug!("EUT setting {} = {}", key, value);
        }
        Ok(())
    }

    /// Execute one sweep and write its dataset. On a hysteresis plan's
    /// downward pass, the EUT enters the pass fully curtailed: points above
    /// the release voltage must hold at zero, the first point at or below it
    /// runs the timed return-ramp check, and the remainder are scored
    /// normally.
    fn run_sweep(&mut self, plan: &SweepPlan, id: RunId) -> Result<TestRun, CertError> {
        info!(
            "sweep '{}' at {}% power, iteration {}, {}",
            id.test_name,
            id.power_level * 100.0,
            id.iteration,
            id.direction
        );
        let setpoints = ordered_for(&plan.setpoints, id.direction);
        let settle = self.config.sweep.settling_time * plan.settle_multiplier;
        let hysteresis = match id.direction {
            SweepDirection::Down => plan.hysteresis.clone(),
            SweepDirection::Up => None,
        };

        self.instruments.daq.start_capture()?;
        let mut points = Vec::with_capacity(setpoints.len());
        let mut prev: Option<f64> = None;
        let mut ramp_checked = false;
        for &setpoint in &setpoints {
            self.command_stimulus(plan.stimulus, setpoint)?;
            self.instruments.daq.set_scratch(
                plan.stimulus.target_channel(),
                Some(ChannelValue::Number(setpoint)),
            );

            let point = match &hysteresis {
                Some(spec) if setpoint > spec.v_stop => {
                    // Held curtailed until the release voltage; the captured
                    // target is the curtailed zero, not the curve value.
                    let band = Band {
                        target: 0.0,
                        lower: -plan.msa.dependent,
                        upper: plan.msa.dependent,
                    };
                    self.set_response_target(plan, band.target);
                    self.instruments.clock.sleep(settle);
                    self.measure_point(plan, setpoint, Some(band))?
                }
                Some(spec) if !ramp_checked && prev.map_or(false, |p| p > spec.v_stop) => {
                    ramp_checked = true;
                    self.set_response_target(plan, plan.curve.evaluate(setpoint));
                    self.check_return_ramp(plan, spec, setpoint)?
                }
                _ => {
                    self.set_response_target(plan, plan.curve.evaluate(setpoint));
                    self.instruments.clock.sleep(settle);
                    self.measure_point(plan, setpoint, None)?
                }
            };
            self.clear_scratch(plan);
            points.push(point);
            prev = Some(setpoint);
        }
        self.instruments.daq.stop_capture()?;
        let dataset = self.instruments.daq.take_dataset();
        let dataset_file = format!("{}.csv", id.file_stem());
        self.recorder.write_dataset(&dataset_file, &dataset)?;
        Ok(TestRun {
            id,
            dataset_file,
            points,
        })
    }

    /// Sample once, aggregate the phases, and score the response against the
    /// acceptance band at the measured stimulus value. A missing channel
    /// produces a failed point with no sample; the run continues.
    fn measure_point(
        &mut self,
        plan: &SweepPlan,
        setpoint: f64,
        band_override: Option<Band>,
    ) -> Result<TestPointResult, CertError> {
        self.instruments.daq.sample()?;
        let reading = self.instruments.daq.read_last()?;
        let n = self.config.eut.phases.count();
        let p_rated = self.config.eut.p_rated;
        let measured = phase_mean(&reading, plan.stimulus.measurement_channels(), n)
            .and_then(|x| response_value(&reading, plan.response, n, p_rated).map(|y| (x, y)));
        let (x, y) = match measured {
            Ok(pair) => pair,
            Err(channel) => {
                warn!("no data on {} at setpoint {:.3}", channel, setpoint);
                let band =
                    band_override.unwrap_or_else(|| band_at(&plan.curve, setpoint, plan.msa));
                return Ok(TestPointResult {
                    setpoint,
                    band,
                    sample: None,
                    outcome: PointOutcome::Fail,
                    reason: Some(FailReason::NoData { channel }),
                });
            }
        };
        let band = band_override.unwrap_or_else(|| band_at(&plan.curve, x, plan.msa));
        let passed = band.contains(y);
        debug!(
            "setpoint {:.3}: x={:.3} y={:.3} band [{:.1}, {:.1}] -> {}",
            setpoint,
            x,
            y,
            band.lower,
            band.upper,
            if passed { "pass" } else { "fail" }
        );

        let daq = &mut self.instruments.daq;
        daq.set_scratch(
            plan.stimulus.actual_channel(),
            Some(ChannelValue::Number(x)),
        );
        daq.set_scratch(
            plan.response.actual_channel(),
            Some(ChannelValue::Number(y)),
        );
        daq.set_scratch(
            plan.response.min_channel(),
            Some(ChannelValue::Number(band.lower)),
        );
        daq.set_scratch(
            plan.response.max_channel(),
            Some(ChannelValue::Number(band.upper)),
        );
        daq.set_scratch(
            channels::EVENT,
            Some(ChannelValue::Text(
                if passed { "point_pass" } else { "point_fail" }.to_string(),
            )),
        );
        daq.sample()?;

        Ok(TestPointResult {
            setpoint,
            band,
            sample: Some(Sample {
                elapsed: reading.elapsed,
                independent: x,
                dependent: y,
            }),
            outcome: if passed {
                PointOutcome::Pass
            } else {
                PointOutcome::Fail
            },
            reason: if passed {
                None
            } else {
                Some(FailReason::OutOfBand)
            },
        })
    }

    /// Timed return-ramp check at the release crossing. Polls the active
    /// power through the return window: before the return delay it must stay
    /// within the power accuracy of zero, afterwards it must track
    /// `rate * (t - t_return)` within the power and timing accuracies,
    /// clamped at the expected plateau. The final settled measurement is
    /// scored against the curve like any other point.
    fn check_return_ramp(
        &mut self,
        plan: &SweepPlan,
        spec: &HysteresisSpec,
        setpoint: f64,
    ) -> Result<TestPointResult, CertError> {
        let settling = self.config.sweep.settling_time;
        let poll = self.config.sweep.poll_interval;
        let t_msa = self.config.accuracy.time;
        let p_msa = plan.msa.dependent;
        let n = self.config.eut.phases.count();
        let p_rated = self.config.eut.p_rated;
        let expected = plan.curve.evaluate(setpoint).min(spec.plateau_pct);
        let window = 2.0 * settling + spec.t_return + expected / spec.ramp_rate;
        info!(
            "return ramp check at {:.3}: t_return {:.1}s, rate {:.1}%/s, window {:.1}s",
            setpoint, spec.t_return, spec.ramp_rate, window
        );

        self.instruments.daq.set_scratch(
            channels::EVENT,
            Some(ChannelValue::Text("return_ramp_check".to_string())),
        );
        let start = self.instruments.clock.now();
        let mut reason: Option<FailReason> = None;
        loop {
            let elapsed = self.instruments.clock.now() - start;
            if elapsed > window {
                break;
            }
            self.instruments.daq.sample()?;
            let reading = self.instruments.daq.read_last()?;
            let p_pct = match response_value(&reading, ResponseKind::ActivePowerPct, n, p_rated) {
                Ok(v) => v,
                Err(channel) => {
                    reason.get_or_insert(FailReason::NoData { channel });
                    break;
                }
            };
            if elapsed < spec.t_return - t_msa {
                if p_pct > p_msa {
                    reason.get_or_insert(FailReason::EarlyRise);
                }
            } else {
                let ramp_elapsed = elapsed - spec.t_return;
                let low =
                    (spec.ramp_rate * (ramp_elapsed - t_msa)).clamp(0.0, expected) - p_msa;
                let high =
                    (spec.ramp_rate * (ramp_elapsed + t_msa)).clamp(0.0, expected) + p_msa;
                if p_pct < low || p_pct > high {
                    reason.get_or_insert(FailReason::RampDeviation);
                }
            }
            self.instruments.clock.sleep(poll);
        }

        // Settled plateau, scored like a normal point unless the ramp failed.
        self.instruments
            .clock
            .sleep(settling * plan.settle_multiplier);
        let mut point = self.measure_point(plan, setpoint, None)?;
        if let Some(r) = reason {
            point.outcome = PointOutcome::Fail;
            point.reason = Some(r);
        }
        Ok(point)
    }

    fn command_stimulus(
        &mut self,
        kind: StimulusKind,
        setpoint: f64,
    ) -> Result<(), EquipmentError> {
        match kind {
            StimulusKind::Voltage => self
                .instruments
                .grid
                .set_voltage(setpoint * self.config.eut.grid_scale()),
            StimulusKind::Frequency => self.instruments.grid.set_frequency(setpoint),
        }
    }

    fn set_response_target(&mut self, plan: &SweepPlan, target: f64) {
        self.instruments.daq.set_scratch(
            plan.response.target_channel(),
            Some(ChannelValue::Number(target)),
        );
    }

    fn clear_scratch(&mut self, plan: &SweepPlan) {
        let daq = &mut self.instruments.daq;
        daq.set_scratch(plan.stimulus.target_channel(), None);
        daq.set_scratch(plan.stimulus.actual_channel(), None);
        daq.set_scratch(plan.response.target_channel(), None);
        daq.set_scratch(plan.response.actual_channel(), None);
        daq.set_scratch(plan.response.min_channel(), None);
        daq.set_scratch(plan.response.max_channel(), None);
        daq.set_scratch(channels::EVENT, None);
    }

    /// Return the bench to a safe state and release every collaborator.
    /// Failures here are logged, never propagated.
    fn teardown(&mut self) {
        let eut = &self.config.eut;
        if let Err(e) = self.instruments.eut.enable_function(false) {
            warn!("teardown: disable function: {}", e);
        }
        if let Err(e) = self
            .instruments
            .grid
            .set_voltage(eut.v_nom * eut.grid_scale())
        {
            warn!("teardown: restore voltage: {}", e);
        }
        if let Err(e) = self.instruments.grid.set_frequency(eut.f_nom) {
            warn!("teardown: restore frequency: {}", e);
        }
        if let Err(e) = self.instruments.source.set_power(eut.p_rated) {
            warn!("teardown: restore source power: {}", e);
        }
        if let Err(e) = self.instruments.eut.close() {
            warn!("teardown: close EUT link: {}", e);
        }
        if let Err(e) = self.instruments.daq.close() {
            warn!("teardown: close DAQ: {}", e);
        }
        if let Err(e) = self.instruments.source.close() {
            warn!("teardown: close source: {}", e);
        }
        if let Err(e) = self.instruments.grid.close() {
            warn!("teardown: close grid simulator: {}", e);
        }
        info!("teardown complete");
    }
}

/// Mean of the first `n` per-phase channels. Err carries the missing channel.
fn phase_mean(reading: &Reading, chans: &[&'static str; 3], n: usize) -> Result<f64, String> {
    let mut sum = 0.0;
    for &name in chans.iter().take(n) {
        sum += reading.get(name).ok_or_else(|| name.to_string())?;
    }
    Ok(sum / n as f64)
}

/// Sum of the first `n` per-phase channels. Err carries the missing channel.
fn phase_sum(reading: &Reading, chans: &[&'static str; 3], n: usize) -> Result<f64, String> {
    let mut sum = 0.0;
    for &name in chans.iter().take(n) {
        sum += reading.get(name).ok_or_else(|| name.to_string())?;
    }
    Ok(sum)
}

/// Aggregate the response quantity in the units the plan scores.
fn response_value(
    reading: &Reading,
    response: ResponseKind,
    n: usize,
    p_rated: f64,
) -> Result<f64, String> {
    let chans = response.measurement_channels();
    match response {
        ResponseKind::ReactivePower => phase_sum(reading, chans, n),
        ResponseKind::ActivePowerPct => {
            phase_sum(reading, chans, n).map(|w| w.abs() / p_rated * 100.0)
        }
        ResponseKind::PowerFactor => phase_mean(reading, chans, n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBench, SimBenchConfig, SimHysteresis, SimHysteresisMode};
    use crate::instrument::Phases;
    use tempfile::tempdir;

    fn bench() -> SimBench {
        SimBench::new(SimBenchConfig {
            p_rated: 3000.0,
            v_nom: 120.0,
            f_nom: 60.0,
            phases: Phases::Single,
        })
    }

    fn instruments(bench: &SimBench) -> Instruments {
        Instruments {
            grid: Box::new(bench.grid()),
            source: Box::new(bench.source()),
            daq: Box::new(bench.daq()),
            eut: Box::new(bench.eut()),
            clock: Box::new(bench.clock()),
        }
    }

    fn config(tests_toml: &str) -> TestConfig {
        let toml = format!(
            r#"
                name = "sim_cert"

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
                voltage = 0.0
                frequency = 0.0
                active_power = 10.0
                reactive_power = 10.0

                [sweep]
                settling_time = 1.0

                [[power_levels]]
                fraction = 1.0
                repetitions = 1

                [volt_var]
                q_max_over = 1500.0
                q_max_under = 1500.0
                k_var_max = 500.0
                deadband_min = 2.0
                deadband_max = 6.0

                {}
            "#,
            tests_toml
        );
        TestConfig::from_toml_str(&toml).unwrap()
    }

    fn volt_var_toml() -> &'static str {
        r#"
            [[tests]]
            function = "volt_var"
            label = "vv_ma"
            shape = "most_aggressive"
        "#
    }

    fn volt_watt_hysteresis_toml() -> &'static str {
        r#"
            [[tests]]
            function = "volt_watt"
            label = "vw_hyst"
            v_start = 123.6
            k_power_volt = 20.0

            [tests.hysteresis]
            v_stop = 122.0
            t_return = 5.0
            ramp_rate = 10.0
        "#
    }

    fn sim_hysteresis(mode: SimHysteresisMode) -> SimHysteresis {
        SimHysteresis {
            // Full curtailment latches at the curve stop: 123.6 + 100/20.
            v_curtail: 128.6,
            v_stop: 122.0,
            t_return: 5.0,
            ramp_rate: 10.0,
            mode,
        }
    }

    #[test]
    fn test_volt_var_run_passes_end_to_end() {
        let dir = tempdir().unwrap();
        let bench = bench();
        let config = config(volt_var_toml());
        let recorder = ResultRecorder::create(dir.path(), &config.name).unwrap();
        let sequencer = TestSequencer::new(config, instruments(&bench), recorder);

        let report = sequencer.run().unwrap();
        // Up and down passes over a 6-breakpoint curve with 3 interior
        // points per segment: 21 points each.
        assert_eq!(report.sweeps, 2);
        assert_eq!(report.points, 42);
        assert_eq!(report.failures, 0);
        assert_eq!(report.verdict, "Pass");
        assert!(dir.path().join("vv_ma_100_up_1.csv").exists());
        assert!(dir.path().join("vv_ma_100_down_1.csv").exists());
        assert!(bench.all_closed());
    }

    #[test]
    fn test_missing_channel_fails_points_but_run_completes() {
        let dir = tempdir().unwrap();
        let bench = bench();
        bench.drop_channel("AC_Q_1");
        let config = config(volt_var_toml());
        let recorder = ResultRecorder::create(dir.path(), &config.name).unwrap();
        let sequencer = TestSequencer::new(config, instruments(&bench), recorder);

        let report = sequencer.run().unwrap();
        assert_eq!(report.failures, report.points);
        assert_eq!(report.verdict, "Fail");
        let text =
            std::fs::read_to_string(dir.path().join("result_summary.csv")).unwrap();
        assert!(text.contains("no data (AC_Q_1)"));
    }

    #[test]
    fn test_equipment_fault_aborts_but_tears_down() {
        let dir = tempdir().unwrap();
        let bench = bench();
        bench.fail_next_voltage_command();
        let config = config(volt_var_toml());
        let recorder = ResultRecorder::create(dir.path(), &config.name).unwrap();
        let sequencer = TestSequencer::new(config, instruments(&bench), recorder);

        let err = sequencer.run().unwrap_err();
        assert!(matches!(err, CertError::Equipment(_)));
        assert!(bench.all_closed());
        // Teardown restored nominal conditions after the fault.
        assert_eq!(bench.voltage(), 120.0);
        assert_eq!(bench.source_power(), 3000.0);
    }

    #[test]
    fn test_hysteresis_conforming_run_passes() {
        let dir = tempdir().unwrap();
        let bench = bench();
        bench.set_hysteresis(Some(sim_hysteresis(SimHysteresisMode::Conforming)));
        let config = config(volt_watt_hysteresis_toml());
        let recorder = ResultRecorder::create(dir.path(), &config.name).unwrap();
        let sequencer = TestSequencer::new(config, instruments(&bench), recorder);

        let report = sequencer.run().unwrap();
        // 4-breakpoint curve, 3 segments, 13 points per direction.
        assert_eq!(report.points, 26);
        assert_eq!(report.failures, 0);
        assert_eq!(report.verdict, "Pass");
    }

    #[test]
    fn test_curtailed_points_annotate_zero_target() {
        let dir = tempdir().unwrap();
        let bench = bench();
        bench.set_hysteresis(Some(sim_hysteresis(SimHysteresisMode::Conforming)));
        let config = config(volt_watt_hysteresis_toml());
        let recorder = ResultRecorder::create(dir.path(), &config.name).unwrap();
        let sequencer = TestSequencer::new(config, instruments(&bench), recorder);
        sequencer.run().unwrap();

        let mut reader =
            csv::Reader::from_path(dir.path().join("vw_hyst_100_down_1.csv")).unwrap();
        let headers = reader.headers().unwrap().clone();
        let v_target = headers.iter().position(|h| h == "V_TARGET").unwrap();
        let p_target = headers.iter().position(|h| h == "P_TARGET").unwrap();
        let mut curtailed_rows = 0;
        for row in reader.records() {
            let row = row.unwrap();
            let Ok(v) = row[v_target].parse::<f64>() else {
                continue;
            };
            let p: f64 = row[p_target].parse().unwrap();
            if v > 122.0 {
                // Held curtailed: the captured target is zero, not the
                // curve value at the setpoint.
                assert_eq!(p, 0.0, "setpoint {}", v);
                curtailed_rows += 1;
            } else if v == 108.0 {
                assert_eq!(p, 100.0);
            }
        }
        assert!(curtailed_rows > 0);
    }

    #[test]
    fn test_hysteresis_early_rise_fails_crossing_point() {
        let dir = tempdir().unwrap();
        let bench = bench();
        bench.set_hysteresis(Some(sim_hysteresis(SimHysteresisMode::RisesEarly)));
        let config = config(volt_watt_hysteresis_toml());
        let recorder = ResultRecorder::create(dir.path(), &config.name).unwrap();
        let sequencer = TestSequencer::new(config, instruments(&bench), recorder);

        let report = sequencer.run().unwrap();
        assert_eq!(report.verdict, "Fail");
        assert_eq!(report.failures, 1);
        let text =
            std::fs::read_to_string(dir.path().join("result_summary.csv")).unwrap();
        assert!(text.contains("power rose before return delay"));
    }
}
