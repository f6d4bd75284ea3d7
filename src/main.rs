//! # droopcert CLI
//!
//! Command-line front end for the certification engine. Runs execute against
//! the built-in simulated bench, so a test matrix can be exercised end to end
//! before any hardware is on the floor.
//!
//! ## Usage
//!
//! ```bash
//! # Validate a test matrix and print the resolved sweep plans
//! droopcert check cert.toml
//!
//! # Execute a test matrix against the simulated bench
//! droopcert run cert.toml -o results
//!
//! # Run the built-in demo matrix (all four functions)
//! droopcert demo -o demo_results
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use droopcert::config::{TestConfig, TestDef};
use droopcert::recorder::ResultRecorder;
use droopcert::sequencer::{Instruments, TestSequencer};
use droopcert::sim::{SimBench, SimBenchConfig, SimHysteresis, SimHysteresisMode};

/// droopcert - Grid-Support Droop Function Certification
#[derive(Parser)]
#[command(name = "droopcert")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v for info, -vv for debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a test matrix against the simulated bench
    Run {
        /// Test matrix TOML file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        /// Output directory for result artifacts
        #[arg(short, long, default_value = "results")]
        out: PathBuf,
    },

    /// Validate a test matrix and print the resolved sweep plans
    Check {
        /// Test matrix TOML file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },

    /// Run the built-in demo matrix covering all four functions
    Demo {
        /// Output directory for result artifacts
        #[arg(short, long, default_value = "demo_results")]
        out: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    match cli.command {
        Commands::Run { config, out } => run_matrix(&config, &out),
        Commands::Check { config } => check_matrix(&config),
        Commands::Demo { out } => run_demo(&out),
    }
}

/// Load a test matrix and execute it on the simulated bench.
fn run_matrix(config_path: &Path, out: &Path) -> Result<()> {
    let config = TestConfig::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    execute_on_sim(config, out)
}

/// Validate a matrix and print every resolved (test, power level) plan.
fn check_matrix(config_path: &Path) -> Result<()> {
    let config = TestConfig::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    println!("configuration '{}' is valid", config.name);
    for test in &config.tests {
        for level in &config.power_levels {
            let plan = test.plan(&config, level.fraction)?;
            println!(
                "  {} @ {:.0}% power: {} setpoints x {} directions x {} iterations",
                plan.test_label,
                level.fraction * 100.0,
                plan.setpoints.len(),
                plan.directions.len(),
                level.repetitions
            );
        }
    }
    Ok(())
}

/// Demo matrix: one test of each function against a 3 kW single-phase EUT.
const DEMO_CONFIG: &str = r#"
    name = "droopcert_demo"

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
    repetitions = 1

    [[power_levels]]
    fraction = 0.5
    repetitions = 1

    [volt_var]
    q_max_over = 1500.0
    q_max_under = 1500.0
    k_var_max = 500.0
    deadband_min = 2.0
    deadband_max = 6.0

    [[tests]]
    function = "fixed_power_factor"
    label = "spf_085"
    pf = 0.85

    [[tests]]
    function = "volt_var"
    label = "vv_most_aggressive"
    shape = "most_aggressive"

    [[tests]]
    function = "freq_watt"
    label = "fw_parametric"

    [tests.mode.parametric]
    f_start = 60.5
    k_pf = 50.0

    [[tests]]
    function = "volt_watt"
    label = "vw_hysteresis"
    v_start = 123.6
    k_power_volt = 20.0

    [tests.hysteresis]
    v_stop = 122.0
    t_return = 5.0
    ramp_rate = 10.0
"#;

fn run_demo(out: &Path) -> Result<()> {
    let config = TestConfig::from_toml_str(DEMO_CONFIG).context("demo configuration")?;
    execute_on_sim(config, out)
}

fn execute_on_sim(config: TestConfig, out: &Path) -> Result<()> {
    let bench = SimBench::new(SimBenchConfig {
        p_rated: config.eut.p_rated,
        v_nom: config.eut.v_nom,
        f_nom: config.eut.f_nom,
        phases: config.eut.phases,
    });
    if let Some(hysteresis) = conforming_hysteresis(&config) {
        bench.set_hysteresis(Some(hysteresis));
    }
    let instruments = Instruments {
        grid: Box::new(bench.grid()),
        source: Box::new(bench.source()),
        daq: Box::new(bench.daq()),
        eut: Box::new(bench.eut()),
        clock: Box::new(bench.clock()),
    };
    let recorder = ResultRecorder::create(out, &config.name)?;
    info!("writing artifacts to {}", out.display());

    let report = TestSequencer::new(config, instruments, recorder).run()?;
    println!(
        "{}: {} sweeps, {} points, {} failures",
        report.verdict, report.sweeps, report.points, report.failures
    );
    println!("results in {}", out.display());
    Ok(())
}

/// Configure the simulated EUT to honor the first volt-watt hysteresis
/// definition in the matrix, latching fully curtailed at the full-power
/// curve stop.
fn conforming_hysteresis(config: &TestConfig) -> Option<SimHysteresis> {
    config.tests.iter().find_map(|test| match test {
        TestDef::VoltWatt {
            v_start,
            k_power_volt,
            hysteresis: Some(h),
            ..
        } => Some(SimHysteresis {
            v_curtail: (v_start + 100.0 / k_power_volt).min(config.eut.v_max),
            v_stop: h.v_stop,
            t_return: h.t_return,
            ramp_rate: h.ramp_rate,
            mode: SimHysteresisMode::Conforming,
        }),
        _ => None,
    })
}
