//! ROTOR bench command-line driver.
//!
//! ```text
//! rotor_bench --config config/rotor_bench.toml --request /tmp/ROTOR_LAUNCH.txt
//! rotor_bench --simulate
//! ```
//!
//! The request file is consumed: it is deleted once read, as the launcher
//! expects. Without a request file the default by-Z scan runs.

use anyhow::{Context, Result};
use clap::Parser;
use rotor_bench::adapters::MockSensorPort;
use rotor_bench::config::{BenchConfig, DEFAULT_CONFIG_PATH};
use rotor_bench::hardware::gpio::open_bench_lines;
use rotor_bench::hardware::mock::{MockLimitSwitch, MockMotor};
use rotor_bench::hardware::BenchLines;
use rotor_bench::instrument::{SensorLink, SensorSettings};
use rotor_bench::scan::{Bench, ScanOrchestrator, ScanRequest, ScanSettings};
use rotor_bench::timing::{Clock, FakeClock, MonotonicClock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rotor_bench")]
#[command(about = "Magnetic field mapping on the ROTOR bench")]
#[command(version)]
struct Args {
    /// Bench configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Scan request written by the launcher (deleted after reading)
    #[arg(short, long, default_value = "/tmp/ROTOR_LAUNCH.txt")]
    request: PathBuf,

    /// Run against mock motors and a random sensor, without waiting
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = BenchConfig::load_from(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.application.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let request = load_request(&args.request)?;
    info!("Scan request: {:?}", request);

    let orchestrator = if args.simulate {
        simulated_bench(&config)?
    } else {
        hardware_bench(&config)?
    };

    let stop = orchestrator.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Ctrl-C received, motors released, stopping after the current step");
        stop.request();

        // A second Ctrl-C does not wait for the scan thread
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Second Ctrl-C, exiting");
            std::process::exit(130);
        }
    });

    let report = tokio::task::spawn_blocking(move || orchestrator.run(&request))
        .await
        .context("Scan task panicked")?
        .context("Scan failed")?;

    for file in &report.files {
        info!("Wrote {}", file.display());
    }
    info!(
        "Scan {:?}: {} data lines, Z homed {} times",
        report.outcome, report.data_lines, report.homes
    );
    Ok(())
}

fn load_request(path: &Path) -> Result<ScanRequest> {
    if !path.exists() {
        warn!("{} not found, using the default scan", path.display());
        return Ok(ScanRequest::default());
    }

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    std::fs::remove_file(path).with_context(|| format!("Failed to remove {}", path.display()))?;
    info!("Using request from {}", path.display());
    Ok(ScanRequest::parse(&text)?)
}

fn hardware_bench(config: &BenchConfig) -> Result<ScanOrchestrator> {
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());

    let lines = open_bench_lines(config).context("Failed to open GPIO lines")?;
    let mut sensor = SensorLink::open(&config.sensor, Arc::clone(&clock))
        .context("Failed to open the magnetometer")?;
    sensor
        .initialize()
        .context("Failed to configure the magnetometer")?;

    let bench = Bench::new(config, lines, sensor, Arc::clone(&clock));
    Ok(ScanOrchestrator::new(bench, ScanSettings::from(config), clock))
}

fn simulated_bench(config: &BenchConfig) -> Result<ScanOrchestrator> {
    info!("Simulated bench: no motor moves, random sensor values");
    let clock: Arc<dyn Clock> = Arc::new(FakeClock::new());

    let lines = BenchLines {
        shaft: MockMotor::new().lines(),
        z_axis: MockMotor::new().lines(),
        limit_switch: Box::new(MockLimitSwitch::pressed_after(50)),
    };
    let mut sensor = SensorLink::from_port(
        Box::new(MockSensorPort::simulated()),
        SensorSettings::from(&config.sensor),
        Arc::clone(&clock),
    )?;
    sensor.initialize()?;

    let bench = Bench::new(config, lines, sensor, Arc::clone(&clock));
    Ok(ScanOrchestrator::new(bench, ScanSettings::from(config), clock))
}
