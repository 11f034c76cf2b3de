//! Shared bench rig for the integration tests: mock motors, a mock limit
//! switch, a mock magnetometer and a fake clock.

#![allow(dead_code)]

use rotor_bench::adapters::mock::SampleGenerator;
use rotor_bench::adapters::MockSensorPort;
use rotor_bench::config::BenchConfig;
use rotor_bench::hardware::mock::{MockLimitSwitch, MockMotor};
use rotor_bench::hardware::BenchLines;
use rotor_bench::instrument::{SensorLink, SensorSettings};
use rotor_bench::scan::{Bench, ScanOrchestrator, ScanSettings};
use rotor_bench::timing::FakeClock;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

pub struct Rig {
    pub orchestrator: ScanOrchestrator,
    pub shaft: MockMotor,
    pub z: MockMotor,
    pub switch: MockLimitSwitch,
    pub port: MockSensorPort,
    pub clock: Arc<FakeClock>,
    pub dir: TempDir,
}

pub struct RigBuilder {
    config: BenchConfig,
    switch: MockLimitSwitch,
    generator: Option<SampleGenerator>,
    replies: Vec<String>,
}

impl RigBuilder {
    pub fn new() -> Self {
        Self {
            config: BenchConfig::default(),
            switch: MockLimitSwitch::pressed(),
            generator: None,
            replies: Vec::new(),
        }
    }

    pub fn config(mut self, edit: impl FnOnce(&mut BenchConfig)) -> Self {
        edit(&mut self.config);
        self
    }

    pub fn switch(mut self, switch: MockLimitSwitch) -> Self {
        self.switch = switch;
        self
    }

    pub fn generator(mut self, generator: SampleGenerator) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn reply(mut self, raw: &str) -> Self {
        self.replies.push(raw.to_string());
        self
    }

    pub fn build(mut self) -> Rig {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        self.config.storage.output_dir = dir.path().join("TXT");

        let clock = Arc::new(FakeClock::new());
        let shaft = MockMotor::new();
        let z = MockMotor::new();
        let lines = BenchLines {
            shaft: shaft.lines(),
            z_axis: z.lines(),
            limit_switch: Box::new(self.switch.clone()),
        };

        let port = match self.generator {
            Some(generator) => MockSensorPort::with_generator("mock", generator),
            None => MockSensorPort::named("mock"),
        };
        for reply in &self.replies {
            port.push_reply(reply);
        }

        let mut link = SensorLink::from_port(
            Box::new(port.clone()),
            SensorSettings::from(&self.config.sensor),
            clock.clone(),
        )
        .expect("Failed to open mock link");
        link.initialize().expect("Failed to initialize mock link");

        let bench = Bench::new(&self.config, lines, link, clock.clone());
        let orchestrator =
            ScanOrchestrator::new(bench, ScanSettings::from(&self.config), clock.clone());

        Rig {
            orchestrator,
            shaft,
            z,
            switch: self.switch,
            port,
            clock,
            dir,
        }
    }
}

/// Data lines of a measurement file, without comments.
pub fn data_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .expect("Failed to read measurement file")
        .lines()
        .filter(|line| !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// `;`-separated fields of a data line, trimmed and parsed.
pub fn fields(line: &str) -> Vec<f64> {
    line.split(';')
        .map(|field| field.trim().parse().expect("Non-numeric field"))
        .collect()
}
