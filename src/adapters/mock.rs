//! Mock magnetometer port
//!
//! Answers the command set of the three-axis magnetometer from memory:
//! `NS`/`PG` are acknowledged silently, `HI` produces chatter that callers are
//! expected to drain, `PC` returns a calibration blob and `RM` queues one
//! `RD<x>,<y>,<z>` sample. Replies become readable immediately; the settle
//! delays of the protocol layer still run on the caller's clock.

use crate::adapters::SensorPort;
use crate::error::{BenchError, BenchResult};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// Produces the raw (Oe) vector of the `n`-th `RM` command, counted from 0.
pub type SampleGenerator = Box<dyn FnMut(u64) -> (f64, f64, f64) + Send>;

const DEFAULT_BANNER: &str = "3-axis magnetometer ready\r\n";
const DEFAULT_CALIBRATION: &str = "CAL X 1.0000\r\nCAL Y 1.0000\r\nCAL Z 1.0000\r\n";

struct PortState {
    commands: Vec<String>,
    pending: Vec<u8>,
    scripted: VecDeque<String>,
    generator: SampleGenerator,
    calibration: String,
    samples: u64,
    fail_writes: bool,
}

/// Mock magnetometer.
///
/// Clones share state, so a test keeps one handle to inspect the command log
/// while the link owns the other.
#[derive(Clone)]
pub struct MockSensorPort {
    name: String,
    state: Arc<Mutex<PortState>>,
}

impl MockSensorPort {
    /// A port answering every `RM` with a constant vector.
    pub fn named(name: &str) -> Self {
        Self::with_generator(name, Box::new(|_| (100.0, -50.0, 25.0)))
    }

    pub fn with_generator(name: &str, generator: SampleGenerator) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(PortState {
                commands: Vec::new(),
                pending: DEFAULT_BANNER.as_bytes().to_vec(),
                scripted: VecDeque::new(),
                generator,
                calibration: DEFAULT_CALIBRATION.to_string(),
                samples: 0,
                fail_writes: false,
            })),
        }
    }

    /// A port returning random readings, used by `--simulate`.
    pub fn simulated() -> Self {
        Self::with_generator(
            "simulated",
            Box::new(|_| {
                let mut rng = rand::thread_rng();
                let mut axis = || f64::from(rng.gen_range(1..=2000)) / 1.2;
                (axis(), axis(), axis())
            }),
        )
    }

    fn lock(&self) -> MutexGuard<'_, PortState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the calibration blob returned by `PC`.
    pub fn set_calibration(&self, text: &str) {
        self.lock().calibration = text.to_string();
    }

    /// Queue a raw reply returned by the next `RM` instead of a generated one.
    pub fn push_reply(&self, raw: &str) {
        self.lock().scripted.push_back(raw.to_string());
    }

    /// Make every subsequent write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Every command written so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn count_commands(&self, command: &str) -> usize {
        self.lock().commands.iter().filter(|c| c.as_str() == command).count()
    }
}

impl SensorPort for MockSensorPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_command(&mut self, command: &[u8]) -> BenchResult<()> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(BenchError::Serial(format!("{}: write failed", self.name)));
        }
        let command = String::from_utf8_lossy(command).to_string();
        state.commands.push(command.clone());

        match command.as_str() {
            "HI" => state.pending.extend_from_slice(b"HI\r\nOK\r\n"),
            "PC" => {
                let calibration = state.calibration.clone();
                state.pending.extend_from_slice(calibration.as_bytes());
            }
            "RM" => {
                let reply = match state.scripted.pop_front() {
                    Some(reply) => reply,
                    None => {
                        let n = state.samples;
                        let (x, y, z) = (state.generator)(n);
                        format!("RD{},{},{}\r\n", x, y, z)
                    }
                };
                state.samples += 1;
                state.pending.extend_from_slice(reply.as_bytes());
            }
            _ => {}
        }
        Ok(())
    }

    fn read_available(&mut self) -> BenchResult<Vec<u8>> {
        Ok(std::mem::take(&mut self.lock().pending))
    }
}
