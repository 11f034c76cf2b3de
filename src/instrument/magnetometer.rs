//! Three-axis magnetometer driver
//!
//! ASCII command protocol over a USB serial line at 115200 baud:
//!
//! | Command  | Effect                                   | Reply            |
//! |----------|------------------------------------------|------------------|
//! | `NS <n>` | average `n` samples per reading          | none             |
//! | `PG <n>` | set programmable gain                    | none             |
//! | `HI`     | no-op, used to clear pending replies     | discarded        |
//! | `PC`     | print calibration                        | free text        |
//! | `RM`     | one manual reading                       | `RD<x>,<y>,<z>`  |
//!
//! Nothing is acknowledged: every command is followed by a fixed settle delay
//! and the reply, if any, is whatever arrived in the meantime.

use crate::adapters::{self, SensorPort, SerialAdapter};
use crate::config::SensorConfig;
use crate::error::{BenchError, BenchResult};
use crate::error_recovery::{retry_with_backoff, RetryPolicy};
use crate::instrument::FieldVector;
use crate::timing::Clock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Marker preceding the values of a reading reply.
const READING_MARKER: &str = "RD";

/// Protocol timing and conversion of one link.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSettings {
    pub sample_count: u32,
    pub gain: u32,
    pub read_delay: Duration,
    pub oe_to_mt: f64,
    pub banner_settle: Duration,
    pub command_settle: Duration,
    pub flush_settle: Duration,
    pub retry: RetryPolicy,
}

impl From<&SensorConfig> for SensorSettings {
    fn from(config: &SensorConfig) -> Self {
        Self {
            sample_count: config.sample_count,
            gain: config.gain,
            read_delay: Duration::from_secs_f64(config.read_delay_s),
            oe_to_mt: config.oe_to_mt,
            banner_settle: Duration::from_secs_f64(config.banner_settle_s),
            command_settle: Duration::from_secs_f64(config.command_settle_s),
            flush_settle: Duration::from_secs_f64(config.flush_settle_s),
            retry: config.retry.clone(),
        }
    }
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self::from(&SensorConfig::default())
    }
}

/// Open session with the magnetometer.
pub struct SensorLink {
    port: Option<Box<dyn SensorPort>>,
    name: String,
    settings: SensorSettings,
    clock: Arc<dyn Clock>,
    calibration: Option<String>,
}

impl SensorLink {
    /// Open the first serial candidate that works and perform the handshake.
    pub fn open(config: &SensorConfig, clock: Arc<dyn Clock>) -> BenchResult<Self> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let port = adapters::discover(&config.candidates, |path| {
            SerialAdapter::open(path, config.baud_rate, timeout)
                .map(|adapter| Box::new(adapter) as Box<dyn SensorPort>)
        })?;
        Self::from_port(port, SensorSettings::from(config), clock)
    }

    /// Run the handshake over an already open port.
    ///
    /// Waits for the power-up banner to arrive, then drains and logs it. The
    /// banner content is not validated.
    pub fn from_port(
        mut port: Box<dyn SensorPort>,
        settings: SensorSettings,
        clock: Arc<dyn Clock>,
    ) -> BenchResult<Self> {
        let name = port.name().to_string();
        info!("Serial port {} opened", name);

        clock.delay(settings.banner_settle);
        let banner = port.read_available()?;
        info!("Sensor banner: {}", String::from_utf8_lossy(&banner).trim());

        Ok(Self {
            port: Some(port),
            name,
            settings,
            clock,
            calibration: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &SensorSettings {
        &self.settings
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn port(&mut self) -> BenchResult<&mut Box<dyn SensorPort>> {
        let name = &self.name;
        self.port
            .as_mut()
            .ok_or_else(|| BenchError::Serial(format!("link to {} is closed", name)))
    }

    fn send(&mut self, command: &str) -> BenchResult<()> {
        debug!("-> {}", command);
        self.port()?.write_command(command.as_bytes())
    }

    fn receive(&mut self) -> BenchResult<String> {
        let raw = self.port()?.read_available()?;
        Ok(String::from_utf8_lossy(&raw).replace('\r', ""))
    }

    /// Configure, flush and capture the calibration: everything a fresh link
    /// needs before the first reading.
    pub fn initialize(&mut self) -> BenchResult<()> {
        let (samples, gain) = (self.settings.sample_count, self.settings.gain);
        self.configure(samples, gain)?;
        self.flush_input()?;
        self.calibration_snapshot()?;
        Ok(())
    }

    /// Set sample averaging (`NS`) and gain (`PG`).
    pub fn configure(&mut self, sample_count: u32, gain: u32) -> BenchResult<()> {
        self.send(&format!("NS {}", sample_count))?;
        self.clock.delay(self.settings.command_settle);
        self.send(&format!("PG {}", gain))?;
        self.clock.delay(self.settings.command_settle);

        self.settings.sample_count = sample_count;
        self.settings.gain = gain;
        info!("Sensor configured: {} samples, gain {}", sample_count, gain);
        Ok(())
    }

    /// Clear any pending reply with `HI` and discard what comes back.
    pub fn flush_input(&mut self) -> BenchResult<()> {
        self.send("HI")?;
        self.clock.delay(self.settings.flush_settle);
        let discarded = self.receive()?;
        debug!("Flushed {} bytes", discarded.len());
        Ok(())
    }

    /// Calibration text with every line prefixed by `# `.
    ///
    /// Queried with `PC` on the first call only; later calls return the same
    /// text for the rest of the session.
    pub fn calibration_snapshot(&mut self) -> BenchResult<String> {
        if let Some(calibration) = &self.calibration {
            return Ok(calibration.clone());
        }

        self.send("PC")?;
        self.clock.delay(self.settings.flush_settle);
        let raw = self.receive()?;
        let blob = comment_block(&raw);
        info!("Sensor calibration captured ({} lines)", blob.lines().count());

        self.calibration = Some(blob.clone());
        Ok(blob)
    }

    /// The captured calibration, if [`Self::calibration_snapshot`] ran.
    pub fn calibration(&self) -> Option<&str> {
        self.calibration.as_deref()
    }

    /// Replace the `RM` settle delay.
    pub fn set_read_delay(&mut self, delay: Duration) {
        self.settings.read_delay = delay;
    }

    /// One field reading in mT, retrying malformed replies per the policy.
    pub fn read_vector(&mut self) -> BenchResult<FieldVector> {
        let clock = Arc::clone(&self.clock);
        let policy = self.settings.retry.clone();
        retry_with_backoff(clock.as_ref(), &policy, "sensor read", || self.read_once())
    }

    fn read_once(&mut self) -> BenchResult<FieldVector> {
        self.send("RM")?;
        self.clock.delay(self.settings.read_delay);
        let reply = self.receive()?;
        let field = parse_reply(&reply, self.settings.oe_to_mt)?;
        debug!("<- {:?} => {:?}", reply.trim(), field);
        Ok(field)
    }

    /// Close the port. Further calls are no-ops.
    pub fn close(&mut self) {
        if self.port.take().is_some() {
            info!("Serial port {} closed", self.name);
        }
    }
}

/// Parse an `RM` reply and convert it with `coefficient`.
///
/// Only the text after the last `RD` marker counts; it must hold exactly
/// three comma-separated numbers.
pub fn parse_reply(reply: &str, coefficient: f64) -> BenchResult<FieldVector> {
    let parse_err = |reason: &str| BenchError::SensorParse {
        reply: reply.to_string(),
        reason: reason.to_string(),
    };

    let cleaned = reply.replace('\r', "");
    let (_, payload) = cleaned
        .rsplit_once(READING_MARKER)
        .ok_or_else(|| parse_err("no RD marker"))?;

    let values = payload
        .trim()
        .split(',')
        .map(|token| token.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| parse_err(&e.to_string()))?;

    match values.as_slice() {
        [x, y, z] => Ok(FieldVector::new(*x, *y, *z).scaled(coefficient)),
        other => Err(parse_err(&format!("expected 3 values, got {}", other.len()))),
    }
}

fn comment_block(text: &str) -> String {
    let mut block = String::new();
    for line in text.trim_end_matches('\n').split('\n') {
        block.push_str("# ");
        block.push_str(line);
        block.push('\n');
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockSensorPort;
    use crate::timing::FakeClock;

    fn link(port: &MockSensorPort) -> (SensorLink, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock::new());
        let link = SensorLink::from_port(Box::new(port.clone()), SensorSettings::default(), clock.clone())
            .unwrap();
        (link, clock)
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!((actual - expected).abs() < 1e-9, "{actual} != {expected}");
    }

    #[test]
    fn test_parse_reply_converts_units() {
        let field = parse_reply("RD120,-45,10", 0.1).unwrap();
        assert_close(field.x, 12.0);
        assert_close(field.y, -4.5);
        assert_close(field.z, 1.0);
    }

    #[test]
    fn test_parse_reply_uses_last_marker() {
        let field = parse_reply("HI\r\nRD1,2,3\r\nRD 4, 5 ,6\r\n", 1.0).unwrap();
        assert_eq!(field, FieldVector::new(4.0, 5.0, 6.0));
    }

    #[test]
    fn test_parse_reply_rejects_malformed() {
        assert!(matches!(parse_reply("RD1,2", 0.1), Err(BenchError::SensorParse { .. })));
        assert!(matches!(parse_reply("RD1,x,3", 0.1), Err(BenchError::SensorParse { .. })));
        assert!(matches!(parse_reply("1,2,3", 0.1), Err(BenchError::SensorParse { .. })));
        assert!(matches!(parse_reply("", 0.1), Err(BenchError::SensorParse { .. })));
    }

    #[test]
    fn test_handshake_waits_for_banner() {
        let port = MockSensorPort::named("mock");
        let (link, clock) = link(&port);
        assert_eq!(clock.now(), Duration::from_secs(3));
        assert!(link.is_open());
        assert!(port.commands().is_empty());
    }

    #[test]
    fn test_configure_sends_fire_and_forget_commands() {
        let port = MockSensorPort::named("mock");
        let (mut link, clock) = link(&port);
        link.configure(16, 2).unwrap();
        assert_eq!(port.commands(), vec!["NS 16", "PG 2"]);
        assert_eq!(clock.now(), Duration::from_secs(4));
        assert_eq!(link.settings().gain, 2);
    }

    #[test]
    fn test_calibration_captured_once() {
        let port = MockSensorPort::named("mock");
        port.set_calibration("line one\r\nline two\r\n");
        let (mut link, _clock) = link(&port);

        let first = link.calibration_snapshot().unwrap();
        assert_eq!(first, "# line one\n# line two\n");

        port.set_calibration("changed\r\n");
        let second = link.calibration_snapshot().unwrap();
        assert_eq!(first, second);
        assert_eq!(port.count_commands("PC"), 1);
        assert_eq!(link.calibration(), Some("# line one\n# line two\n"));
    }

    #[test]
    fn test_read_vector_scales_reply() {
        let port = MockSensorPort::named("mock");
        port.push_reply("RD120,-45,10\r\n");
        let (mut link, clock) = link(&port);
        let before = clock.now();
        let field = link.read_vector().unwrap();
        assert_close(field.x, 12.0);
        assert_close(field.y, -4.5);
        assert_close(field.z, 1.0);
        assert_eq!(clock.now() - before, Duration::from_millis(700));
    }

    #[test]
    fn test_read_vector_retries_malformed_reply() {
        let port = MockSensorPort::named("mock");
        port.push_reply("RD12,oops\r\n");
        let (mut link, _clock) = link(&port);
        let field = link.read_vector().unwrap();
        assert_close(field.x, 10.0);
        assert_eq!(port.count_commands("RM"), 2);
    }

    #[test]
    fn test_read_vector_gives_up() {
        let port = MockSensorPort::named("mock");
        for _ in 0..3 {
            port.push_reply("garbage\r\n");
        }
        let (mut link, _clock) = link(&port);
        match link.read_vector() {
            Err(BenchError::SensorRetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected exhausted retries, got {other:?}"),
        }
    }

    #[test]
    fn test_close_is_idempotent() {
        let port = MockSensorPort::named("mock");
        let (mut link, _clock) = link(&port);
        link.close();
        link.close();
        assert!(!link.is_open());
        assert!(matches!(link.read_vector(), Err(BenchError::SensorRetriesExhausted { .. })));
    }
}
