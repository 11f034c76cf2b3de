//! Byte-level transports to the magnetometer.
//!
//! The magnetometer protocol is fire-and-forget: commands are written without
//! a terminator and replies are collected by draining whatever bytes arrived
//! after a settle delay. [`SensorPort`] captures exactly that contract so the
//! protocol layer runs unchanged over a USB serial port or a mock.

pub mod mock;
pub mod serial_adapter;

pub use mock::MockSensorPort;
pub use serial_adapter::SerialAdapter;

use crate::error::{BenchError, BenchResult};
use tracing::{debug, info};

/// Raw transport to the magnetometer.
pub trait SensorPort: Send {
    /// Device path or a descriptive name.
    fn name(&self) -> &str;

    /// Write a command as-is.
    fn write_command(&mut self, command: &[u8]) -> BenchResult<()>;

    /// Return every byte received so far without waiting.
    fn read_available(&mut self) -> BenchResult<Vec<u8>>;
}

/// Open the first candidate that succeeds, in order.
pub fn discover<F>(candidates: &[String], mut open: F) -> BenchResult<Box<dyn SensorPort>>
where
    F: FnMut(&str) -> BenchResult<Box<dyn SensorPort>>,
{
    for candidate in candidates {
        info!("Trying to open {}", candidate);
        match open(candidate) {
            Ok(port) => return Ok(port),
            Err(e) => debug!("{} unavailable: {}", candidate, e),
        }
    }
    Err(BenchError::NoSerialPort {
        candidates: candidates.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_takes_first_that_opens() {
        let candidates = vec![
            "/dev/ttyUSB0".to_string(),
            "/dev/ttyUSB1".to_string(),
            "/dev/ttyUSB2".to_string(),
        ];
        let mut tried = Vec::new();
        let port = discover(&candidates, |path| {
            tried.push(path.to_string());
            if path == "/dev/ttyUSB0" {
                Err(BenchError::Serial("busy".into()))
            } else {
                Ok(Box::new(MockSensorPort::named(path)) as Box<dyn SensorPort>)
            }
        })
        .unwrap();
        assert_eq!(port.name(), "/dev/ttyUSB1");
        assert_eq!(tried, vec!["/dev/ttyUSB0", "/dev/ttyUSB1"]);
    }

    #[test]
    fn test_discover_without_any_port() {
        let candidates = vec!["/dev/ttyUSB0".to_string()];
        let result = discover(&candidates, |_| Err(BenchError::Serial("missing".into())));
        match result {
            Err(BenchError::NoSerialPort { candidates }) => {
                assert_eq!(candidates, vec!["/dev/ttyUSB0".to_string()])
            }
            _ => panic!("expected NoSerialPort"),
        }
    }
}
