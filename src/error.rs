//! Custom error types for the bench controller.
//!
//! This module defines the primary error type, `BenchError`, for the whole crate.
//! Using the `thiserror` crate, it provides a single place for the failures a scan
//! can run into, from configuration problems to a magnetometer reply that cannot
//! be parsed.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically a malformed TOML file or
//!   an environment override with the wrong type.
//! - **`Configuration`**: Semantic errors in a configuration that parsed fine but
//!   holds values the bench cannot use (a zero pulley diameter, an unknown gain).
//! - **`Io`**: Wraps `std::io::Error`, covering the data files and the serial line.
//! - **`Gpio`**: A digital line could not be driven or read. Treated as fatal: the
//!   process cannot safely keep driving an axis it cannot command.
//! - **`NoSerialPort` / `Serial`**: Magnetometer link failures.
//! - **`SensorParse` / `SensorRetriesExhausted`**: Malformed sample replies. A
//!   single parse failure is retried; running out of attempts aborts the scan.
//! - **`HomingTimeout`**: The Z limit switch never triggered within the optional
//!   homing deadline.
//! - **`InvalidRequest`**: A scan request the state machines cannot execute.
//! - **`FeatureNotEnabled`**: The code path needs a backend that was not compiled
//!   in (`instrument_serial`, `gpio_cdev`).

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type BenchResult<T> = std::result::Result<T, BenchError>;

#[derive(Error, Debug)]
pub enum BenchError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GPIO error: {0}")]
    Gpio(String),

    #[error("No serial port could be opened among {candidates:?}")]
    NoSerialPort { candidates: Vec<String> },

    #[error("Serial error: {0}")]
    Serial(String),

    #[error("Malformed sensor reply {reply:?}: {reason}")]
    SensorParse { reply: String, reason: String },

    #[error("Sensor read failed after {attempts} attempts, last error: {last}")]
    SensorRetriesExhausted { attempts: u32, last: String },

    #[error("Z homing did not reach the limit switch within {elapsed:?}")]
    HomingTimeout { elapsed: Duration },

    #[error("Invalid scan request: {0}")]
    InvalidRequest(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}
