//! Core library for the ROTOR magnetic-field bench.
//!
//! The bench rotates a test rotor on a stepper-driven shaft while a second
//! stepper moves a 3-axis magnetometer up and down a Z axis. This crate owns
//! the timing of the motor pulses, Z homing against a limit switch, the serial
//! protocol of the magnetometer and the scan state machines that turn a
//! [`scan::ScanRequest`] into one or more plain-text data files.
//!
//! The GUI and plotting layers only build a request and read the files back.

pub mod adapters;
pub mod config;
pub mod data;
pub mod error;
pub mod error_recovery;
pub mod hardware;
pub mod instrument;
pub mod scan;
pub mod timing;

pub use error::{BenchError, BenchResult};
