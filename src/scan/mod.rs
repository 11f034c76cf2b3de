//! Scan sequencing: what to acquire ([`ScanRequest`]), in which order
//! ([`ScanStrategy`]) and the state machine driving the bench through it
//! ([`ScanOrchestrator`]).

pub mod orchestrator;
pub mod request;
pub mod state;
pub mod strategy;

pub use orchestrator::{Bench, ScanOrchestrator, ScanOutcome, ScanReport, ScanSettings};
pub use request::{ScanMode, ScanRequest};
pub use state::{BenchState, StopHandle};
pub use strategy::ScanStrategy;
