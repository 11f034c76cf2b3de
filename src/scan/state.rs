//! Run-time state of a scan.

use crate::error::BenchResult;
use crate::hardware::OutputLine;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

/// Mutable state owned by the orchestrator for one scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BenchState {
    /// Z position in mm; `None` until the axis has been homed
    pub z_position_mm: Option<f64>,
    /// Current repetition, counted from 1
    pub repetition: u32,
    /// Current angle step within the repetition
    pub angle_index: u32,
    pub emergency_stop_required: bool,
    pub homes_performed: u32,
}

impl BenchState {
    /// Start repetition `repetition`. The Z position is forgotten so the
    /// axis is homed again before its next move.
    pub fn reset_for_repetition(&mut self, repetition: u32) {
        self.repetition = repetition;
        self.angle_index = 0;
        self.z_position_mm = None;
    }
}

type SharedLine = Arc<Mutex<Box<dyn OutputLine>>>;

/// Shared emergency-stop request.
///
/// Clones observe the same flag, so a signal handler can hold one while the
/// scan thread polls another between steps. Enable lines registered with
/// [`StopHandle::guard_enable`] are driven high (torque released) from the
/// requesting thread itself, and stay high afterwards whatever the scan
/// thread asks for.
#[derive(Clone, Default)]
pub struct StopHandle {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    requested: AtomicBool,
    enable_lines: Mutex<Vec<SharedLine>>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the stop and release every guarded enable line.
    pub fn request(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);

        let lines = self
            .inner
            .enable_lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for line in lines.iter() {
            let mut line = line.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = line.set_high() {
                warn!("Failed to release an enable line on emergency stop: {}", e);
            }
        }
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Wrap a driver's active-low enable line so that a stop request can
    /// release it from any thread, and so that it cannot be engaged again
    /// once the stop is raised.
    pub fn guard_enable(&self, line: Box<dyn OutputLine>) -> Box<dyn OutputLine> {
        let shared: SharedLine = Arc::new(Mutex::new(line));
        self.inner
            .enable_lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&shared));
        Box::new(GuardedEnable {
            line: shared,
            stop: self.clone(),
        })
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle")
            .field("requested", &self.is_requested())
            .finish_non_exhaustive()
    }
}

struct GuardedEnable {
    line: SharedLine,
    stop: StopHandle,
}

impl OutputLine for GuardedEnable {
    fn set_level(&mut self, high: bool) -> BenchResult<()> {
        // The flag is read under the line lock so a concurrent request cannot
        // be overwritten by a late engage.
        let mut line = self.line.lock().unwrap_or_else(PoisonError::into_inner);
        line.set_level(high || self.stop.is_requested())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockOutputLine;

    #[test]
    fn test_reset_forgets_z() {
        let mut state = BenchState {
            z_position_mm: Some(30.0),
            repetition: 1,
            angle_index: 42,
            emergency_stop_required: false,
            homes_performed: 5,
        };
        state.reset_for_repetition(2);
        assert_eq!(state.z_position_mm, None);
        assert_eq!(state.angle_index, 0);
        assert_eq!(state.repetition, 2);
        assert_eq!(state.homes_performed, 5);
    }

    #[test]
    fn test_stop_handle_is_shared() {
        let handle = StopHandle::new();
        let signal_side = handle.clone();
        assert!(!handle.is_requested());
        std::thread::spawn(move || signal_side.request())
            .join()
            .unwrap();
        assert!(handle.is_requested());
    }

    #[test]
    fn test_request_releases_guarded_lines() {
        let handle = StopHandle::new();
        let pin = MockOutputLine::new(true);
        let mut enable = handle.guard_enable(Box::new(pin.clone()));

        enable.set_low().unwrap();
        assert!(!pin.is_high());

        let signal_side = handle.clone();
        std::thread::spawn(move || signal_side.request())
            .join()
            .unwrap();
        assert!(pin.is_high());

        // Engaging again after the stop keeps the torque released
        enable.set_low().unwrap();
        assert!(pin.is_high());
    }
}
