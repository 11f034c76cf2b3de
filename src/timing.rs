//! Monotonic time source and busy-wait delays.
//!
//! Every delay on the bench (pulse periods, sensor settle times, sampling
//! cadence) is a spin on a monotonic clock rather than a sleep, which gives
//! tighter pulse timing than the scheduler's sleep granularity at the cost of
//! keeping one core busy. The [`Clock`] trait isolates that choice so tests can
//! swap in a [`FakeClock`] that jumps straight to each deadline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic clock used for all bench timing.
pub trait Clock: Send + Sync {
    /// Time elapsed since the clock's origin.
    fn now(&self) -> Duration;

    /// Busy-wait until `now() >= deadline`.
    fn spin_until(&self, deadline: Duration) {
        while self.now() < deadline {
            std::hint::spin_loop();
        }
    }

    /// Busy-wait for `duration` starting now.
    fn delay(&self, duration: Duration) {
        let deadline = self.now() + duration;
        self.spin_until(deadline);
    }
}

/// Wall-clock backed implementation for the real bench.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Simulated clock: time only moves when something waits on it.
///
/// `spin_until` advances the clock to the deadline instead of spinning, so a
/// full scan runs instantly while pulse periods and cadences remain observable
/// through [`FakeClock::now`].
#[derive(Debug, Default)]
pub struct FakeClock {
    nanos: AtomicU64,
}

impl FakeClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward without waiting on anything.
    pub fn advance(&self, duration: Duration) {
        self.nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }

    fn spin_until(&self, deadline: Duration) {
        self.nanos
            .fetch_max(deadline.as_nanos() as u64, Ordering::SeqCst);
    }
}
