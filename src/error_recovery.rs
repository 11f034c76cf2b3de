//! Retry policies for recoverable instrument failures.
//
// Only the magnetometer read path is retried: motor and GPIO failures are
// fatal, and a malformed sample reply is the one failure that routinely clears
// itself on the next command.

use crate::error::{BenchError, BenchResult};
use crate::timing::Clock;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// The maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// The base delay between attempts; attempt `n` waits `n * backoff_delay`.
    #[serde(with = "duration_secs")]
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

/// Run `operation` until it succeeds or the policy is exhausted.
///
/// Waits on `clock` between attempts with a linearly growing backoff. The
/// error returned after the last attempt is
/// [`BenchError::SensorRetriesExhausted`] carrying the last failure.
pub fn retry_with_backoff<T, F>(
    clock: &dyn Clock,
    policy: &RetryPolicy,
    what: &str,
    mut operation: F,
) -> BenchResult<T>
where
    F: FnMut() -> BenchResult<T>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last = String::new();

    for attempt in 1..=attempts {
        match operation() {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!("{} failed (attempt {}/{}): {}", what, attempt, attempts, e);
                last = e.to_string();
                if attempt < attempts {
                    clock.delay(policy.backoff_delay * attempt);
                }
            }
        }
    }

    Err(BenchError::SensorRetriesExhausted { attempts, last })
}

/// Serialize a `Duration` as fractional seconds, the unit used in the config file.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
