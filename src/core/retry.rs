//! Retry policy carried with each task binding.
//!
//! The retry state lives inside the persisted binding rather than an
//! external counter, so attempt counts survive process restarts.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of retries after the initial failed attempt.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default backoff base delay.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Default backoff cap.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Per-task retry state and backoff rule.
///
/// `attempt` counts completed failed attempts; it is monotonic and capped
/// at `max_attempts`. `max_attempts` is the number of retries after the
/// initial attempt, so `max_attempts = 3` allows up to 4 executions total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryContext {
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(with = "serde_millis")]
    pub backoff_base: Duration,
    #[serde(with = "serde_millis")]
    pub backoff_cap: Duration,
}

impl RetryContext {
    /// Create a fresh retry context with the given limits.
    pub fn new(max_attempts: u32, backoff_base: Duration, backoff_cap: Duration) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            backoff_base,
            backoff_cap,
        }
    }

    /// A context that never retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Whether another retry is allowed after the current attempt fails.
    pub fn can_retry(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Backoff delay for the current attempt: `min(base * 2^attempt, cap)`.
    pub fn delay(&self) -> Duration {
        let exp = self.attempt.min(31);
        let scaled = self
            .backoff_base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.backoff_cap);
        scaled.min(self.backoff_cap)
    }

    /// Advance to the next attempt, saturating at `max_attempts`.
    pub fn next_attempt(self) -> Self {
        Self {
            attempt: (self.attempt + 1).min(self.max_attempts),
            ..self
        }
    }

    /// Reset the attempt counter after a successful execution, so a later
    /// failure of a recurring task starts backoff from scratch.
    pub fn reset(self) -> Self {
        Self { attempt: 0, ..self }
    }
}

impl Default for RetryContext {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_ATTEMPTS,
            DEFAULT_BACKOFF_BASE,
            DEFAULT_BACKOFF_CAP,
        )
    }
}

/// Serde helper persisting durations as integer milliseconds.
mod serde_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
