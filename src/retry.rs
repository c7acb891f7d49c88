//! Bounded retry with exponential backoff.
//!
//! ```
//! use std::time::Duration;
//!
//! use episplit::{EpisplitError, RetryPolicy, retry_with_backoff};
//!
//! let policy = RetryPolicy::new().with_initial_delay(Duration::from_millis(1));
//! let mut calls = 0;
//! let value = retry_with_backoff(&policy, EpisplitError::is_transient, || {
//!     calls += 1;
//!     if calls < 2 {
//!         Err(EpisplitError::HttpTransport("connection reset".into()))
//!     } else {
//!         Ok(42)
//!     }
//! })?;
//! assert_eq!((value, calls), (42, 2));
//! # Ok::<(), EpisplitError>(())
//! ```

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How often and how patiently to retry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that tries once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry as i32);
        self.initial_delay.mul_f64(factor).min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, fails permanently, or the attempts
/// run out. The last error is returned.
pub fn retry_with_backoff<T, E, P, F>(policy: &RetryPolicy, is_transient: P, mut operation: F) -> Result<T, E>
where
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
    F: FnMut() -> Result<T, E>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(error) => {
                attempt += 1;
                if attempt >= attempts || !is_transient(&error) {
                    return Err(error);
                }
                let delay = policy.delay_for(attempt - 1);
                log::warn!("Attempt {attempt}/{attempts} failed ({error}), retrying in {delay:?}");
                thread::sleep(delay);
            }
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EpisplitError;

    fn fast() -> RetryPolicy {
        RetryPolicy::new().with_initial_delay(Duration::from_millis(1))
    }

    #[test]
    fn delays_double_up_to_the_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(6), Duration::from_millis(4000));
    }

    #[test]
    fn transient_errors_use_every_attempt() {
        let mut calls = 0;
        let result: Result<(), EpisplitError> = retry_with_backoff(&fast(), EpisplitError::is_transient, || {
            calls += 1;
            Err(EpisplitError::HttpTransport("reset".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn permanent_errors_stop_immediately() {
        let mut calls = 0;
        let result: Result<(), EpisplitError> = retry_with_backoff(&fast(), EpisplitError::is_transient, || {
            calls += 1;
            Err(EpisplitError::HttpStatus {
                url: "http://localhost".into(),
                status: 404,
            })
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn single_attempt_policy() {
        let mut calls = 0;
        let _: Result<(), EpisplitError> = retry_with_backoff(&RetryPolicy::none(), |_| true, || {
            calls += 1;
            Err(EpisplitError::Cancelled)
        });
        assert_eq!(calls, 1);
    }
}
