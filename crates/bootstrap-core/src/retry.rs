//! Bounded retry with pure exponential backoff.

use crate::clock::Clock;
use crate::error::BootstrapError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// RetrySpec
// ---------------------------------------------------------------------------

/// In config: `retry: { max_attempts: 3, initial_delay: 5 }` (seconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySpec {
    pub max_attempts: u32,
    #[serde(with = "duration_secs")]
    pub initial_delay: Duration,
}

impl RetrySpec {
    /// `max_attempts` below 1 is raised to 1.
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
        }
    }

    /// Delay slept before `attempt` (1-indexed). The first attempt fires
    /// immediately; attempt k ≥ 2 waits `initial_delay * 2^(k-2)`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(31);
        self.initial_delay.saturating_mul(1u32 << exponent)
    }
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(5))
    }
}

// ---------------------------------------------------------------------------
// Exhausted
// ---------------------------------------------------------------------------

/// Every attempt failed. Carries the error from the final attempt.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

impl<E: fmt::Display> fmt::Display for Exhausted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed after {} attempt(s): {}",
            self.attempts, self.last_error
        )
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for Exhausted<E> {}

impl<E: fmt::Display> Exhausted<E> {
    pub fn into_error(self, description: &str) -> BootstrapError {
        BootstrapError::Exhausted {
            description: description.to_string(),
            attempts: self.attempts,
            last_error: self.last_error.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// RetryExecutor
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RetryExecutor {
    clock: Arc<dyn Clock>,
}

impl RetryExecutor {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Run `operation` up to `spec.max_attempts` times.
    ///
    /// The closure receives the 1-indexed attempt number. It must be safe to
    /// re-run; side effects of failed attempts are not rolled back.
    pub fn run<T, E, F>(
        &self,
        spec: &RetrySpec,
        description: &str,
        mut operation: F,
    ) -> std::result::Result<T, Exhausted<E>>
    where
        E: fmt::Display,
        F: FnMut(u32) -> std::result::Result<T, E>,
    {
        let max_attempts = spec.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!("{description} succeeded on attempt {attempt}");
                    }
                    return Ok(value);
                }
                Err(e) if attempt >= max_attempts => {
                    tracing::error!("{description} failed on final attempt {attempt}: {e}");
                    return Err(Exhausted {
                        attempts: attempt,
                        last_error: e,
                    });
                }
                Err(e) => {
                    let delay = spec.delay_before(attempt + 1);
                    tracing::warn!(
                        "{description} failed (attempt {attempt}/{max_attempts}): {e}; retrying in {}s",
                        delay.as_secs_f64()
                    );
                    self.clock.sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn executor() -> (Arc<ManualClock>, RetryExecutor) {
        let clock = Arc::new(ManualClock::new());
        (clock.clone(), RetryExecutor::new(clock))
    }

    #[test]
    fn delay_doubles_from_second_attempt() {
        let spec = RetrySpec::new(5, Duration::from_secs(2));
        assert_eq!(spec.delay_before(1), Duration::ZERO);
        assert_eq!(spec.delay_before(2), Duration::from_secs(2));
        assert_eq!(spec.delay_before(3), Duration::from_secs(4));
        assert_eq!(spec.delay_before(4), Duration::from_secs(8));
        assert_eq!(spec.delay_before(5), Duration::from_secs(16));
    }

    #[test]
    fn zero_attempts_is_raised_to_one() {
        assert_eq!(RetrySpec::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[test]
    fn always_failing_operation_runs_exactly_max_attempts() {
        for max in 1..=6 {
            let (_clock, retry) = executor();
            let mut calls = 0;
            let result: std::result::Result<(), _> =
                retry.run(&RetrySpec::new(max, Duration::from_secs(1)), "op", |_| {
                    calls += 1;
                    Err(format!("boom {calls}"))
                });
            let exhausted = result.unwrap_err();
            assert_eq!(calls, max);
            assert_eq!(exhausted.attempts, max);
            assert_eq!(exhausted.last_error, format!("boom {max}"));
        }
    }

    #[test]
    fn sleeps_follow_backoff_and_first_attempt_is_immediate() {
        let (clock, retry) = executor();
        let _ = retry.run::<(), _, _>(&RetrySpec::new(4, Duration::from_secs(3)), "op", |_| {
            Err("nope")
        });
        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_secs(3),
                Duration::from_secs(6),
                Duration::from_secs(12)
            ]
        );
    }

    #[test]
    fn stops_retrying_after_success() {
        let (clock, retry) = executor();
        let mut seen = Vec::new();
        let value = retry
            .run(&RetrySpec::new(5, Duration::from_secs(1)), "op", |attempt| {
                seen.push(attempt);
                if attempt == 2 {
                    Ok("done")
                } else {
                    Err("not yet")
                }
            })
            .unwrap();
        assert_eq!(value, "done");
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
    }

    #[test]
    fn exhausted_converts_to_bootstrap_error() {
        let err = Exhausted {
            attempts: 3,
            last_error: "connection refused",
        }
        .into_error("vault login");
        assert_eq!(
            err.to_string(),
            "vault login failed after 3 attempt(s): connection refused"
        );
    }
}
