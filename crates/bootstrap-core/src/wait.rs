//! Condition polling.
//!
//! [`ConditionWaiter::wait`] evaluates a readiness predicate until it holds or
//! the time budget runs out. A timeout is an ordinary return value; callers
//! (usually a stage) decide whether it is fatal.

use crate::clock::Clock;
use crate::error::{BootstrapError, Result};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const PROGRESS_EVERY: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// WaitSpec / WaitOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitSpec {
    pub description: String,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl WaitSpec {
    pub fn new(description: impl Into<String>, timeout: Duration) -> Self {
        Self {
            description: description.into(),
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready { elapsed: Duration, checks: u32 },
    TimedOut { elapsed: Duration, checks: u32 },
}

impl WaitOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, WaitOutcome::Ready { .. })
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            WaitOutcome::Ready { elapsed, .. } | WaitOutcome::TimedOut { elapsed, .. } => *elapsed,
        }
    }

    pub fn checks(&self) -> u32 {
        match self {
            WaitOutcome::Ready { checks, .. } | WaitOutcome::TimedOut { checks, .. } => *checks,
        }
    }

    /// Convert into a `Result`, mapping a timeout to [`BootstrapError::TimedOut`].
    pub fn into_result(self, description: &str) -> Result<Duration> {
        match self {
            WaitOutcome::Ready { elapsed, .. } => Ok(elapsed),
            WaitOutcome::TimedOut { elapsed, .. } => Err(BootstrapError::TimedOut {
                description: description.to_string(),
                elapsed,
            }),
        }
    }
}

/// When a long wait logs that it is still waiting: once per `every` of
/// elapsed time. Intervals skipped by a long poll are not replayed.
#[derive(Debug, Clone, Copy)]
struct ProgressSchedule {
    every: Duration,
    next: Duration,
}

impl ProgressSchedule {
    fn new(every: Duration) -> Self {
        let every = every.max(Duration::from_millis(1));
        Self { every, next: every }
    }

    fn due(&mut self, elapsed: Duration) -> bool {
        if elapsed < self.next {
            return false;
        }
        while self.next <= elapsed {
            self.next += self.every;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// ConditionWaiter
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ConditionWaiter {
    clock: Arc<dyn Clock>,
    progress_every: Duration,
}

impl ConditionWaiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            progress_every: PROGRESS_EVERY,
        }
    }

    /// Poll `predicate` until it returns true or `spec.timeout` is spent.
    ///
    /// The first check happens immediately. The last sleep is clamped to the
    /// remaining budget, so elapsed time never passes the timeout.
    pub fn wait<F>(&self, spec: &WaitSpec, mut predicate: F) -> WaitOutcome
    where
        F: FnMut() -> bool,
    {
        let start = self.clock.now();
        let poll = spec.poll_interval.max(Duration::from_millis(1));
        let mut progress = ProgressSchedule::new(self.progress_every);
        let mut checks = 0u32;

        loop {
            checks += 1;
            let ready = predicate();
            let elapsed = self.clock.now().saturating_duration_since(start);

            if ready {
                tracing::debug!(
                    "{} ready after {}s ({} checks)",
                    spec.description,
                    elapsed.as_secs(),
                    checks
                );
                return WaitOutcome::Ready { elapsed, checks };
            }

            if elapsed >= spec.timeout {
                tracing::warn!(
                    "gave up waiting for {} after {}s",
                    spec.description,
                    elapsed.as_secs()
                );
                return WaitOutcome::TimedOut { elapsed, checks };
            }

            if progress.due(elapsed) {
                tracing::info!(
                    "still waiting for {} ({}s / {}s)",
                    spec.description,
                    elapsed.as_secs(),
                    spec.timeout.as_secs()
                );
            }

            let remaining = spec.timeout - elapsed;
            self.clock.sleep(poll.min(remaining));
        }
    }
}
