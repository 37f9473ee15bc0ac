//! Bounded retry with exponential backoff.
//!
//! Two drivers share one [`Backoff`] schedule:
//! - [`exponential_backoff`] polls a condition. `Ok(true)` finishes, `Ok(false)`
//!   waits and tries again, and an error stops immediately without using the
//!   remaining budget.
//! - [`retry_on_error`] / [`retry_if`] repeat fallible work until it succeeds,
//!   surfacing the last error once the budget is spent.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::metrics;

/// Initial backoff delay in milliseconds
pub const INITIAL_BACKOFF_MS: u64 = 100;
/// Maximum backoff delay in milliseconds
pub const MAX_BACKOFF_MS: u64 = 5000;
/// Backoff multiplier (exponential factor)
pub const BACKOFF_MULTIPLIER: u32 = 2;
/// Total number of calls, including the first one
pub const DEFAULT_STEPS: u32 = 4;

/// Exponential backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    /// Delay before the first retry
    pub initial_ms: u64,
    /// Growth factor applied after every retry
    pub factor: u32,
    /// Upper bound on any single delay
    pub max_ms: u64,
    /// Maximum number of calls to the unit of work
    pub steps: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_ms: INITIAL_BACKOFF_MS,
            factor: BACKOFF_MULTIPLIER,
            max_ms: MAX_BACKOFF_MS,
            steps: DEFAULT_STEPS,
        }
    }
}

impl Backoff {
    pub fn new(initial: Duration, factor: u32, max: Duration, steps: u32) -> Self {
        Self {
            initial_ms: initial.as_millis() as u64,
            factor,
            max_ms: max.as_millis() as u64,
            steps,
        }
    }

    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms.min(self.max_ms))
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }

    /// At least one call is always made.
    pub fn steps(&self) -> u32 {
        self.steps.max(1)
    }

    /// Delay following `current`, capped at `max`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        current
            .saturating_mul(self.factor.max(1))
            .min(self.max())
    }

    /// Delays slept between calls, in order. Has `steps - 1` entries.
    pub fn delays(&self) -> Vec<Duration> {
        let mut delays = Vec::with_capacity(self.steps() as usize - 1);
        let mut delay = self.initial();
        for _ in 1..self.steps() {
            delays.push(delay);
            delay = self.next_delay(delay);
        }
        delays
    }
}

/// Poll `condition` until it reports done.
///
/// Returns `Ok(true)` as soon as the condition holds, `Err(e)` the first time
/// it fails (errors are terminal and never retried), and `Ok(false)` once all
/// `steps` calls have reported not-done.
pub async fn exponential_backoff<E, F, Fut>(
    backoff: &Backoff,
    operation_name: &str,
    mut condition: F,
) -> Result<bool, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    let steps = backoff.steps();
    let mut delay = backoff.initial();

    for attempt in 1..=steps {
        if condition().await? {
            return Ok(true);
        }
        if attempt == steps {
            break;
        }

        debug!(
            operation = operation_name,
            attempt,
            steps,
            backoff_ms = delay.as_millis() as u64,
            "Condition not met, backing off"
        );
        metrics::record_retry(operation_name);

        tokio::time::sleep(delay).await;
        delay = backoff.next_delay(delay);
    }

    warn!(
        operation = operation_name,
        steps, "Condition still not met after exhausting retry budget"
    );
    Ok(false)
}

/// Repeat `operation` until it succeeds, retrying every error.
pub async fn retry_on_error<T, E, F, Fut>(
    backoff: &Backoff,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_if(backoff, operation_name, operation, |_| true).await
}

/// Repeat `operation` while it fails with an error `is_retryable` accepts.
///
/// A non-retryable error is returned after a single call. When the budget is
/// spent the last error is returned.
pub async fn retry_if<T, E, F, Fut, P>(
    backoff: &Backoff,
    operation_name: &str,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let steps = backoff.steps();
    let mut attempt = 0;
    let mut delay = backoff.initial();

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                attempt += 1;

                if !is_retryable(&err) || attempt >= steps {
                    if attempt > 1 {
                        warn!(
                            operation = operation_name,
                            attempts = attempt,
                            error = %err,
                            "Operation failed after retries"
                        );
                    }
                    return Err(err);
                }

                warn!(
                    operation = operation_name,
                    attempt,
                    steps,
                    error = %err,
                    backoff_ms = delay.as_millis() as u64,
                    "Retryable error, backing off"
                );
                metrics::record_retry(operation_name);

                tokio::time::sleep(delay).await;
                delay = backoff.next_delay(delay);
            }
        }
    }
}
