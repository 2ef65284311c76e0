//! Retry with exponential backoff under one end-to-end time budget.

use crate::error::GenerationError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Attempt budget for one generation call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `2` means three attempts in total
    pub max_retries: u32,
    /// Delay after the first failed attempt; doubles after each further failure
    pub backoff_unit: Duration,
    /// End-to-end budget covering every attempt and every backoff sleep
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_unit: Duration::from_secs(1),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Result of a retried operation plus the number of attempts it took
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, GenerationError>,
    pub attempts: u32,
}

impl RetryPolicy {
    /// Sleep after failed attempt number `failed_attempt` (1-based): `2^(n-1) × unit`.
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(31);
        self.backoff_unit.saturating_mul(1u32 << exponent)
    }

    fn timed_out(&self, started: Instant) -> GenerationError {
        GenerationError::Timeout {
            elapsed_ms: started.elapsed().as_millis() as u64,
            budget_ms: self.timeout.as_millis() as u64,
        }
    }

    /// Run `op` until it succeeds, fails terminally, or the budget is spent.
    ///
    /// Each attempt is bounded by the remaining budget. A retry whose backoff
    /// would end at or past the deadline is not started; the call fails with
    /// `Timeout` instead.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Attempted<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, GenerationError>>,
    {
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            let remaining = match self.timeout.checked_sub(started.elapsed()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => {
                    return Attempted {
                        result: Err(self.timed_out(started)),
                        attempts: attempt,
                    }
                }
            };

            attempt += 1;
            debug!(operation, attempt, remaining_ms = remaining.as_millis() as u64, "Starting attempt");

            let error = match tokio::time::timeout(remaining, op(attempt)).await {
                Ok(Ok(value)) => {
                    return Attempted {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Ok(Err(error)) => error,
                Err(_) => {
                    warn!(operation, attempt, "Attempt exceeded the remaining time budget");
                    return Attempted {
                        result: Err(self.timed_out(started)),
                        attempts: attempt,
                    };
                }
            };

            if !error.is_retryable() || attempt > self.max_retries {
                warn!(operation, attempt, error = %error, "Generation failed");
                return Attempted {
                    result: Err(error.with_attempts(attempt)),
                    attempts: attempt,
                };
            }

            let delay = self.backoff(attempt);
            if started.elapsed() + delay >= self.timeout {
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Next backoff would exhaust the time budget"
                );
                return Attempted {
                    result: Err(self.timed_out(started)),
                    attempts: attempt,
                };
            }

            warn!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after transport error"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
