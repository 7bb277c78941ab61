//! Retry Policy
//!
//! Bounded retry with exponential backoff and jitter. The policy only knows
//! how long to wait and when to give up; callers decide which errors are
//! transient.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Outcome of [`RetryPolicy::run`] when the operation never succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// A non-retryable error; returned immediately.
    Fatal(E),
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: usize, last_error: E },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RetryPolicy {
    /// Total attempts, first call included
    pub max_attempts: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Fraction of each delay randomized, 0.0..=1.0
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 100,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: initial_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            ..Self::default()
        }
    }

    /// No waiting between attempts. Used by tests.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn base_delay(&self, attempt: usize) -> Duration {
        let delay_ms =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt.min(i32::MAX as usize) as i32);
        let delay_ms = delay_ms.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(delay_ms as u64)
    }

    /// Base delay with up to `jitter` of it randomized away.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let factor = 1.0 - jitter * rand::thread_rng().gen::<f64>();
        base.mul_f64(factor)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or `max_attempts` is reached. A policy with `max_attempts == 0` still
    /// makes one attempt.
    pub async fn run<F, Fut, T, E>(
        &self,
        mut operation: F,
        is_retryable: impl Fn(&E) -> bool,
    ) -> std::result::Result<T, RetryError<E>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !is_retryable(&e) => return Err(RetryError::Fatal(e)),
                Err(e) => {
                    if attempt >= max_attempts {
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            last_error: e,
                        });
                    }
                    let delay = self.delay_for_attempt(attempt - 1);
                    warn!(
                        "Attempt {} of {} failed ({}), retrying in {:?}",
                        attempt, max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_default_allows_one_hundred_attempts() {
        assert_eq!(RetryPolicy::default().max_attempts, 100);
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(policy.base_delay(0), Duration::from_millis(100));
        assert_eq!(policy.base_delay(1), Duration::from_millis(200));
        assert_eq!(policy.base_delay(2), Duration::from_millis(400));
        assert_eq!(policy.base_delay(10), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter: 0.5,
            ..RetryPolicy::new(5, Duration::from_millis(1000), Duration::from_secs(10))
        };
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay <= Duration::from_millis(1000));
            assert!(delay >= Duration::from_millis(500));
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result = RetryPolicy::immediate(5)
            .run(
                move |_| async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err("throttled".to_string())
                    } else {
                        Ok(n)
                    }
                },
                |_| true,
            )
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let result: std::result::Result<(), _> = RetryPolicy::immediate(4)
            .run(|n| async move { Err(format!("failure {}", n)) }, |_| true)
            .await;
        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 4,
                last_error: "failure 4".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_fatal_error_stops_immediately() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: std::result::Result<(), _> = RetryPolicy::immediate(10)
            .run(
                move |_| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("bad request".to_string())
                },
                |e| e.contains("throttl"),
            )
            .await;
        assert_eq!(result, Err(RetryError::Fatal("bad request".to_string())));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
