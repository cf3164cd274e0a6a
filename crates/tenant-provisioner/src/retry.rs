//! Bounded retry and polling helpers.
//!
//! Two waits exist in this crate: transient-error retries around cluster and
//! database calls, and readiness polls (certificate issuance, token population).
//! Both go through this module so their suspension behaviour is consistent, and
//! polls take a [`Clock`] so tests can run them on virtual time.

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

/// Retry policy for transient infrastructure errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Initial delay between retries, in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between retries, in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff multiplier.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate the delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.min(10)).unwrap_or(10);
        let multiplier = self.backoff_multiplier.powi(exp);
        #[allow(clippy::cast_precision_loss)]
        let delay_ms = self.initial_delay_ms as f64 * multiplier;
        #[allow(clippy::cast_precision_loss)]
        let capped = delay_ms.min(self.max_delay_ms as f64);
        Duration::from_secs_f64(capped / 1000.0)
    }

    /// Check if we should retry given the number of attempts already made.
    #[must_use]
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Execute an async operation, retrying errors that `is_transient` accepts.
///
/// Non-transient errors are returned immediately. Delays use exponential
/// backoff with 0.5x-1.5x jitter.
///
/// # Errors
///
/// Returns the last error once attempts are exhausted, or the first
/// non-transient error.
pub async fn retry_transient<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    is_transient: fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if is_transient(&e) && config.should_retry(attempts) => {
                let delay = config.delay_for_attempt(attempts - 1);
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempts,
                    error = %e,
                    delay_ms = jittered.as_millis(),
                    "Transient error, retrying"
                );

                tokio::time::sleep(jittered).await;
            }
            Err(e) => {
                if is_transient(&e) {
                    error!(
                        operation = %operation_name,
                        attempts,
                        error = %e,
                        "Operation failed after max retries"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Source of time for polling loops.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Suspend for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Result of a bounded poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The probe produced a value before the deadline.
    Ready(T),
    /// The deadline passed first.
    TimedOut,
}

/// Call `probe` every `interval` until it yields a value or `timeout` elapses.
///
/// The probe always runs at least once. The last sleep is shortened so the
/// total wait never exceeds `timeout`.
///
/// # Errors
///
/// Propagates the first error returned by `probe`.
pub async fn poll_until<F, Fut, T, E>(
    clock: &dyn Clock,
    interval: Duration,
    timeout: Duration,
    mut probe: F,
) -> Result<PollOutcome<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let deadline = clock.now() + timeout;

    loop {
        if let Some(value) = probe().await? {
            return Ok(PollOutcome::Ready(value));
        }

        let now = clock.now();
        if now >= deadline {
            return Ok(PollOutcome::TimedOut);
        }

        clock.sleep(interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::testing::FakeClock;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_retry_delay_calculation() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(2000));
        assert!(config.delay_for_attempt(100) <= Duration::from_millis(config.max_delay_ms));
    }

    #[test]
    fn test_should_retry() {
        let config = RetryConfig::default();
        assert!(config.should_retry(1));
        assert!(config.should_retry(2));
        assert!(!config.should_retry(3));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<u32, String> =
            retry_transient(&fast_config(3), "op", |_| true, || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err("unavailable".to_string())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(2));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), String> =
            retry_transient(&fast_config(3), "op", |_| true, || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("unavailable".to_string())
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), String> =
            retry_transient(&fast_config(5), "op", |_| false, || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("rejected".to_string())
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_poll_returns_ready_value() {
        let clock = FakeClock::new();
        let count = AtomicU32::new(0);

        let outcome: Result<_, ()> = poll_until(
            &clock,
            Duration::from_secs(5),
            Duration::from_secs(120),
            || {
                let n = count.fetch_add(1, Ordering::SeqCst);
                async move { Ok((n == 3).then_some(n)) }
            },
        )
        .await;

        assert_eq!(outcome, Ok(PollOutcome::Ready(3)));
        assert_eq!(clock.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_poll_times_out_within_bound() {
        let clock = FakeClock::new();
        let interval = Duration::from_secs(7);
        let timeout = Duration::from_secs(60);

        let outcome: Result<PollOutcome<()>, ()> =
            poll_until(&clock, interval, timeout, || async { Ok(None) }).await;

        assert_eq!(outcome, Ok(PollOutcome::TimedOut));
        assert!(clock.elapsed() >= timeout);
        assert!(clock.elapsed() <= timeout + interval);
    }

    #[tokio::test]
    async fn test_poll_propagates_probe_errors() {
        let clock = FakeClock::new();
        let outcome: Result<PollOutcome<()>, &str> = poll_until(
            &clock,
            Duration::from_secs(1),
            Duration::from_secs(10),
            || async { Err("gone") },
        )
        .await;

        assert_eq!(outcome, Err("gone"));
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }
}
