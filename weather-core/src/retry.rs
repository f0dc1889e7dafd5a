//! Bounded retry with exponential backoff for provider calls.
//!
//! Retried (see [`FetchError::is_retryable`]):
//! - Network failures: timeouts, connection resets
//! - 5xx provider errors, plus 408 and 429
//!
//! Not retried:
//! - Other 4xx client errors (invalid API key, unknown location)
//! - Malformed responses and insecure endpoints

use rand::Rng;
use std::{future::Future, time::Duration};
use tokio::time::Instant;

use crate::error::FetchError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1500);
pub const DEFAULT_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Stand-in for "no deadline" when `now + timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + timeout`, saturating instead of panicking on absurdly large timeouts.
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Growth factor applied to the delay after every failed attempt.
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Randomize each delay into `[delay / 2, delay]`.
    pub jitter: bool,
    /// Upper bound for a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: true,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

/// Bookkeeping for one attempt of one logical fetch.
#[derive(Debug)]
pub struct RetryAttempt {
    /// 1-based.
    pub number: u32,
    pub previous_error: Option<FetchError>,
    /// How long we waited before this attempt.
    pub backoff: Duration,
}

impl RetryAttempt {
    fn first() -> Self {
        Self { number: 1, previous_error: None, backoff: Duration::ZERO }
    }

    fn next(self, error: FetchError, backoff: Duration) -> Self {
        Self { number: self.number + 1, previous_error: Some(error), backoff }
    }
}

impl RetryPolicy {
    /// Policy that tries exactly once.
    pub fn no_retry() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    /// Backoff after failed attempt `attempt` (1-based), before jitter:
    /// `base_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    fn backoff_after(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if self.jitter && !delay.is_zero() {
            delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
        } else {
            delay
        }
    }

    /// Run `operation` until it succeeds, fails terminally, runs out of
    /// attempts, or would run past `deadline`.
    ///
    /// Each attempt is bounded by `attempt_timeout` (and by the time left until
    /// `deadline`); an attempt that overruns counts as a retryable network error.
    pub async fn run<T, F, Fut>(&self, deadline: Instant, mut operation: F) -> Result<T, FetchError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = RetryAttempt::first();

        loop {
            let budget = self.attempt_timeout.min(deadline.saturating_duration_since(Instant::now()));
            let outcome = match tokio::time::timeout(budget, operation(attempt.number)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(FetchError::Network(format!(
                    "attempt {} timed out after {budget:?}",
                    attempt.number
                ))),
            };

            let error = match outcome {
                Ok(value) => {
                    if attempt.number > 1 {
                        tracing::info!("Provider call succeeded after {} attempts", attempt.number);
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => {
                    tracing::debug!("Non-retryable error on attempt {}: {e}", attempt.number);
                    return Err(e);
                }
                Err(e) => e,
            };

            if attempt.number >= max_attempts {
                tracing::error!("All {max_attempts} attempts exhausted, last error: {error}");
                return Err(FetchError::RetriesExhausted {
                    attempts: attempt.number,
                    source: Box::new(error),
                });
            }

            let backoff = self.backoff_after(attempt.number);
            if Instant::now().checked_add(backoff).is_none_or(|resume| resume >= deadline) {
                tracing::error!(
                    "Request deadline reached after {} attempts, last error: {error}",
                    attempt.number
                );
                return Err(FetchError::RetriesExhausted {
                    attempts: attempt.number,
                    source: Box::new(error),
                });
            }

            tracing::warn!(
                "Retryable error on attempt {} of {max_attempts}: {error}; retrying in {backoff:?}",
                attempt.number
            );
            attempt = attempt.next(error, backoff);
            tokio::time::sleep(attempt.backoff).await;

            if let Some(previous) = &attempt.previous_error {
                tracing::debug!(attempt = attempt.number, %previous, "Retrying provider call");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(10),
            jitter: false,
            attempt_timeout: Duration::from_secs(1),
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(1500));
        assert!(policy.attempt_timeout < Duration::from_secs(30));
    }

    #[test]
    fn delay_grows_exponentially() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            ..fast_policy(5)
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            ..fast_policy(10)
        };

        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(5),
            jitter: true,
            ..fast_policy(3)
        };

        for _ in 0..100 {
            let delay = policy.backoff_after(1);
            assert!(delay >= Duration::from_millis(200) && delay <= Duration::from_millis(400));
        }
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let calls = &AtomicU32::new(0);
        let result = fast_policy(3)
            .run(far_deadline(), move |_| async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err(FetchError::Network("connection reset".into())) } else { Ok(n) }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(3)
            .run(far_deadline(), move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FetchError::ProviderServer { status: 503, message: "unavailable".into() })
            })
            .await;

        match result.unwrap_err() {
            FetchError::RetriesExhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert_eq!(source.status(), Some(503));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_error_is_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(3)
            .run(far_deadline(), move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FetchError::ProviderClient { status: 404, message: "city not found".into() })
            })
            .await;

        assert!(matches!(result, Err(FetchError::ProviderClient { status: 404, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempt_numbers_are_one_based() {
        let mut seen = Vec::new();
        let _: Result<(), _> = fast_policy(3)
            .run(far_deadline(), |n| {
                seen.push(n);
                async { Err(FetchError::Network("down".into())) }
            })
            .await;

        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn slow_attempt_times_out_and_is_retried() {
        let policy = RetryPolicy { attempt_timeout: Duration::from_millis(20), ..fast_policy(2) };
        let calls = &AtomicU32::new(0);

        let result = policy
            .run(far_deadline(), move |_| async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 1 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok(n)
            })
            .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn huge_timeout_saturates() {
        let deadline = deadline_after(Duration::from_secs(u64::MAX));
        assert!(deadline > Instant::now() + Duration::from_secs(86_400));
    }

    #[tokio::test]
    async fn stops_at_deadline() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(1),
            ..fast_policy(10)
        };
        let calls = &AtomicU32::new(0);
        let deadline = Instant::now() + Duration::from_millis(100);

        let result: Result<(), _> = policy
            .run(deadline, move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FetchError::Network("down".into()))
            })
            .await;

        assert!(matches!(result, Err(FetchError::RetriesExhausted { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
