//! Token-bucket admission control for provider calls.
//!
//! The bucket refills continuously at `capacity / window` tokens per second,
//! computed on demand from the time elapsed since the last refill, so no timer
//! task is involved. Refill and consume happen under one lock.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;

use crate::{
    clock::{Clock, SystemClock},
    error::FetchError,
    retry,
};

pub const DEFAULT_CAPACITY: u32 = 60;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

/// Shared by every fetch; clone the surrounding `Arc`, not the limiter.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    window: Duration,
    bucket: Mutex<Bucket>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// A full bucket of `capacity` tokens that refills completely every `window`.
    /// Zero values are raised to one token / one second.
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self::with_clock(capacity, window, Arc::new(SystemClock))
    }

    pub fn with_clock(capacity: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        let capacity = capacity.max(1);
        let window = if window.is_zero() { Duration::from_secs(1) } else { window };
        let bucket = Bucket { tokens: f64::from(capacity), last_refill: clock.now() };

        Self { capacity, window, bucket: Mutex::new(bucket), clock }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn tokens_per_sec(&self) -> f64 {
        f64::from(self.capacity) / self.window.as_secs_f64()
    }

    /// Take one token if one is available right now.
    ///
    /// On failure returns how long until the next token is due.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = self.clock.now();
        let rate = self.tokens_per_sec();
        let mut bucket = self.bucket.lock();

        // A clock that moved backwards yields no tokens and does not rewind `last_refill`.
        if let Ok(elapsed) = (now - bucket.last_refill).to_std() {
            if !elapsed.is_zero() {
                bucket.tokens =
                    (bucket.tokens + elapsed.as_secs_f64() * rate).min(f64::from(self.capacity));
                bucket.last_refill = now;
            }
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - bucket.tokens) / rate))
        }
    }

    /// Take one token, waiting for the bucket to refill for at most `timeout`.
    pub async fn acquire(&self, timeout: Duration) -> Result<(), FetchError> {
        let deadline = retry::deadline_after(timeout);

        loop {
            let wait = match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(?timeout, "Rate limit reached, giving up on provider call");
                return Err(FetchError::RateLimited { timeout });
            }

            let pause = wait.min(deadline - now);
            tracing::debug!(?pause, "Rate limit reached, waiting for a token");
            tokio::time::sleep(pause).await;
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn huge_timeout_does_not_overflow() {
        let (limiter, _clock) = limiter(1, Duration::from_secs(60));
        limiter.acquire(Duration::from_secs(u64::MAX)).await.unwrap();
    }

    fn limiter(capacity: u32, window: Duration) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (RateLimiter::with_clock(capacity, window, clock.clone()), clock)
    }

    #[tokio::test]
    async fn capacity_plus_one_without_elapsed_time() {
        let (limiter, _clock) = limiter(60, Duration::from_secs(60));

        for i in 0..60 {
            assert!(limiter.acquire(Duration::ZERO).await.is_ok(), "acquire {i} should pass");
        }
        let err = limiter.acquire(Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, FetchError::RateLimited { .. }));
    }

    #[test]
    fn refill_is_proportional_to_elapsed_time() {
        let (limiter, clock) = limiter(60, Duration::from_secs(60));
        for _ in 0..60 {
            limiter.try_acquire().unwrap();
        }

        let wait = limiter.try_acquire().unwrap_err();
        assert!(wait <= Duration::from_secs(1) && wait > Duration::from_millis(900));

        clock.advance(Duration::from_secs(3));
        for _ in 0..3 {
            limiter.try_acquire().unwrap();
        }
        assert!(limiter.try_acquire().is_err());
    }

    #[test]
    fn tokens_never_exceed_capacity() {
        let (limiter, clock) = limiter(5, Duration::from_secs(5));
        clock.advance(Duration::from_secs(3600));

        for _ in 0..5 {
            limiter.try_acquire().unwrap();
        }
        assert!(limiter.try_acquire().is_err());
    }

    #[test]
    fn clock_going_backwards_grants_nothing() {
        let (limiter, clock) = limiter(2, Duration::from_secs(2));
        let start = clock.now();
        limiter.try_acquire().unwrap();
        limiter.try_acquire().unwrap();

        clock.set(start - chrono::Duration::seconds(30));
        assert!(limiter.try_acquire().is_err());

        // Back to the original instant: that time was already accounted for.
        clock.set(start);
        assert!(limiter.try_acquire().is_err());

        clock.advance(Duration::from_secs(1));
        assert!(limiter.try_acquire().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_never_overdraw() {
        let (limiter, _clock) = limiter(10, Duration::from_secs(60));
        let limiter = Arc::new(limiter);

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.try_acquire().is_ok() })
            })
            .collect();

        let mut granted = 0;
        for task in tasks {
            if task.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 10);
    }

    #[tokio::test]
    async fn acquire_waits_for_refill_within_timeout() {
        // 2 tokens per 200ms: one new token every 100ms.
        let limiter = RateLimiter::new(2, Duration::from_millis(200));
        limiter.try_acquire().unwrap();
        limiter.try_acquire().unwrap();

        let started = std::time::Instant::now();
        limiter.acquire(Duration::from_secs(2)).await.unwrap();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(50), "waited only {waited:?}");
        assert!(waited < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn acquire_times_out_when_no_token_arrives() {
        let (limiter, _clock) = limiter(1, Duration::from_secs(60));
        limiter.try_acquire().unwrap();

        let started = std::time::Instant::now();
        let err = limiter.acquire(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, FetchError::RateLimited { timeout } if timeout == Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }
}
