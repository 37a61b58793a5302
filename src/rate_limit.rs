//! Token-bucket admission control with exponential backoff.
//!
//! Every connector owns exactly one [`RateLimiter`]; limiters are never
//! shared across platforms. The bucket holds up to `burst_limit` tokens and
//! refills continuously at `requests_per_minute / 60` tokens per second.
//!
//! The backoff counter is independent of the bucket: connectors escalate
//! it after an explicit rate-limit response from the remote API and reset
//! it on the next success.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::RateLimitConfig;
use crate::error::ConnectorError;

/// Ceiling for any backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Escalating delay: `min(multiplier ^ failures, MAX_BACKOFF)` seconds.
#[derive(Debug, Clone)]
pub struct Backoff {
    multiplier: f64,
    failures: u32,
}

impl Backoff {
    pub fn new(multiplier: f64) -> Self {
        Self {
            multiplier,
            failures: 0,
        }
    }

    /// Returns the delay for the current failure count, then increments it.
    pub fn next_delay(&mut self) -> Duration {
        let exp = i32::try_from(self.failures).unwrap_or(i32::MAX);
        let secs = self.multiplier.powi(exp);
        self.failures = self.failures.saturating_add(1);
        if !secs.is_finite() || secs >= MAX_BACKOFF.as_secs_f64() {
            MAX_BACKOFF
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, capacity: f64, per_sec: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * per_sec).min(capacity);
        self.last_refill = now;
    }
}

/// Point-in-time view of a limiter, for status reporting.
#[derive(Debug, Clone)]
pub struct RateLimiterState {
    pub tokens_remaining: f64,
    pub last_refill: Instant,
    pub consecutive_failures: u32,
}

pub struct RateLimiter {
    platform: String,
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
    backoff: Mutex<Backoff>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RateLimiter {
    /// Build a limiter from a validated [`RateLimitConfig`]. The bucket
    /// starts full.
    pub fn new(platform: impl Into<String>, config: &RateLimitConfig) -> Self {
        let capacity = f64::from(config.burst_limit.max(1));
        Self {
            platform: platform.into(),
            capacity,
            refill_per_sec: f64::from(config.requests_per_minute.max(1)) / 60.0,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            backoff: Mutex::new(Backoff::new(config.backoff_multiplier)),
        }
    }

    /// Take one token without waiting. Returns `false` if the bucket is empty.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = lock(&self.bucket);
        bucket.refill(self.capacity, self.refill_per_sec, Instant::now());
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Block until a token is available or `cancel` fires.
    ///
    /// The lock is only held while the bucket is inspected, never across
    /// the sleep, so concurrent waiters do not serialize on it.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), ConnectorError> {
        loop {
            if cancel.is_cancelled() {
                return Err(ConnectorError::cancelled(&self.platform));
            }

            let delay = {
                let mut bucket = lock(&self.bucket);
                bucket.refill(self.capacity, self.refill_per_sec, Instant::now());
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.refill_per_sec)
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(ConnectorError::cancelled(&self.platform)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Current backoff delay; increments the failure counter.
    pub fn get_backoff_delay(&self) -> Duration {
        lock(&self.backoff).next_delay()
    }

    pub fn reset_backoff(&self) {
        lock(&self.backoff).reset();
    }

    pub fn state(&self) -> RateLimiterState {
        let mut bucket = lock(&self.bucket);
        bucket.refill(self.capacity, self.refill_per_sec, Instant::now());
        RateLimiterState {
            tokens_remaining: bucket.tokens,
            last_refill: bucket.last_refill,
            consecutive_failures: lock(&self.backoff).failures(),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("platform", &self.platform)
            .field("capacity", &self.capacity)
            .field("refill_per_sec", &self.refill_per_sec)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(rpm: u32, burst: u32, multiplier: f64) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_hour: 0,
            requests_per_minute: rpm,
            burst_limit: burst,
            backoff_multiplier: multiplier,
            max_retries: 3,
        }
    }

    #[test]
    fn test_burst_then_empty() {
        let limiter = RateLimiter::new("test", &config(1, 3, 2.0));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert!(limiter.state().tokens_remaining >= 0.0);
    }

    #[test]
    fn test_backoff_strictly_increases_until_cap() {
        let limiter = RateLimiter::new("test", &config(60, 1, 2.0));
        let mut prev = Duration::ZERO;
        let mut hit_cap = false;
        for _ in 0..20 {
            let d = limiter.get_backoff_delay();
            if hit_cap {
                assert_eq!(d, MAX_BACKOFF);
            } else if d == MAX_BACKOFF {
                hit_cap = true;
            } else {
                assert!(d > prev, "{:?} should exceed {:?}", d, prev);
            }
            prev = d;
        }
        assert!(hit_cap);
        assert_eq!(limiter.state().consecutive_failures, 20);
    }

    #[test]
    fn test_reset_returns_to_base_delay() {
        let limiter = RateLimiter::new("test", &config(60, 1, 3.0));
        let base = limiter.get_backoff_delay();
        assert_eq!(base, Duration::from_secs(1));
        assert_eq!(limiter.get_backoff_delay(), Duration::from_secs(3));
        limiter.reset_backoff();
        assert_eq!(limiter.get_backoff_delay(), base);
    }

    #[tokio::test]
    async fn test_wait_consumes_available_token() {
        let limiter = RateLimiter::new("test", &config(60, 2, 2.0));
        let cancel = CancellationToken::new();
        limiter.wait(&cancel).await.unwrap();
        limiter.wait(&cancel).await.unwrap();
        assert!(limiter.state().tokens_remaining < 1.0);
    }

    #[tokio::test]
    async fn test_wait_refills_over_time() {
        // 600 rpm = 10 tokens/sec, so an empty bucket refills in ~100ms.
        let limiter = RateLimiter::new("test", &config(600, 1, 2.0));
        let cancel = CancellationToken::new();
        limiter.wait(&cancel).await.unwrap();
        let started = Instant::now();
        limiter.wait(&cancel).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_wait_honors_cancellation() {
        // 1 rpm: the next token is a minute away.
        let limiter = RateLimiter::new("test", &config(1, 1, 2.0));
        let cancel = CancellationToken::new();
        limiter.wait(&cancel).await.unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = limiter.wait(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
