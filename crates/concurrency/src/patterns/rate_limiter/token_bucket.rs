//! Token bucket algorithm

use std::time::{Duration, Instant};

use super::{Admission, RateAlgorithm};
use crate::core::{ConfigError, ConfigResult, ensure_finite, ensure_positive_u32};

/// Token bucket
///
/// Holds up to `capacity` tokens and refills continuously at
/// `refill_per_sec`. Each admission consumes one token. The bucket starts
/// full, so up to `capacity` calls may burst before the refill rate applies.
///
/// A refill rate of zero means the initial tokens are never replenished.
/// Admission requires a whole token; [`Admission::RetryAfter`] is rounded up
/// to the nanosecond at which that token exists, and saturates at
/// [`Duration::MAX`] for rates too small to represent.
///
/// # Examples
///
/// ```
/// use std::time::{Duration, Instant};
/// use nebula_concurrency::patterns::rate_limiter::{Admission, RateAlgorithm, TokenBucket};
///
/// let start = Instant::now();
/// let mut bucket = TokenBucket::new(1, 2.0, start).unwrap();
/// assert_eq!(bucket.try_admit(start), Admission::Granted);
/// assert_eq!(
///     bucket.try_admit(start),
///     Admission::RetryAfter(Duration::from_millis(500))
/// );
/// ```
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u32,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket observed at `now`.
    ///
    /// # Errors
    ///
    /// Rejects a zero capacity and a negative or non-finite refill rate.
    pub fn new(capacity: u32, refill_per_sec: f64, now: Instant) -> ConfigResult<Self> {
        ensure_positive_u32("capacity", capacity)?;
        ensure_finite("refill_per_sec", refill_per_sec)?;
        if refill_per_sec < 0.0 {
            return Err(ConfigError::validation(
                "refill_per_sec",
                format!("must not be negative, got {refill_per_sec}"),
            ));
        }

        Ok(Self {
            capacity,
            refill_per_sec,
            tokens: f64::from(capacity),
            last_refill: now,
        })
    }

    /// Bucket capacity
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Refill rate in tokens per second
    #[must_use]
    pub fn refill_per_sec(&self) -> f64 {
        self.refill_per_sec
    }

    /// Fractional token count after refilling up to `now`.
    pub fn tokens(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    fn refill(&mut self, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(f64::from(self.capacity));
        self.last_refill = now;
    }

    fn time_to_next_token(&self) -> Duration {
        let missing = 1.0 - self.tokens;
        let Ok(wait) = Duration::try_from_secs_f64(missing / self.refill_per_sec) else {
            return Duration::MAX;
        };
        if self.tokens + wait.as_secs_f64() * self.refill_per_sec < 1.0 {
            wait.saturating_add(Duration::from_nanos(1))
        } else {
            wait
        }
    }
}

impl RateAlgorithm for TokenBucket {
    fn try_admit(&mut self, now: Instant) -> Admission {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            return Admission::Granted;
        }
        if self.refill_per_sec <= 0.0 {
            return Admission::Exhausted;
        }

        Admission::RetryAfter(self.time_to_next_token())
    }

    fn available(&mut self, now: Instant) -> u64 {
        self.refill(now);
        self.tokens.floor() as u64
    }

    fn reset(&mut self, now: Instant) {
        self.tokens = f64::from(self.capacity);
        self.last_refill = now;
    }
}
