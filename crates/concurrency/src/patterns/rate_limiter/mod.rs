//! Rate limiting
//!
//! Three admission algorithms share one front end, [`RateLimiter`]:
//!
//! - **[`TokenBucket`]**: bursts up to a capacity, refills continuously
//! - **[`SlidingWindow`]**: at most `limit` admissions in any trailing window
//! - **[`SteadyTick`]**: admissions spaced at least a fixed interval apart
//!
//! Each algorithm implements [`RateAlgorithm`] and works on explicit instants,
//! so it can also be driven standalone. The front end adds the clock, the
//! lock, FIFO ordering of blocked callers and metrics.
//!
//! # Examples
//!
//! ```
//! use nebula_concurrency::patterns::rate_limiter::RateLimiter;
//!
//! let limiter = RateLimiter::token_bucket(10, 5.0).unwrap();
//! assert!(limiter.allow());
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::{
    CancellationSignal, ConcurrencyResult, ConfigResult, PatternConfig, SharedClock, SystemClock,
    constants,
};
use crate::observability::{ObservabilityHooks, PatternEvent};

mod sliding_window;
mod steady_tick;
mod token_bucket;

pub use sliding_window::SlidingWindow;
pub use steady_tick::SteadyTick;
pub use token_bucket::TokenBucket;

/// Lower bound on a single wait so that float rounding cannot spin.
const MIN_WAIT: Duration = Duration::from_micros(1);

/// Outcome of a single admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The call may proceed; one permit was consumed.
    Granted,
    /// No permit now; one becomes available after the given delay.
    RetryAfter(Duration),
    /// No permit will ever become available.
    Exhausted,
}

impl Admission {
    /// `true` for [`Admission::Granted`]
    #[must_use]
    pub fn is_granted(self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Admission algorithm driven by explicit instants.
///
/// Implementations are plain state machines; the caller provides mutual
/// exclusion and the time source.
pub trait RateAlgorithm: Send + fmt::Debug {
    /// Try to consume one permit at `now`.
    fn try_admit(&mut self, now: Instant) -> Admission;

    /// Whole permits available at `now`.
    fn available(&mut self, now: Instant) -> u64;

    /// Return to the initial state as of `now`.
    fn reset(&mut self, now: Instant);
}

/// Rate limiter configuration, tagged by `strategy`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RateLimiterConfig {
    /// See [`TokenBucket`]
    TokenBucket {
        /// Maximum burst size
        capacity: u32,
        /// Tokens added per second
        refill_per_sec: f64,
    },
    /// See [`SlidingWindow`]
    SlidingWindow {
        /// Maximum admissions per window
        limit: u32,
        /// Window length
        #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
        window: Duration,
    },
    /// See [`SteadyTick`]
    SteadyTick {
        /// Minimum gap between admissions
        #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
        min_interval: Duration,
    },
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::TokenBucket {
            capacity: constants::DEFAULT_RATE_LIMIT as u32,
            refill_per_sec: constants::DEFAULT_RATE_LIMIT,
        }
    }
}

impl RateLimiterConfig {
    /// Instantiate the configured algorithm as of `now`.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure.
    pub fn build(&self, now: Instant) -> ConfigResult<Box<dyn RateAlgorithm>> {
        Ok(match *self {
            Self::TokenBucket {
                capacity,
                refill_per_sec,
            } => Box::new(TokenBucket::new(capacity, refill_per_sec, now)?),
            Self::SlidingWindow { limit, window } => Box::new(SlidingWindow::new(limit, window)?),
            Self::SteadyTick { min_interval } => Box::new(SteadyTick::new(min_interval)),
        })
    }

    /// Strategy name as used in the serialized form
    #[must_use]
    pub fn strategy(&self) -> &'static str {
        match self {
            Self::TokenBucket { .. } => "token_bucket",
            Self::SlidingWindow { .. } => "sliding_window",
            Self::SteadyTick { .. } => "steady_tick",
        }
    }
}

impl PatternConfig for RateLimiterConfig {
    fn validate(&self) -> ConfigResult<()> {
        self.build(Instant::now()).map(|_| ())
    }

    fn default_config() -> Self {
        Self::default()
    }
}

/// Point-in-time view of a [`RateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterSnapshot {
    /// Whole permits available right now
    pub available_permits: u64,
    /// Callers currently blocked in [`RateLimiter::wait`]
    pub waiting_callers: usize,
    /// Total admissions granted
    pub admitted: u64,
    /// Total non-blocking rejections from [`RateLimiter::allow`]
    pub rejected: u64,
}

/// Thread-safe rate limiter front end.
///
/// All state transitions happen under one lock per limiter. Callers blocked
/// in [`wait`](Self::wait) are served in arrival order: only the head of the
/// queue sleeps on the algorithm, the rest wait their turn. [`allow`] does not
/// queue and may take a permit ahead of blocked callers.
///
/// [`allow`]: Self::allow
pub struct RateLimiter {
    config: RateLimiterConfig,
    algorithm: Mutex<Box<dyn RateAlgorithm>>,
    queue: tokio::sync::Mutex<()>,
    clock: SharedClock,
    waiting: AtomicUsize,
    admitted: AtomicU64,
    rejected: AtomicU64,
    hooks: ObservabilityHooks,
}

impl RateLimiter {
    /// Create a limiter on the system clock
    ///
    /// # Errors
    ///
    /// Returns a validation error for invalid parameters.
    pub fn new(config: RateLimiterConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock::shared())
    }

    /// Create a limiter on an explicit clock
    ///
    /// # Errors
    ///
    /// Returns a validation error for invalid parameters.
    pub fn with_clock(config: RateLimiterConfig, clock: SharedClock) -> ConfigResult<Self> {
        let algorithm = config.build(clock.now())?;
        Ok(Self {
            config,
            algorithm: Mutex::new(algorithm),
            queue: tokio::sync::Mutex::new(()),
            clock,
            waiting: AtomicUsize::new(0),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            hooks: ObservabilityHooks::new(),
        })
    }

    /// Token bucket limiter on the system clock
    ///
    /// # Errors
    ///
    /// Rejects a zero capacity and a negative refill rate.
    pub fn token_bucket(capacity: u32, refill_per_sec: f64) -> ConfigResult<Self> {
        Self::new(RateLimiterConfig::TokenBucket {
            capacity,
            refill_per_sec,
        })
    }

    /// Sliding window limiter on the system clock
    ///
    /// # Errors
    ///
    /// Rejects a zero limit or window.
    pub fn sliding_window(limit: u32, window: Duration) -> ConfigResult<Self> {
        Self::new(RateLimiterConfig::SlidingWindow { limit, window })
    }

    /// Steady tick limiter on the system clock
    ///
    /// # Errors
    ///
    /// Never fails; kept fallible for symmetry with the other constructors.
    pub fn steady_tick(min_interval: Duration) -> ConfigResult<Self> {
        Self::new(RateLimiterConfig::SteadyTick { min_interval })
    }

    /// Attach observability hooks
    #[must_use = "builder methods must be chained or built"]
    pub fn with_hooks(mut self, hooks: ObservabilityHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Non-blocking admission.
    pub fn allow(&self) -> bool {
        let admission = self.algorithm.lock().try_admit(self.clock.now());
        match admission {
            Admission::Granted => {
                self.admitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Admission::RetryAfter(wait) => {
                self.reject(Some(wait));
                false
            }
            Admission::Exhausted => {
                self.reject(None);
                false
            }
        }
    }

    fn reject(&self, retry_after: Option<Duration>) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(?retry_after, strategy = self.config.strategy(), "rate limited");
        self.hooks.emit(PatternEvent::RateLimited { retry_after });
    }

    /// Block until a permit is granted or `signal` fires.
    ///
    /// The signal is checked immediately before every admission attempt, so a
    /// cancelled wait never consumes a permit.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] or [`DeadlineExceeded`] when the signal fires
    /// first.
    ///
    /// [`Cancelled`]: crate::ConcurrencyError::Cancelled
    /// [`DeadlineExceeded`]: crate::ConcurrencyError::DeadlineExceeded
    pub async fn wait(&self, signal: &CancellationSignal) -> ConcurrencyResult<()> {
        if let Some(cause) = signal.err() {
            return Err(cause.into());
        }

        let _waiting = WaitingGuard::enter(&self.waiting);
        let _turn = tokio::select! {
            biased;
            cause = signal.cancelled() => return Err(cause.into()),
            turn = self.queue.lock() => turn,
        };

        loop {
            let admission = {
                let mut algorithm = self.algorithm.lock();
                if let Some(cause) = signal.err() {
                    return Err(cause.into());
                }
                algorithm.try_admit(self.clock.now())
            };

            match admission {
                Admission::Granted => {
                    self.admitted.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Admission::RetryAfter(wait) => {
                    tracing::trace!(?wait, "waiting for permit");
                    signal.sleep(self.clock.as_ref(), wait.max(MIN_WAIT)).await?;
                }
                Admission::Exhausted => {
                    tracing::debug!("limiter exhausted, waiting for cancellation");
                    return Err(signal.cancelled().await.into());
                }
            }
        }
    }

    /// Wait for a permit, then run `operation`.
    ///
    /// # Errors
    ///
    /// Returns the cancellation cause if no permit was granted, otherwise the
    /// result of `operation`.
    pub async fn execute<T, F, Fut>(
        &self,
        signal: &CancellationSignal,
        operation: F,
    ) -> ConcurrencyResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ConcurrencyResult<T>>,
    {
        self.wait(signal).await?;
        operation().await
    }

    /// Consistent snapshot of the limiter's counters.
    #[must_use]
    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let mut algorithm = self.algorithm.lock();
        RateLimiterSnapshot {
            available_permits: algorithm.available(self.clock.now()),
            waiting_callers: self.waiting.load(Ordering::Acquire),
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Restore the algorithm to its initial state. Counters are kept.
    pub fn reset(&self) {
        self.algorithm.lock().reset(self.clock.now());
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("waiting", &self.waiting.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Shared limiter handle
pub type SharedRateLimiter = Arc<RateLimiter>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CancelCause, ConcurrencyError, ManualClock};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_config_serde_tagged() {
        let config = RateLimiterConfig::TokenBucket {
            capacity: 10,
            refill_per_sec: 2.5,
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["strategy"], "token_bucket");
        assert_eq!(json["capacity"], 10);

        let back: RateLimiterConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(RateLimiter::token_bucket(0, 1.0).is_err());
        assert!(RateLimiter::sliding_window(5, Duration::ZERO).is_err());
        assert!(
            RateLimiterConfig::SlidingWindow {
                limit: 0,
                window: Duration::from_secs(1)
            }
            .validate()
            .is_err()
        );
    }

    #[test]
    fn test_allow_and_snapshot() {
        let clock = ManualClock::new();
        let limiter = RateLimiter::with_clock(
            RateLimiterConfig::TokenBucket {
                capacity: 2,
                refill_per_sec: 1.0,
            },
            clock.shared(),
        )
        .unwrap();

        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());

        assert_eq!(
            limiter.snapshot(),
            RateLimiterSnapshot {
                available_permits: 0,
                waiting_callers: 0,
                admitted: 2,
                rejected: 1,
            }
        );

        clock.advance(Duration::from_secs(1));
        assert_eq!(limiter.snapshot().available_permits, 1);
    }

    #[test]
    fn test_reset_restores_capacity() {
        let limiter = RateLimiter::with_clock(
            RateLimiterConfig::SteadyTick {
                min_interval: Duration::from_secs(60),
            },
            ManualClock::new().shared(),
        )
        .unwrap();
        assert!(limiter.allow());
        assert!(!limiter.allow());
        limiter.reset();
        assert!(limiter.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_sleeps_until_permit() {
        let limiter = RateLimiter::steady_tick(Duration::from_millis(100)).unwrap();
        let signal = CancellationSignal::never();
        let start = tokio::time::Instant::now();

        limiter.wait(&signal).await.unwrap();
        limiter.wait(&signal).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(limiter.snapshot().admitted, 2);
    }

    #[tokio::test]
    async fn test_wait_on_cancelled_signal_admits_nothing() {
        let limiter = RateLimiter::token_bucket(5, 1.0).unwrap();
        let (signal, cancel) = CancellationSignal::root();
        cancel.cancel();

        let err = limiter.wait(&signal).await.unwrap_err();
        assert!(matches!(err, ConcurrencyError::Cancelled));
        assert_eq!(limiter.snapshot().available_permits, 5);
        assert_eq!(limiter.snapshot().admitted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_wait_returns_deadline() {
        let limiter = RateLimiter::token_bucket(1, 0.0).unwrap();
        assert!(limiter.allow());

        let (root, _) = CancellationSignal::root();
        let (signal, _) = CancellationSignal::with_timeout(
            &root,
            Duration::from_millis(250),
            SystemClock::shared(),
        );
        let err = limiter.wait(&signal).await.unwrap_err();
        assert!(matches!(err, ConcurrencyError::DeadlineExceeded));
        assert_eq!(signal.err(), Some(CancelCause::DeadlineExceeded));
        assert_eq!(limiter.snapshot().waiting_callers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_runs_after_admission() {
        let limiter = RateLimiter::token_bucket(1, 10.0).unwrap();
        let signal = CancellationSignal::never();
        let value = limiter
            .execute(&signal, || async { Ok::<_, ConcurrencyError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
