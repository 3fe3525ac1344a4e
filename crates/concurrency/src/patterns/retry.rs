//! Retry with backoff
//!
//! [`RetryEngine`] runs an operation up to `max_attempts` times. Failures are
//! classified as retryable or terminal by a predicate (everything is
//! retryable by default); terminal failures and cancellation end the loop
//! immediately. Between attempts the engine sleeps on its clock, racing the
//! caller's cancellation signal.
//!
//! Delays for the wait after attempt `k` (1-based), with base `d0`, cap
//! `d_max` and factor `b`:
//!
//! | Strategy              | Delay                                  |
//! |-----------------------|----------------------------------------|
//! | `Fixed`               | `d0`                                   |
//! | `Linear`              | `min(d_max, d0 * k)`                   |
//! | `Exponential`         | `min(d_max, d0 * b^(k-1))`             |
//! | `ExponentialJitter`   | exponential, times `U[0.85, 1.15]`     |
//!
//! Multiplicative jitter is applied after the cap.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::{
    CancellationSignal, ConcurrencyError, ConcurrencyResult, ConfigError, ConfigResult,
    PatternConfig, SharedClock, SystemClock, constants, ensure_finite, ensure_non_zero,
    ensure_positive_u32,
};
use crate::observability::{ObservabilityHooks, PatternEvent};

/// Lower bound of the multiplicative jitter factor
pub const JITTER_MIN: f64 = 0.85;
/// Upper bound of the multiplicative jitter factor
pub const JITTER_MAX: f64 = 1.15;

/// Backoff curve between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Constant delay
    Fixed,
    /// Delay grows by `base_delay` per attempt
    Linear,
    /// Delay multiplies by `backoff_factor` per attempt
    #[default]
    Exponential,
    /// Exponential with multiplicative jitter
    ExponentialJitter,
}

/// Jitter applied on top of the backoff curve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterPolicy {
    /// Use the computed delay exactly
    #[default]
    None,
    /// Scale the delay by a uniform factor in `[0.85, 1.15]`
    Multiplicative,
}

impl JitterPolicy {
    /// Apply jitter using `fastrand`
    #[must_use]
    pub fn apply(self, delay: Duration) -> Duration {
        match self {
            Self::None => delay,
            Self::Multiplicative => {
                let factor = JITTER_MIN + fastrand::f64() * (JITTER_MAX - JITTER_MIN);
                Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(delay)
            }
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub base_delay: Duration,
    /// Upper bound for any single delay before jitter
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub max_delay: Duration,
    /// Growth factor for exponential strategies
    pub backoff_factor: f64,
    /// Backoff curve
    #[serde(default)]
    pub strategy: BackoffStrategy,
    /// Extra jitter for non-jittered strategies
    #[serde(default)]
    pub jitter: JitterPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: constants::DEFAULT_RETRY_ATTEMPTS,
            base_delay: constants::DEFAULT_BASE_DELAY,
            max_delay: constants::DEFAULT_MAX_DELAY,
            backoff_factor: 2.0,
            strategy: BackoffStrategy::Exponential,
            jitter: JitterPolicy::None,
        }
    }
}

impl RetryConfig {
    /// Constant delay between attempts
    #[must_use]
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay.max(constants::DEFAULT_MAX_DELAY),
            strategy: BackoffStrategy::Fixed,
            ..Self::default()
        }
    }

    /// Linearly growing delay
    #[must_use]
    pub fn linear(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Linear,
            ..Self::default()
        }
    }

    /// Exponentially growing delay
    #[must_use]
    pub fn exponential(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
    ) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            backoff_factor,
            strategy: BackoffStrategy::Exponential,
            jitter: JitterPolicy::None,
        }
    }

    /// Exponential delay with multiplicative jitter
    #[must_use]
    pub fn exponential_jitter(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
    ) -> Self {
        Self {
            strategy: BackoffStrategy::ExponentialJitter,
            ..Self::exponential(max_attempts, base_delay, max_delay, backoff_factor)
        }
    }

    /// Set jitter policy
    #[must_use = "builder methods must be chained or built"]
    pub fn with_jitter(mut self, jitter: JitterPolicy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay after failed attempt `attempt` (1-based), before jitter.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential | BackoffStrategy::ExponentialJitter => {
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
                Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
            }
        };
        delay.min(self.max_delay)
    }

    /// Delay after failed attempt `attempt`, with jitter applied.
    #[must_use]
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        self.effective_jitter().apply(self.delay_for(attempt))
    }

    fn effective_jitter(&self) -> JitterPolicy {
        match self.strategy {
            BackoffStrategy::ExponentialJitter => JitterPolicy::Multiplicative,
            _ => self.jitter,
        }
    }
}

impl PatternConfig for RetryConfig {
    fn validate(&self) -> ConfigResult<()> {
        ensure_positive_u32("max_attempts", self.max_attempts)?;
        ensure_non_zero("base_delay", self.base_delay)?;
        if self.max_delay < self.base_delay {
            return Err(ConfigError::validation(
                "max_delay",
                format!(
                    "must be at least base_delay ({:?}), got {:?}",
                    self.base_delay, self.max_delay
                ),
            ));
        }
        ensure_finite("backoff_factor", self.backoff_factor)?;
        if self.backoff_factor < 1.0 {
            return Err(ConfigError::validation(
                "backoff_factor",
                format!("must be at least 1.0, got {}", self.backoff_factor),
            ));
        }
        Ok(())
    }

    fn default_config() -> Self {
        Self::default()
    }
}

/// How a single attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The operation returned a value
    Success,
    /// The operation failed and may be retried
    RetryableFailure,
    /// The operation failed with an error classified as terminal
    TerminalFailure,
    /// The caller's signal fired
    Cancelled,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "succeeded"),
            Self::RetryableFailure => write!(f, "retryable failure"),
            Self::TerminalFailure => write!(f, "terminal failure"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Emitted once per attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEvent {
    /// Attempt number, 1-based
    pub attempt: u32,
    /// How the attempt ended
    pub outcome: AttemptOutcome,
    /// Wait before the next attempt, `None` when no further attempt follows
    pub delay_before_next: Option<Duration>,
}

/// Per-call retry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryStats {
    /// Attempts made, including the first
    pub attempts: u32,
    /// Delays slept between attempts
    pub attempt_delays: Vec<Duration>,
    /// Time from the first attempt to the final outcome
    pub total_duration: Duration,
    /// Whether the final attempt succeeded
    pub succeeded: bool,
}

type RetryPredicate = Arc<dyn Fn(&ConcurrencyError) -> bool + Send + Sync>;

/// Retry executor
#[derive(Clone)]
pub struct RetryEngine {
    config: RetryConfig,
    clock: SharedClock,
    is_retryable: RetryPredicate,
    hooks: ObservabilityHooks,
}

impl fmt::Debug for RetryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RetryEngine {
    /// Create an engine on the system clock
    ///
    /// # Errors
    ///
    /// Returns a validation error for invalid parameters.
    pub fn new(config: RetryConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock::shared())
    }

    /// Create an engine on an explicit clock
    ///
    /// # Errors
    ///
    /// Returns a validation error for invalid parameters.
    pub fn with_clock(config: RetryConfig, clock: SharedClock) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            is_retryable: Arc::new(|_| true),
            hooks: ObservabilityHooks::new(),
        })
    }

    /// Classify errors; `false` marks an error as terminal.
    #[must_use = "builder methods must be chained or built"]
    pub fn with_retry_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&ConcurrencyError) -> bool + Send + Sync + 'static,
    {
        self.is_retryable = Arc::new(predicate);
        self
    }

    /// Attach observability hooks
    #[must_use = "builder methods must be chained or built"]
    pub fn with_hooks(mut self, hooks: ObservabilityHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` with retries.
    ///
    /// # Errors
    ///
    /// - A terminal error from `operation`, returned as-is.
    /// - [`ConcurrencyError::RetryExhausted`] wrapping the last error once
    ///   every attempt failed with a retryable error.
    /// - The cancellation cause when `signal` fires.
    pub async fn run<T, F, Fut>(
        &self,
        signal: &CancellationSignal,
        operation: F,
    ) -> ConcurrencyResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ConcurrencyResult<T>>,
    {
        self.run_with_stats(signal, operation).await.0
    }

    /// Like [`run`](Self::run), also returning per-call statistics.
    #[tracing::instrument(skip_all, fields(pattern = "retry", max_attempts = self.config.max_attempts))]
    pub async fn run_with_stats<T, F, Fut>(
        &self,
        signal: &CancellationSignal,
        mut operation: F,
    ) -> (ConcurrencyResult<T>, RetryStats)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ConcurrencyResult<T>>,
    {
        let started = self.clock.now();
        let mut stats = RetryStats::default();
        let max_attempts = self.config.max_attempts;

        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            if let Some(cause) = signal.err() {
                break Err(cause.into());
            }

            stats.attempts = attempt;
            debug!(attempt, "starting attempt");
            let error = match signal.run(operation()).await {
                Ok(value) => {
                    self.emit(attempt, AttemptOutcome::Success, None);
                    stats.succeeded = true;
                    break Ok(value);
                }
                Err(error) => error,
            };

            if error.is_cancellation() {
                self.emit(attempt, AttemptOutcome::Cancelled, None);
                break Err(error);
            }
            if !(self.is_retryable)(&error) {
                self.emit(attempt, AttemptOutcome::TerminalFailure, None);
                debug!(attempt, %error, "terminal error, not retrying");
                break Err(error);
            }
            if attempt >= max_attempts {
                self.emit(attempt, AttemptOutcome::RetryableFailure, None);
                warn!(attempts = attempt, %error, "retry attempts exhausted");
                break Err(ConcurrencyError::retry_exhausted(attempt, error));
            }

            let delay = self.config.jittered_delay_for(attempt);
            self.emit(attempt, AttemptOutcome::RetryableFailure, Some(delay));
            debug!(attempt, ?delay, %error, "retrying after delay");
            stats.attempt_delays.push(delay);

            if let Err(cancelled) = signal.sleep(self.clock.as_ref(), delay).await {
                break Err(cancelled);
            }
        };

        stats.total_duration = self.clock.now().saturating_duration_since(started);
        (result, stats)
    }

    fn emit(&self, attempt: u32, outcome: AttemptOutcome, delay_before_next: Option<Duration>) {
        self.hooks.emit(PatternEvent::RetryAttempt(RetryEvent {
            attempt,
            outcome,
            delay_before_next,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use rstest::rstest;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[rstest]
    #[case::fixed(BackoffStrategy::Fixed, [100, 100, 100, 100])]
    #[case::linear(BackoffStrategy::Linear, [100, 200, 300, 350])]
    #[case::exponential(BackoffStrategy::Exponential, [100, 200, 350, 350])]
    fn test_delay_formulas(#[case] strategy: BackoffStrategy, #[case] expected: [u64; 4]) {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay: ms(100),
            max_delay: ms(350),
            backoff_factor: 2.0,
            strategy,
            jitter: JitterPolicy::None,
        };
        let delays: Vec<u64> = (1..=4)
            .map(|k| config.delay_for(k).as_millis() as u64)
            .collect();
        assert_eq!(delays, expected);
    }

    #[test]
    fn test_exponential_jitter_within_bounds() {
        let config = RetryConfig::exponential_jitter(10, ms(100), Duration::from_secs(10), 2.0);
        for k in 1..=6 {
            let nominal = config.delay_for(k).as_secs_f64();
            for _ in 0..50 {
                let jittered = config.jittered_delay_for(k).as_secs_f64();
                assert!(jittered >= nominal * JITTER_MIN - 1e-9);
                assert!(jittered <= nominal * JITTER_MAX + 1e-9);
            }
        }
    }

    #[test]
    fn test_huge_exponent_saturates_to_cap() {
        let config = RetryConfig::exponential(u32::MAX, ms(1), Duration::from_secs(60), 10.0);
        assert_eq!(config.delay_for(u32::MAX), Duration::from_secs(60));
    }

    #[rstest]
    #[case::zero_attempts(RetryConfig { max_attempts: 0, ..RetryConfig::default() }, "max_attempts")]
    #[case::zero_base(RetryConfig { base_delay: Duration::ZERO, ..RetryConfig::default() }, "base_delay")]
    #[case::cap_below_base(RetryConfig { max_delay: ms(10), base_delay: ms(20), ..RetryConfig::default() }, "max_delay")]
    #[case::factor_below_one(RetryConfig { backoff_factor: 0.5, ..RetryConfig::default() }, "backoff_factor")]
    fn test_validation(#[case] config: RetryConfig, #[case] field: &str) {
        assert_eq!(config.validate().unwrap_err().field(), field);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_retries() {
        let engine = RetryEngine::new(RetryConfig::fixed(3, ms(10))).unwrap();
        let calls = &AtomicU32::new(0);

        let (result, stats) = engine
            .run_with_stats(&CancellationSignal::never(), || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ConcurrencyError::user_msg("flaky"))
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.attempt_delays, vec![ms(10), ms(10)]);
        assert!(stats.succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_wraps_last_error() {
        let engine = RetryEngine::new(RetryConfig::fixed(2, ms(5))).unwrap();
        let err = engine
            .run(&CancellationSignal::never(), || async {
                Err::<(), _>(ConcurrencyError::user_msg("still down"))
            })
            .await
            .unwrap_err();

        match err {
            ConcurrencyError::RetryExhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(last_error.to_string(), "still down");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_terminal_error_returns_without_delay() {
        let engine = RetryEngine::new(RetryConfig::fixed(5, Duration::from_secs(3600)))
            .unwrap()
            .with_retry_predicate(|e| e.kind() != ErrorKind::User);
        let calls = &AtomicU32::new(0);

        let (result, stats) = engine
            .run_with_stats(&CancellationSignal::never(), || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ConcurrencyError::user_msg("bad request"))
            })
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::User);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(stats.attempt_delays.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_wait_returns_cause() {
        let clock = SystemClock::shared();
        let engine = RetryEngine::with_clock(
            RetryConfig::fixed(10, Duration::from_secs(1)),
            clock.clone(),
        )
        .unwrap();
        let (root, _) = CancellationSignal::root();
        let (signal, _) = CancellationSignal::with_timeout(&root, ms(1500), clock);
        let calls = &AtomicU32::new(0);

        let err = engine
            .run(&signal, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ConcurrencyError::user_msg("nope"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ConcurrencyError::DeadlineExceeded));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
