//! Circuit breaker
//!
//! Classic three-state breaker driven by consecutive outcomes:
//!
//! | From     | Event                                | To                         |
//! |----------|--------------------------------------|----------------------------|
//! | Closed   | success                              | Closed, failures reset     |
//! | Closed   | failure number `failure_threshold`   | Open                       |
//! | Open     | call before `recovery_timeout`       | Open, call short-circuited |
//! | Open     | call after `recovery_timeout`        | HalfOpen, call admitted    |
//! | HalfOpen | success number `success_threshold`   | Closed                     |
//! | HalfOpen | failure                              | Open                       |
//!
//! The Open to HalfOpen transition happens when a call arrives, not on a
//! timer, so [`CircuitBreaker::state`] keeps reporting `Open` past the
//! recovery timeout until the next call.
//!
//! Cancellation of the caller's signal is never counted as a failure.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::{
    CancellationSignal, ConcurrencyError, ConcurrencyResult, ConfigResult, PatternConfig,
    SharedClock, SystemClock, constants, ensure_non_zero, ensure_positive_u32,
};
use crate::observability::{ObservabilityHooks, PatternEvent};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow through
    Closed,
    /// Calls are rejected without running
    Open,
    /// Probe calls are admitted to test recovery
    HalfOpen,
}

impl CircuitState {
    const fn to_atomic(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }

    const fn from_atomic(value: u8) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `Closed` that open the breaker
    pub failure_threshold: u32,
    /// Consecutive successes in `HalfOpen` that close the breaker
    pub success_threshold: u32,
    /// Time spent `Open` before a probe is admitted
    #[cfg_attr(feature = "humantime", serde(with = "humantime_serde"))]
    pub recovery_timeout: Duration,
    /// Admit at most one probe at a time while `HalfOpen`
    #[serde(default)]
    pub serialize_probes: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: constants::DEFAULT_FAILURE_THRESHOLD,
            success_threshold: constants::DEFAULT_SUCCESS_THRESHOLD,
            recovery_timeout: constants::DEFAULT_RECOVERY_TIMEOUT,
            serialize_probes: false,
        }
    }
}

impl CircuitBreakerConfig {
    /// Configuration with the given thresholds and timeout
    #[must_use]
    pub fn new(failure_threshold: u32, success_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            recovery_timeout,
            serialize_probes: false,
        }
    }

    /// Admit one probe at a time while half-open
    #[must_use = "builder methods must be chained or built"]
    pub fn with_serialized_probes(mut self, serialize: bool) -> Self {
        self.serialize_probes = serialize;
        self
    }
}

impl PatternConfig for CircuitBreakerConfig {
    fn validate(&self) -> ConfigResult<()> {
        ensure_positive_u32("failure_threshold", self.failure_threshold)?;
        ensure_positive_u32("success_threshold", self.success_threshold)?;
        ensure_non_zero("recovery_timeout", self.recovery_timeout)
    }

    fn default_config() -> Self {
        Self::default()
    }
}

/// Snapshot of breaker state and counters, taken under the breaker lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerMetrics {
    /// Current state
    pub state: CircuitState,
    /// Calls that completed or were short-circuited
    pub total_requests: u64,
    /// Calls counted as successes
    pub total_successes: u64,
    /// Calls counted as failures
    pub total_failures: u64,
    /// Calls rejected without running
    pub total_short_circuits: u64,
    /// Current run of failures in `Closed`
    pub consecutive_failures: u32,
    /// Current run of successes in `HalfOpen`
    pub consecutive_successes: u32,
    /// When the state last changed
    pub last_transition: Instant,
}

type FailurePredicate = Arc<dyn Fn(&ConcurrencyError) -> bool + Send + Sync>;

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    last_transition: Instant,
    probe_in_flight: bool,
    total_requests: u64,
    total_successes: u64,
    total_failures: u64,
    total_short_circuits: u64,
}

type Transition = (CircuitState, CircuitState);

enum Outcome {
    Success,
    Failure,
    Ignored,
}

/// Thread-safe circuit breaker
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    /// Lock-free copy of `inner.state` for the `is_*` queries.
    atomic_state: AtomicU8,
    clock: SharedClock,
    is_failure: FailurePredicate,
    hooks: ObservabilityHooks,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a breaker on the system clock
    ///
    /// # Errors
    ///
    /// Returns a validation error for zero thresholds or a zero timeout.
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock::shared())
    }

    /// Create a breaker on an explicit clock
    ///
    /// # Errors
    ///
    /// Returns a validation error for zero thresholds or a zero timeout.
    pub fn with_clock(config: CircuitBreakerConfig, clock: SharedClock) -> ConfigResult<Self> {
        config.validate()?;
        let now = clock.now();

        Ok(Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                last_transition: now,
                probe_in_flight: false,
                total_requests: 0,
                total_successes: 0,
                total_failures: 0,
                total_short_circuits: 0,
            }),
            atomic_state: AtomicU8::new(CircuitState::Closed.to_atomic()),
            clock,
            is_failure: Arc::new(|_| true),
            hooks: ObservabilityHooks::new(),
        })
    }

    /// Decide which errors count as failures.
    ///
    /// Errors for which `predicate` returns `false` are recorded as
    /// successes. Cancellation errors are never passed to the predicate.
    #[must_use = "builder methods must be chained or built"]
    pub fn with_failure_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&ConcurrencyError) -> bool + Send + Sync + 'static,
    {
        self.is_failure = Arc::new(predicate);
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
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` through the breaker.
    ///
    /// # Errors
    ///
    /// - [`ConcurrencyError::ShortCircuit`] when the breaker rejects the call;
    ///   `operation` is not invoked.
    /// - The cancellation cause when `signal` fires first.
    /// - Otherwise whatever `operation` returned.
    #[tracing::instrument(skip_all, fields(pattern = "circuit_breaker", state = %self.state()))]
    pub async fn call<T, F, Fut>(
        &self,
        signal: &CancellationSignal,
        operation: F,
    ) -> ConcurrencyResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ConcurrencyResult<T>>,
    {
        if let Some(cause) = signal.err() {
            return Err(cause.into());
        }

        let probe = self.admit()?;
        let _probe_guard = ProbeGuard {
            breaker: self,
            active: probe,
        };

        let result = signal.run(operation()).await;

        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(e) if e.is_cancellation() => Outcome::Ignored,
            Err(e) if (self.is_failure)(e) => Outcome::Failure,
            Err(_) => Outcome::Success,
        };
        self.record(outcome);

        result
    }

    /// Admission check. Returns whether the admitted call is a probe.
    fn admit(&self) -> ConcurrencyResult<bool> {
        let now = self.clock.now();
        let (admitted, transition) = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => (Ok(false), None),
                CircuitState::Open => {
                    let elapsed = inner
                        .opened_at
                        .map_or(Duration::MAX, |at| now.saturating_duration_since(at));
                    if elapsed >= self.config.recovery_timeout {
                        let transition = self.set_state(&mut inner, CircuitState::HalfOpen, now);
                        inner.probe_in_flight = self.config.serialize_probes;
                        (Ok(self.config.serialize_probes), transition)
                    } else {
                        let retry_after = self.config.recovery_timeout - elapsed;
                        inner.total_short_circuits += 1;
                        inner.total_requests += 1;
                        (Err(ConcurrencyError::short_circuit(Some(retry_after))), None)
                    }
                }
                CircuitState::HalfOpen => {
                    if !self.config.serialize_probes {
                        (Ok(false), None)
                    } else if inner.probe_in_flight {
                        inner.total_short_circuits += 1;
                        inner.total_requests += 1;
                        (Err(ConcurrencyError::short_circuit(None)), None)
                    } else {
                        inner.probe_in_flight = true;
                        (Ok(true), None)
                    }
                }
            }
        };

        self.announce(transition);
        if let Err(e) = &admitted {
            debug!(retry_after = ?e.retry_after(), "call short-circuited");
        }
        admitted
    }

    fn record(&self, outcome: Outcome) {
        let now = self.clock.now();
        let transition = {
            let mut inner = self.inner.lock();
            match outcome {
                Outcome::Ignored => None,
                Outcome::Success => {
                    inner.total_requests += 1;
                    inner.total_successes += 1;
                    match inner.state {
                        CircuitState::Closed => {
                            inner.consecutive_failures = 0;
                            None
                        }
                        CircuitState::HalfOpen => {
                            inner.consecutive_successes += 1;
                            if inner.consecutive_successes >= self.config.success_threshold {
                                self.set_state(&mut inner, CircuitState::Closed, now)
                            } else {
                                None
                            }
                        }
                        CircuitState::Open => None,
                    }
                }
                Outcome::Failure => {
                    inner.total_requests += 1;
                    inner.total_failures += 1;
                    match inner.state {
                        CircuitState::Closed => {
                            inner.consecutive_failures += 1;
                            if inner.consecutive_failures >= self.config.failure_threshold {
                                self.set_state(&mut inner, CircuitState::Open, now)
                            } else {
                                None
                            }
                        }
                        CircuitState::HalfOpen => {
                            self.set_state(&mut inner, CircuitState::Open, now)
                        }
                        CircuitState::Open => None,
                    }
                }
            }
        };
        self.announce(transition);
    }

    fn set_state(
        &self,
        inner: &mut BreakerInner,
        to: CircuitState,
        now: Instant,
    ) -> Option<Transition> {
        let from = inner.state;
        if from == to {
            return None;
        }
        inner.state = to;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.probe_in_flight = false;
        inner.last_transition = now;
        inner.opened_at = (to == CircuitState::Open).then_some(now);
        self.atomic_state.store(to.to_atomic(), Ordering::Release);
        Some((from, to))
    }

    fn announce(&self, transition: Option<Transition>) {
        let Some((from, to)) = transition else {
            return;
        };
        match to {
            CircuitState::Open => warn!(%from, %to, "circuit breaker opened"),
            CircuitState::HalfOpen => info!(%from, %to, "circuit breaker probing"),
            CircuitState::Closed => info!(%from, %to, "circuit breaker closed"),
        }
        self.hooks.emit(PatternEvent::CircuitStateChanged { from, to });
    }

    /// Recorded state, without lazy Open to HalfOpen evaluation.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from_atomic(self.atomic_state.load(Ordering::Acquire))
    }

    /// Check if the breaker is closed (lock-free)
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Check if the breaker is open (lock-free)
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Check if the breaker is half-open (lock-free)
    #[must_use]
    pub fn is_half_open(&self) -> bool {
        self.state() == CircuitState::HalfOpen
    }

    /// Consistent snapshot of state and counters
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            state: inner.state,
            total_requests: inner.total_requests,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_short_circuits: inner.total_short_circuits,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            last_transition: inner.last_transition,
        }
    }

    /// Force the breaker back to `Closed`. Totals are kept.
    pub fn reset(&self) {
        let now = self.clock.now();
        let transition = {
            let mut inner = self.inner.lock();
            inner.consecutive_failures = 0;
            inner.consecutive_successes = 0;
            inner.probe_in_flight = false;
            self.set_state(&mut inner, CircuitState::Closed, now)
        };
        info!("circuit breaker reset");
        self.announce(transition);
    }
}

/// Frees the half-open probe slot on every exit path, including drop of the
/// `call` future.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    active: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            let mut inner = self.breaker.inner.lock();
            if inner.state == CircuitState::HalfOpen {
                inner.probe_in_flight = false;
            }
        }
    }
}
