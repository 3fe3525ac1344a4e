//! Observability hooks for pattern lifecycle events

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::patterns::circuit_breaker::CircuitState;
use crate::patterns::retry::RetryEvent;
use crate::pool::{JobId, PoolPhase};

/// Log level for observability hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level
    Info,
    /// Debug level
    Debug,
    /// Trace level
    Trace,
}

/// Events emitted by the concurrency primitives
#[derive(Debug, Clone)]
pub enum PatternEvent {
    /// One retry attempt finished
    RetryAttempt(RetryEvent),
    /// Circuit breaker changed state
    CircuitStateChanged {
        /// Previous state
        from: CircuitState,
        /// New state
        to: CircuitState,
    },
    /// A non-blocking admission was refused
    RateLimited {
        /// Time until a permit is available, `None` if never
        retry_after: Option<Duration>,
    },
    /// Worker pool lifecycle transition
    PoolPhaseChanged {
        /// Previous phase
        from: PoolPhase,
        /// New phase
        to: PoolPhase,
    },
    /// A job handler panicked inside a worker
    WorkerFault {
        /// Worker that ran the job
        worker_id: usize,
        /// Job that panicked
        job_id: JobId,
        /// Panic message
        message: String,
    },
}

impl PatternEvent {
    /// Short name of the emitting pattern
    #[must_use]
    pub fn pattern(&self) -> &'static str {
        match self {
            Self::RetryAttempt(_) => "retry",
            Self::CircuitStateChanged { .. } => "circuit_breaker",
            Self::RateLimited { .. } => "rate_limiter",
            Self::PoolPhaseChanged { .. } | Self::WorkerFault { .. } => "worker_pool",
        }
    }
}

impl fmt::Display for PatternEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetryAttempt(event) => {
                write!(f, "retry attempt {} {}", event.attempt, event.outcome)?;
                if let Some(delay) = event.delay_before_next {
                    write!(f, ", next in {delay:?}")?;
                }
                Ok(())
            }
            Self::CircuitStateChanged { from, to } => {
                write!(f, "circuit breaker changed from {from} to {to}")
            }
            Self::RateLimited {
                retry_after: Some(after),
            } => write!(f, "rate limited, permit in {after:?}"),
            Self::RateLimited { retry_after: None } => f.write_str("rate limited, no permits left"),
            Self::PoolPhaseChanged { from, to } => {
                write!(f, "worker pool changed from {from} to {to}")
            }
            Self::WorkerFault {
                worker_id,
                job_id,
                message,
            } => write!(f, "worker {worker_id} caught panic in job {job_id}: {message}"),
        }
    }
}

/// Trait for observability hooks
pub trait ObservabilityHook: Send + Sync {
    /// Called when a pattern event occurs
    fn on_event(&self, event: &PatternEvent);
}

/// Collection of observability hooks
#[derive(Default, Clone)]
pub struct ObservabilityHooks {
    hooks: Arc<Vec<Arc<dyn ObservabilityHook>>>,
}

impl ObservabilityHooks {
    /// Create an empty collection
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a hook to the collection
    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn ObservabilityHook>) -> Self {
        Arc::make_mut(&mut self.hooks).push(hook);
        self
    }

    /// Number of registered hooks
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// `true` when no hook is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Emit an event to all hooks
    pub fn emit(&self, event: PatternEvent) {
        for hook in self.hooks.iter() {
            hook.on_event(&event);
        }
    }
}

impl fmt::Debug for ObservabilityHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservabilityHooks")
            .field("len", &self.hooks.len())
            .finish()
    }
}

/// Forwards every event to `tracing` at a fixed level
#[derive(Debug, Clone, Copy)]
pub struct LoggingHook {
    level: LogLevel,
}

impl LoggingHook {
    /// Create a new logging hook
    #[must_use]
    pub fn new(level: LogLevel) -> Self {
        Self { level }
    }
}

impl ObservabilityHook for LoggingHook {
    fn on_event(&self, event: &PatternEvent) {
        let pattern = event.pattern();
        match self.level {
            LogLevel::Error => tracing::error!(pattern, "{event}"),
            LogLevel::Warn => tracing::warn!(pattern, "{event}"),
            LogLevel::Info => tracing::info!(pattern, "{event}"),
            LogLevel::Debug => tracing::debug!(pattern, "{event}"),
            LogLevel::Trace => tracing::trace!(pattern, "{event}"),
        }
    }
}

/// Counters recorded by [`MetricsHook`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookCounters {
    /// Retry attempts observed
    pub retry_attempts: u64,
    /// Breaker transitions into `Open`
    pub circuit_opened: u64,
    /// Breaker transitions into `Closed`
    pub circuit_closed: u64,
    /// Breaker transitions into `HalfOpen`
    pub circuit_half_opened: u64,
    /// Non-blocking limiter rejections
    pub rate_limited: u64,
    /// Pool phase transitions
    pub pool_phase_changes: u64,
    /// Panics captured in workers
    pub worker_faults: u64,
}

/// Counts events by type
#[derive(Debug, Default)]
pub struct MetricsHook {
    retry_attempts: AtomicU64,
    circuit_opened: AtomicU64,
    circuit_closed: AtomicU64,
    circuit_half_opened: AtomicU64,
    rate_limited: AtomicU64,
    pool_phase_changes: AtomicU64,
    worker_faults: AtomicU64,
}

impl MetricsHook {
    /// Create a new metrics hook
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counter values
    #[must_use]
    pub fn counters(&self) -> HookCounters {
        HookCounters {
            retry_attempts: self.retry_attempts.load(Ordering::Relaxed),
            circuit_opened: self.circuit_opened.load(Ordering::Relaxed),
            circuit_closed: self.circuit_closed.load(Ordering::Relaxed),
            circuit_half_opened: self.circuit_half_opened.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            pool_phase_changes: self.pool_phase_changes.load(Ordering::Relaxed),
            worker_faults: self.worker_faults.load(Ordering::Relaxed),
        }
    }
}

impl ObservabilityHook for MetricsHook {
    fn on_event(&self, event: &PatternEvent) {
        let counter = match event {
            PatternEvent::RetryAttempt(_) => &self.retry_attempts,
            PatternEvent::CircuitStateChanged { to, .. } => match to {
                CircuitState::Open => &self.circuit_opened,
                CircuitState::Closed => &self.circuit_closed,
                CircuitState::HalfOpen => &self.circuit_half_opened,
            },
            PatternEvent::RateLimited { .. } => &self.rate_limited,
            PatternEvent::PoolPhaseChanged { .. } => &self.pool_phase_changes,
            PatternEvent::WorkerFault { .. } => &self.worker_faults,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
