//! # Nebula Concurrency
//!
//! Composable building blocks for controlling how work runs concurrently
//! against fragile or limited dependencies.
//!
//! ## Features
//!
//! - **Rate Limiting**: token bucket, sliding window and steady tick behind one front end
//! - **Circuit Breaker**: three-state breaker with a lock-free state read
//! - **Retry**: fixed, linear and exponential backoff with optional jitter
//! - **Worker Pool**: bounded input and output queues, panic capture, graceful shutdown
//! - **Flow**: pipeline stages, fan-out and fan-in over bounded channels
//! - **Cancellation**: hierarchical signals with deadlines on an injectable clock
//!
//! Every blocking operation takes a [`CancellationSignal`], and every
//! time-dependent component accepts a [`SharedClock`], so tests can run on a
//! [`ManualClock`](crate::core::ManualClock) or Tokio's paused time.
//!
//! ## Quick Start
//!
//! ```rust
//! use nebula_concurrency::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let limiter = Arc::new(RateLimiter::token_bucket(10, 100.0)?);
//!     let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())?);
//!     let retry = RetryEngine::new(RetryConfig::exponential(3, Duration::from_millis(10), Duration::from_secs(1), 2.0))?;
//!
//!     let stack = ResilienceStack::new()
//!         .with_retry(retry)
//!         .with_circuit_breaker(breaker)
//!         .with_rate_limiter(limiter);
//!
//!     let (signal, _canceller) = CancellationSignal::root();
//!     let value = stack.execute(&signal, || async { Ok("done") }).await?;
//!     assert_eq!(value, "done");
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core module with fundamental types
pub mod core;

// Pattern implementations
pub mod patterns;

// Worker pool and pipelines
pub mod flow;
pub mod pool;

pub mod observability;

mod compose;

pub use compose::ResilienceStack;

// Public API - core types
pub use crate::core::{
    CancelCause, CancellationSignal, Canceller, Clock, ConcurrencyError, ConcurrencyResult,
    ConfigError, ConfigResult, ErrorKind, PatternConfig, SharedClock, SystemClock,
};

// Public API - patterns
pub use patterns::{
    // Circuit breaker
    CircuitBreaker,
    CircuitBreakerConfig,
    CircuitState,

    // Rate limiting
    RateLimiter,
    RateLimiterConfig,

    // Retry
    BackoffStrategy,
    RetryConfig,
    RetryEngine,
};

pub use pool::{PoolConfig, ShutdownOutcome, WorkerPool};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::core::{
        CancellationSignal, ConcurrencyError, ConcurrencyResult, ManualClock, ResultExt,
        SystemClock,
    };
    pub use crate::patterns::{
        CircuitBreaker, CircuitBreakerConfig, RateLimiter, RetryConfig, RetryEngine,
    };
    pub use crate::pool::{PoolConfig, WorkerPool};
    pub use crate::ResilienceStack;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
