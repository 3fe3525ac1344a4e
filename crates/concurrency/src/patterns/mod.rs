//! Pattern implementations

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState};
pub use rate_limiter::{
    Admission, RateAlgorithm, RateLimiter, RateLimiterConfig, RateLimiterSnapshot, SharedRateLimiter,
    SlidingWindow, SteadyTick, TokenBucket,
};
pub use retry::{
    AttemptOutcome, BackoffStrategy, JitterPolicy, RetryConfig, RetryEngine, RetryEvent, RetryStats,
};
