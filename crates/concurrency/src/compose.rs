//! Composition of retry, circuit breaker and rate limiter around one operation

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::core::{CancellationSignal, ConcurrencyResult};
use crate::patterns::circuit_breaker::CircuitBreaker;
use crate::patterns::rate_limiter::RateLimiter;
use crate::patterns::retry::RetryEngine;

/// Wraps an operation in any subset of the patterns.
///
/// Layers nest from the outside in: retry, then circuit breaker, then rate
/// limiter, then the operation. Every retry attempt goes through the breaker
/// and takes its own permit. A short-circuited attempt never waits on the
/// limiter, and a call the breaker rejects is seen by the retry engine like
/// any other error.
///
/// The breaker and limiter are shared handles, so several stacks (or other
/// callers) can guard the same dependency.
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
/// use nebula_concurrency::core::CancellationSignal;
/// use nebula_concurrency::patterns::{CircuitBreaker, CircuitBreakerConfig, RetryConfig, RetryEngine};
/// use nebula_concurrency::ResilienceStack;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let stack = ResilienceStack::new()
///     .with_retry(RetryEngine::new(RetryConfig::fixed(3, Duration::from_millis(1)))?)
///     .with_circuit_breaker(Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())?));
///
/// let value = stack
///     .execute(&CancellationSignal::never(), || async { Ok(7) })
///     .await?;
/// assert_eq!(value, 7);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct ResilienceStack {
    retry: Option<RetryEngine>,
    breaker: Option<Arc<CircuitBreaker>>,
    limiter: Option<Arc<RateLimiter>>,
}

impl fmt::Debug for ResilienceStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceStack")
            .field("retry", &self.retry.is_some())
            .field("circuit_breaker", &self.breaker.is_some())
            .field("rate_limiter", &self.limiter.is_some())
            .finish()
    }
}

impl ResilienceStack {
    /// Empty stack; `execute` runs the operation directly
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Retry failed attempts with `engine`
    #[must_use = "builder methods must be chained or built"]
    pub fn with_retry(mut self, engine: RetryEngine) -> Self {
        self.retry = Some(engine);
        self
    }

    /// Guard every attempt with `breaker`
    #[must_use = "builder methods must be chained or built"]
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Take a permit from `limiter` before every attempt
    #[must_use = "builder methods must be chained or built"]
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Configured retry engine
    #[must_use]
    pub fn retry(&self) -> Option<&RetryEngine> {
        self.retry.as_ref()
    }

    /// Configured circuit breaker
    #[must_use]
    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    /// Configured rate limiter
    #[must_use]
    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.limiter.as_ref()
    }

    /// Run `operation` through every configured layer.
    ///
    /// `operation` is called once per attempt. The future it returns is only
    /// polled after the breaker admitted the attempt and the limiter granted
    /// a permit.
    ///
    /// # Errors
    ///
    /// Whatever the outermost configured layer returns: `RetryExhausted`,
    /// `ShortCircuit`, a cancellation cause or the operation's own error.
    pub async fn execute<T, F, Fut>(
        &self,
        signal: &CancellationSignal,
        mut operation: F,
    ) -> ConcurrencyResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ConcurrencyResult<T>>,
    {
        match &self.retry {
            Some(retry) => {
                let operation = &mut operation;
                retry
                    .run(signal, move || self.attempt(signal, operation()))
                    .await
            }
            None => self.attempt(signal, operation()).await,
        }
    }

    async fn attempt<T, Fut>(&self, signal: &CancellationSignal, operation: Fut) -> ConcurrencyResult<T>
    where
        Fut: Future<Output = ConcurrencyResult<T>>,
    {
        match &self.breaker {
            Some(breaker) => breaker.call(signal, || self.admitted(signal, operation)).await,
            None => self.admitted(signal, operation).await,
        }
    }

    async fn admitted<T, Fut>(&self, signal: &CancellationSignal, operation: Fut) -> ConcurrencyResult<T>
    where
        Fut: Future<Output = ConcurrencyResult<T>>,
    {
        if let Some(limiter) = &self.limiter {
            limiter.wait(signal).await?;
        }
        operation.await
    }
}
