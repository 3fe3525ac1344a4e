//! Composed stack demonstration
//!
//! Runs a small worker pool whose handler calls a flaky service through
//! retry, a circuit breaker and a rate limiter. Events are logged via
//! `tracing`; set `RUST_LOG=debug` to see every attempt.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::StreamExt;
use nebula_concurrency::observability::{LogLevel, LoggingHook, MetricsHook, ObservabilityHooks};
use nebula_concurrency::pool::{PoolBuilder, PoolConfig};
use nebula_concurrency::prelude::*;
use tracing_subscriber::EnvFilter;

const JOBS: u32 = 20;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== Composed Stack Demonstration ===\n");

    let metrics = Arc::new(MetricsHook::new());
    let hooks = ObservabilityHooks::new()
        .with_hook(metrics.clone())
        .with_hook(Arc::new(LoggingHook::new(LogLevel::Debug)));

    let breaker = Arc::new(
        CircuitBreaker::new(CircuitBreakerConfig::new(5, 2, Duration::from_millis(500)))?
            .with_hooks(hooks.clone()),
    );
    let limiter = Arc::new(RateLimiter::token_bucket(5, 20.0)?.with_hooks(hooks.clone()));
    let stack = Arc::new(
        ResilienceStack::new()
            .with_retry(
                RetryEngine::new(RetryConfig::exponential_jitter(
                    4,
                    Duration::from_millis(20),
                    Duration::from_millis(200),
                    2.0,
                ))?
                .with_hooks(hooks.clone()),
            )
            .with_circuit_breaker(Arc::clone(&breaker))
            .with_rate_limiter(Arc::clone(&limiter)),
    );

    // every third call to the service fails
    let service_calls = Arc::new(AtomicU32::new(0));

    let pool = PoolBuilder::new(PoolConfig::new(4, 8, 8))
        .with_hooks(hooks)
        .start({
            let stack = Arc::clone(&stack);
            let service_calls = Arc::clone(&service_calls);
            move |ctx, job: u32| {
                let stack = Arc::clone(&stack);
                let service_calls = Arc::clone(&service_calls);
                async move {
                    let service_calls = &service_calls;
                    stack
                        .execute(ctx.signal(), move || async move {
                            let call = service_calls.fetch_add(1, Ordering::Relaxed) + 1;
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            if call % 3 == 0 {
                                Err(ConcurrencyError::user_msg(format!("call {call} failed")))
                            } else {
                                Ok(job * job)
                            }
                        })
                        .await
                }
            }
        })?;

    let Some(results) = pool.take_results() else {
        return Err("results already taken".into());
    };
    let collector = tokio::spawn(results.collect::<Vec<_>>());

    let signal = CancellationSignal::never();
    for job in 0..JOBS {
        pool.submit_blocking(job, &signal).await?;
    }
    let outcome = pool.shutdown(Duration::from_secs(10)).await;
    let results = collector.await?;

    println!("\nShutdown: {outcome:?}");
    println!("Results received: {}", results.len());
    let failed = results.iter().filter(|r| !r.is_ok()).count();
    println!("  ok: {}  failed: {failed}", results.len() - failed);

    let pool_metrics = pool.metrics();
    println!("\nPool metrics:");
    println!("  submitted:    {}", pool_metrics.submitted);
    println!("  completed ok: {}", pool_metrics.completed_ok);
    println!("  failed:       {}", pool_metrics.completed_err);
    println!("  abandoned:    {}", pool_metrics.abandoned);

    let counters = metrics.counters();
    println!("\nHook counters:");
    println!("  service calls:  {}", service_calls.load(Ordering::Relaxed));
    println!("  retry attempts: {}", counters.retry_attempts);
    println!("  circuit opened: {}", counters.circuit_opened);
    println!("  breaker state:  {}", breaker.state());

    Ok(())
}
