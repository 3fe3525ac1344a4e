//! Bounded worker pool
//!
//! A fixed set of workers pulls jobs from a bounded input queue, runs a shared
//! async handler on each payload and pushes a [`JobResult`] onto a bounded
//! output queue. Both queues apply backpressure: `submit` fails fast with
//! `QueueFull`, `submit_blocking` waits, and workers stop pulling new jobs
//! while nobody consumes results.
//!
//! A panic inside the handler is captured and reported as a `UserFault`
//! result; the worker keeps running.
//!
//! # Shutdown
//!
//! [`WorkerPool::shutdown`] stops intake, lets the workers drain the queue and
//! waits up to a timeout. When the timeout elapses the pool is force-stopped:
//! running handlers are dropped at their next await point and queued jobs are
//! discarded, both counted as `abandoned`.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use nebula_concurrency::pool::{PoolConfig, WorkerPool};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = WorkerPool::start(PoolConfig::new(4, 16, 16), |_ctx, n: u64| async move {
//!     Ok(n * 2)
//! })?;
//! let mut results = pool.take_results().expect("first take");
//!
//! pool.submit(21)?;
//! let result = results.recv().await.expect("one result");
//! assert_eq!(result.output?, 42);
//!
//! pool.shutdown(Duration::from_secs(5)).await;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::{
    CancellationSignal, Canceller, ConcurrencyError, ConcurrencyResult, ConfigResult, PatternConfig,
    SharedClock, SystemClock, ensure_positive_usize,
};
use crate::observability::{ObservabilityHooks, PatternEvent};

mod metrics;
mod worker;

pub use metrics::{PoolMetrics, PoolPhase};
pub use worker::{JobContext, JobId, JobResult};

use metrics::PoolCounters;
use worker::{Handler, Job, Worker, boxed_handler};

/// Worker pool sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of workers, at least 1
    pub worker_count: usize,
    /// Input queue capacity, at least 1
    pub input_queue_capacity: usize,
    /// Output queue capacity, at least 1
    pub output_queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            input_queue_capacity: 64,
            output_queue_capacity: 64,
        }
    }
}

impl PoolConfig {
    /// Create a pool configuration
    #[must_use]
    pub fn new(worker_count: usize, input_queue_capacity: usize, output_queue_capacity: usize) -> Self {
        Self {
            worker_count,
            input_queue_capacity,
            output_queue_capacity,
        }
    }
}

impl PatternConfig for PoolConfig {
    fn validate(&self) -> ConfigResult<()> {
        ensure_positive_usize("worker_count", self.worker_count)?;
        ensure_positive_usize("input_queue_capacity", self.input_queue_capacity)?;
        ensure_positive_usize("output_queue_capacity", self.output_queue_capacity)
    }

    fn default_config() -> Self {
        Self::default()
    }
}

/// How a shutdown ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every queued job was processed before the timeout
    Clean,
    /// The timeout elapsed and the pool was force-stopped
    TimedOut,
}

impl ShutdownOutcome {
    /// `true` for [`ShutdownOutcome::TimedOut`]
    #[must_use]
    pub fn timed_out(self) -> bool {
        matches!(self, Self::TimedOut)
    }
}

/// Builder for a [`WorkerPool`] with a custom clock or hooks
#[derive(Debug)]
#[must_use = "builder does nothing until `start` is called"]
pub struct PoolBuilder {
    config: PoolConfig,
    clock: SharedClock,
    hooks: ObservabilityHooks,
}

impl PoolBuilder {
    /// Start configuring a pool
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            clock: SystemClock::shared(),
            hooks: ObservabilityHooks::default(),
        }
    }

    /// Measure durations and shutdown timeouts on `clock`
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Attach observability hooks
    pub fn with_hooks(mut self, hooks: ObservabilityHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Spawn the workers on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a zero worker count or queue capacity.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn start<P, R, F, Fut>(self, handler: F) -> ConfigResult<WorkerPool<P, R>>
    where
        P: Send + 'static,
        R: Send + 'static,
        F: Fn(JobContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ConcurrencyResult<R>> + Send + 'static,
    {
        WorkerPool::spawn(self, boxed_handler(handler))
    }
}

struct ShutdownState {
    workers: Vec<JoinHandle<()>>,
    outcome: Option<ShutdownOutcome>,
}

/// Fixed-size pool of async workers. See the [module docs](self).
pub struct WorkerPool<P, R> {
    config: PoolConfig,
    input: async_channel::Sender<Job<P>>,
    leftovers: async_channel::Receiver<Job<P>>,
    results: Mutex<Option<mpsc::Receiver<JobResult<R>>>>,
    // keeps `Results` open until the phase reads `Stopped`
    output: Mutex<Option<mpsc::Sender<JobResult<R>>>>,
    counters: Arc<Mutex<PoolCounters>>,
    stop: Canceller,
    shutdown: tokio::sync::Mutex<ShutdownState>,
    clock: SharedClock,
    hooks: ObservabilityHooks,
}

impl<P, R> fmt::Debug for WorkerPool<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("phase", &self.counters.lock().phase)
            .finish_non_exhaustive()
    }
}

impl<P, R> WorkerPool<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// Start a pool on the system clock.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a zero worker count or queue capacity.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn start<F, Fut>(config: PoolConfig, handler: F) -> ConfigResult<Self>
    where
        F: Fn(JobContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ConcurrencyResult<R>> + Send + 'static,
    {
        PoolBuilder::new(config).start(handler)
    }

    fn spawn(builder: PoolBuilder, handler: Handler<P, R>) -> ConfigResult<Self> {
        let PoolBuilder {
            config,
            clock,
            hooks,
        } = builder;
        config.validate()?;

        let (input, queue) = async_channel::bounded(config.input_queue_capacity);
        let (output, results) = mpsc::channel(config.output_queue_capacity);
        let counters = Arc::new(Mutex::new(PoolCounters::new()));
        let (stop_signal, stop) = CancellationSignal::root();

        let workers = (0..config.worker_count)
            .map(|id| {
                let worker = Worker {
                    id,
                    input: queue.clone(),
                    output: output.clone(),
                    handler: Arc::clone(&handler),
                    counters: Arc::clone(&counters),
                    stop: stop_signal.clone(),
                    clock: Arc::clone(&clock),
                    hooks: hooks.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        tracing::debug!(
            workers = config.worker_count,
            input_capacity = config.input_queue_capacity,
            output_capacity = config.output_queue_capacity,
            "worker pool started"
        );

        Ok(Self {
            config,
            input,
            leftovers: queue,
            results: Mutex::new(Some(results)),
            output: Mutex::new(Some(output)),
            counters,
            stop,
            shutdown: tokio::sync::Mutex::new(ShutdownState {
                workers,
                outcome: None,
            }),
            clock,
            hooks,
        })
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Enqueue a job without waiting.
    ///
    /// # Errors
    ///
    /// - [`ConcurrencyError::QueueFull`] when the input queue is at capacity
    /// - [`ConcurrencyError::ShuttingDown`] once shutdown has started
    pub fn submit(&self, payload: P) -> ConcurrencyResult<JobId> {
        let mut counters = self.counters.lock();
        if counters.phase != PoolPhase::Running {
            return Err(ConcurrencyError::ShuttingDown);
        }

        let id = JobId::new(counters.next_job_id);
        match self.input.try_send(Job { id, payload }) {
            Ok(()) => {
                counters.next_job_id += 1;
                counters.submitted += 1;
                Ok(id)
            }
            Err(async_channel::TrySendError::Full(_)) => Err(ConcurrencyError::QueueFull {
                capacity: self.config.input_queue_capacity,
            }),
            Err(async_channel::TrySendError::Closed(_)) => Err(ConcurrencyError::ShuttingDown),
        }
    }

    /// Enqueue a job, waiting for queue space.
    ///
    /// # Errors
    ///
    /// - the cancellation cause when `signal` fires before the job is queued
    /// - [`ConcurrencyError::ShuttingDown`] once shutdown has started
    pub async fn submit_blocking(
        &self,
        payload: P,
        signal: &CancellationSignal,
    ) -> ConcurrencyResult<JobId> {
        if let Some(cause) = signal.err() {
            return Err(cause.into());
        }

        let id = {
            let mut counters = self.counters.lock();
            if counters.phase != PoolPhase::Running {
                return Err(ConcurrencyError::ShuttingDown);
            }
            let id = JobId::new(counters.next_job_id);
            counters.next_job_id += 1;
            counters.submitted += 1;
            id
        };

        let sent = tokio::select! {
            biased;
            cause = signal.cancelled() => Err(cause.into()),
            sent = self.input.send(Job { id, payload }) => {
                sent.map_err(|_| ConcurrencyError::ShuttingDown)
            }
        };
        if sent.is_err() {
            self.counters.lock().submitted -= 1;
        }
        sent.map(|()| id)
    }

    /// Take the results stream. Returns `None` after the first call.
    ///
    /// The stream ends once the pool has stopped and every buffered result
    /// has been received.
    pub fn take_results(&self) -> Option<Results<R>> {
        self.results.lock().take().map(|inner| Results { inner })
    }

    /// Consistent snapshot of the pool counters
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let counters = self.counters.lock();
        counters.snapshot(self.leftovers.len())
    }

    /// Current lifecycle phase
    #[must_use]
    pub fn phase(&self) -> PoolPhase {
        self.counters.lock().phase
    }

    /// Stop intake, drain the queue and wait for the workers.
    ///
    /// Waits up to `timeout` on the pool clock; `Duration::MAX` waits without
    /// limit. On timeout the pool is force-stopped. Either way the pool is
    /// [`PoolPhase::Stopped`] when this returns.
    ///
    /// Calling it again, or concurrently, returns the first outcome.
    #[tracing::instrument(skip_all, fields(pattern = "worker_pool", ?timeout))]
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownOutcome {
        let mut state = self.shutdown.lock().await;
        if let Some(outcome) = state.outcome {
            return outcome;
        }

        let draining = {
            let mut counters = self.counters.lock();
            let transition = counters.advance(PoolPhase::Draining);
            self.input.close();
            transition
        };
        if let Some((from, to)) = draining {
            tracing::info!("worker pool draining");
            self.hooks.emit(PatternEvent::PoolPhaseChanged { from, to });
        }

        let drained = if timeout == Duration::MAX {
            join_workers(&mut state.workers).await;
            true
        } else {
            tokio::select! {
                biased;
                () = join_workers(&mut state.workers) => true,
                () = self.clock.sleep(timeout) => false,
            }
        };

        let outcome = if drained {
            ShutdownOutcome::Clean
        } else {
            let in_flight = {
                let mut counters = self.counters.lock();
                counters.in_flight_at_force_stop = Some(counters.in_flight);
                counters.in_flight
            };
            tracing::warn!(in_flight, "shutdown timed out, force-stopping workers");
            self.stop.cancel();
            join_workers(&mut state.workers).await;
            ShutdownOutcome::TimedOut
        };

        let mut discarded = 0_u64;
        while self.leftovers.try_recv().is_ok() {
            discarded += 1;
        }

        let stopped = {
            let mut counters = self.counters.lock();
            counters.abandoned += discarded;
            counters.advance(PoolPhase::Stopped)
        };
        self.output.lock().take();
        tracing::info!(?outcome, discarded, "worker pool stopped");
        if let Some((from, to)) = stopped {
            self.hooks.emit(PatternEvent::PoolPhaseChanged { from, to });
        }

        state.outcome = Some(outcome);
        outcome
    }
}

impl<P, R> Drop for WorkerPool<P, R> {
    fn drop(&mut self) {
        if self.counters.lock().phase != PoolPhase::Stopped {
            tracing::debug!("worker pool dropped without shutdown, force-stopping");
            self.input.close();
            self.stop.cancel();
        }
    }
}

/// Joins workers one at a time so a dropped caller leaves the rest joinable.
async fn join_workers(workers: &mut Vec<JoinHandle<()>>) {
    while let Some(handle) = workers.last_mut() {
        if let Err(error) = handle.await {
            tracing::error!(%error, "worker task failed");
        }
        workers.pop();
    }
}

/// Stream of job results, in completion order.
///
/// The stream ends only after the pool reports [`PoolPhase::Stopped`], so a
/// consumer that sees the end can rely on the final metrics.
#[derive(Debug)]
pub struct Results<R> {
    inner: mpsc::Receiver<JobResult<R>>,
}

impl<R> Results<R> {
    /// Next result, or `None` once the pool has stopped and the buffer is empty
    pub async fn recv(&mut self) -> Option<JobResult<R>> {
        self.inner.recv().await
    }

    /// Non-blocking receive
    pub fn try_recv(&mut self) -> Option<JobResult<R>> {
        self.inner.try_recv().ok()
    }
}

impl<R> Stream for Results<R> {
    type Item = JobResult<R>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_recv(cx)
    }
}
