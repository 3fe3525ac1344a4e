//! Jobs and the worker loop

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::metrics::PoolCounters;
use crate::core::{CancellationSignal, ConcurrencyError, ConcurrencyResult, SharedClock};
use crate::observability::{ObservabilityHooks, PatternEvent};

/// Identifier assigned to a job at submission, unique within one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(u64);

impl JobId {
    /// Raw numeric value
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }

    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Passed to the handler alongside each payload.
#[derive(Debug, Clone)]
pub struct JobContext {
    worker_id: usize,
    job_id: JobId,
    signal: CancellationSignal,
}

impl JobContext {
    /// Index of the worker running the job, in `0..worker_count`
    #[must_use]
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Id returned by `submit`
    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Fires when the pool is force-stopped.
    ///
    /// Handlers doing long work should select on it; the pool drops the
    /// handler future at its next await point either way.
    #[must_use]
    pub fn signal(&self) -> &CancellationSignal {
        &self.signal
    }
}

/// Outcome of one job, delivered on the results stream
#[derive(Debug)]
pub struct JobResult<R> {
    /// Job this result belongs to
    pub job_id: JobId,
    /// Worker that ran it
    pub worker_id: usize,
    /// Time spent in the handler
    pub duration: Duration,
    /// Handler output; a captured panic shows up as `UserFault`
    pub output: ConcurrencyResult<R>,
}

impl<R> JobResult<R> {
    /// `true` when the handler returned `Ok`
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.output.is_ok()
    }

    /// Discard the bookkeeping and keep the output
    pub fn into_output(self) -> ConcurrencyResult<R> {
        self.output
    }
}

pub(crate) type Handler<P, R> =
    Arc<dyn Fn(JobContext, P) -> BoxFuture<'static, ConcurrencyResult<R>> + Send + Sync>;

pub(crate) fn boxed_handler<P, R, F, Fut>(handler: F) -> Handler<P, R>
where
    F: Fn(JobContext, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ConcurrencyResult<R>> + Send + 'static,
{
    Arc::new(move |ctx, payload| handler(ctx, payload).boxed())
}

pub(crate) struct Job<P> {
    pub(crate) id: JobId,
    pub(crate) payload: P,
}

pub(crate) struct Worker<P, R> {
    pub(crate) id: usize,
    pub(crate) input: async_channel::Receiver<Job<P>>,
    pub(crate) output: mpsc::Sender<JobResult<R>>,
    pub(crate) handler: Handler<P, R>,
    pub(crate) counters: Arc<Mutex<PoolCounters>>,
    pub(crate) stop: CancellationSignal,
    pub(crate) clock: SharedClock,
    pub(crate) hooks: ObservabilityHooks,
}

impl<P, R> Worker<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// Runs until the input queue is closed and empty, or the pool is force-stopped.
    pub(crate) async fn run(self) {
        tracing::trace!(worker_id = self.id, "worker started");

        loop {
            let job = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                job = self.input.recv() => match job {
                    Ok(job) => job,
                    Err(_) => break,
                },
            };

            self.counters.lock().in_flight += 1;
            if !self.process(job).await {
                break;
            }
        }

        tracing::trace!(worker_id = self.id, "worker exited");
    }

    /// Returns `false` when the job was abandoned by a forced stop.
    async fn process(&self, job: Job<P>) -> bool {
        let job_id = job.id;
        let ctx = JobContext {
            worker_id: self.id,
            job_id,
            signal: self.stop.clone(),
        };
        let started = self.clock.now();

        let handler = &self.handler;
        let output = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(ctx, job.payload))) {
            Err(panic) => Err(self.fault(job_id, panic.as_ref())),
            Ok(future) => {
                let outcome = tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => None,
                    outcome = AssertUnwindSafe(future).catch_unwind() => Some(outcome),
                };
                match outcome {
                    None => {
                        self.abandon(job_id);
                        return false;
                    }
                    Some(Ok(output)) => output,
                    Some(Err(panic)) => Err(self.fault(job_id, panic.as_ref())),
                }
            }
        };

        let ok = output.is_ok();
        let result = JobResult {
            job_id,
            worker_id: self.id,
            duration: self.clock.now().saturating_duration_since(started),
            output,
        };

        let delivered = tokio::select! {
            biased;
            _ = self.stop.cancelled() => None,
            sent = self.output.send(result) => Some(sent.is_ok()),
        };
        match delivered {
            None => {
                self.abandon(job_id);
                false
            }
            Some(sent) => {
                if !sent {
                    tracing::debug!(worker_id = self.id, %job_id, "results receiver dropped");
                }
                self.counters.lock().finish(ok);
                true
            }
        }
    }

    fn abandon(&self, job_id: JobId) {
        tracing::debug!(worker_id = self.id, %job_id, "job abandoned by forced stop");
        self.counters.lock().abandon_in_flight();
    }

    fn fault(&self, job_id: JobId, panic: &(dyn Any + Send)) -> ConcurrencyError {
        let message = panic_message(panic);
        tracing::error!(worker_id = self.id, %job_id, %message, "job handler panicked");
        self.hooks.emit(PatternEvent::WorkerFault {
            worker_id: self.id,
            job_id,
            message: message.clone(),
        });
        ConcurrencyError::UserFault { message }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
