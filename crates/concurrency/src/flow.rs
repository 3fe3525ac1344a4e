//! Pipeline building blocks over bounded channels
//!
//! Each function spawns one task on the current Tokio runtime and returns the
//! receiving end of its output channel together with the task handle. The
//! task ends when its input is exhausted (`Ok(())`), when every downstream
//! receiver is gone (`Ok(())`), when the signal fires (the cancellation
//! error) or when a stage function fails (its error). Dropping a task's
//! sender closes the next stage's input, so shutdown propagates downstream.
//!
//! Order is preserved within a stage. Across fan-out branches it is not.
//!
//! ```rust
//! use nebula_concurrency::core::CancellationSignal;
//! use nebula_concurrency::flow;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let signal = CancellationSignal::never();
//! let (numbers, _) = flow::source(1..=3, 4, &signal)?;
//! let (mut doubled, _) = flow::stage(numbers, 4, &signal, |n: u32| async move { Ok(n * 2) })?;
//!
//! let mut out = Vec::new();
//! while let Some(n) = doubled.recv().await {
//!     out.push(n);
//! }
//! assert_eq!(out, vec![2, 4, 6]);
//! # Ok(())
//! # }
//! ```

use std::future::Future;

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::{CancellationSignal, ConcurrencyResult, ConfigResult, ensure_positive_usize};

/// Handle of a spawned flow task
pub type FlowHandle = JoinHandle<ConcurrencyResult<()>>;

enum Sent<T> {
    Delivered,
    Closed(T),
}

async fn send<T>(
    tx: &mpsc::Sender<T>,
    item: T,
    signal: &CancellationSignal,
) -> ConcurrencyResult<Sent<T>> {
    tokio::select! {
        biased;
        cause = signal.cancelled() => Err(cause.into()),
        sent = tx.send(item) => Ok(match sent {
            Ok(()) => Sent::Delivered,
            Err(mpsc::error::SendError(item)) => Sent::Closed(item),
        }),
    }
}

async fn recv<T>(rx: &mut mpsc::Receiver<T>, signal: &CancellationSignal) -> ConcurrencyResult<Option<T>> {
    tokio::select! {
        biased;
        cause = signal.cancelled() => Err(cause.into()),
        item = rx.recv() => Ok(item),
    }
}

/// Feed `items` into a bounded channel.
///
/// # Errors
///
/// Returns a validation error when `capacity` is zero.
pub fn source<I>(
    items: I,
    capacity: usize,
    signal: &CancellationSignal,
) -> ConfigResult<(mpsc::Receiver<I::Item>, FlowHandle)>
where
    I: IntoIterator + Send + 'static,
    I::IntoIter: Send,
    I::Item: Send + 'static,
{
    ensure_positive_usize("capacity", capacity)?;
    let (tx, rx) = mpsc::channel(capacity);
    let handle = tokio::spawn(run_source(items, tx, signal.clone()));
    Ok((rx, handle))
}

async fn run_source<I>(
    items: I,
    tx: mpsc::Sender<I::Item>,
    signal: CancellationSignal,
) -> ConcurrencyResult<()>
where
    I: IntoIterator,
{
    for item in items {
        if let Sent::Closed(_) = send(&tx, item, &signal).await? {
            tracing::trace!("source output closed");
            break;
        }
    }
    Ok(())
}

/// One pipeline stage: map every input item through `f`.
///
/// The stage stops at the first error returned by `f` and reports it through
/// its handle.
///
/// # Errors
///
/// Returns a validation error when `capacity` is zero.
pub fn stage<T, U, F, Fut>(
    input: mpsc::Receiver<T>,
    capacity: usize,
    signal: &CancellationSignal,
    f: F,
) -> ConfigResult<(mpsc::Receiver<U>, FlowHandle)>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = ConcurrencyResult<U>> + Send + 'static,
{
    ensure_positive_usize("capacity", capacity)?;
    let (tx, rx) = mpsc::channel(capacity);
    let handle = tokio::spawn(run_stage(input, tx, signal.clone(), f));
    Ok((rx, handle))
}

async fn run_stage<T, U, F, Fut>(
    mut input: mpsc::Receiver<T>,
    tx: mpsc::Sender<U>,
    signal: CancellationSignal,
    mut f: F,
) -> ConcurrencyResult<()>
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = ConcurrencyResult<U>>,
{
    while let Some(item) = recv(&mut input, &signal).await? {
        let mapped = signal.run(f(item)).await?;
        if let Sent::Closed(_) = send(&tx, mapped, &signal).await? {
            tracing::trace!("stage output closed");
            break;
        }
    }
    Ok(())
}

/// Distribute items round-robin over `branches` outputs.
///
/// A branch whose receiver is dropped is skipped from then on; the task ends
/// once every branch is gone.
///
/// # Errors
///
/// Returns a validation error when `branches` or `capacity` is zero.
pub fn fan_out<T>(
    input: mpsc::Receiver<T>,
    branches: usize,
    capacity: usize,
    signal: &CancellationSignal,
) -> ConfigResult<(Vec<mpsc::Receiver<T>>, FlowHandle)>
where
    T: Send + 'static,
{
    ensure_positive_usize("branches", branches)?;
    ensure_positive_usize("capacity", capacity)?;
    let (senders, receivers): (Vec<_>, Vec<_>) =
        (0..branches).map(|_| mpsc::channel(capacity)).unzip();
    let handle = tokio::spawn(run_fan_out(input, senders, signal.clone()));
    Ok((receivers, handle))
}

async fn run_fan_out<T>(
    mut input: mpsc::Receiver<T>,
    mut senders: Vec<mpsc::Sender<T>>,
    signal: CancellationSignal,
) -> ConcurrencyResult<()> {
    let mut next = 0;
    while let Some(mut item) = recv(&mut input, &signal).await? {
        loop {
            if senders.is_empty() {
                tracing::trace!("every fan-out branch closed");
                return Ok(());
            }
            next %= senders.len();
            match send(&senders[next], item, &signal).await? {
                Sent::Delivered => {
                    next += 1;
                    break;
                }
                Sent::Closed(returned) => {
                    senders.remove(next);
                    item = returned;
                }
            }
        }
    }
    Ok(())
}

/// Merge several receivers into one.
///
/// The output closes once every input has closed.
///
/// # Errors
///
/// Returns a validation error when `capacity` is zero.
pub fn fan_in<T>(
    inputs: Vec<mpsc::Receiver<T>>,
    capacity: usize,
    signal: &CancellationSignal,
) -> ConfigResult<(mpsc::Receiver<T>, FlowHandle)>
where
    T: Send + 'static,
{
    ensure_positive_usize("capacity", capacity)?;
    let (tx, rx) = mpsc::channel(capacity);

    let streams: Vec<BoxStream<'static, T>> = inputs
        .into_iter()
        .map(|input| {
            stream::unfold(input, |mut input| async move {
                input.recv().await.map(|item| (item, input))
            })
            .boxed()
        })
        .collect();

    let handle = tokio::spawn(run_fan_in(streams, tx, signal.clone()));
    Ok((rx, handle))
}

async fn run_fan_in<T>(
    streams: Vec<BoxStream<'static, T>>,
    tx: mpsc::Sender<T>,
    signal: CancellationSignal,
) -> ConcurrencyResult<()> {
    let mut merged = stream::select_all(streams);
    loop {
        let next = tokio::select! {
            biased;
            cause = signal.cancelled() => return Err(cause.into()),
            next = merged.next() => next,
        };
        let Some(item) = next else { break };
        if let Sent::Closed(_) = send(&tx, item, &signal).await? {
            tracing::trace!("fan-in output closed");
            break;
        }
    }
    Ok(())
}
