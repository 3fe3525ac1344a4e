//! Scoped cancellation with parent/child propagation and deadlines
//!
//! A [`CancellationSignal`] is the read side: blocking operations await it or
//! poll it at their checkpoints. A [`Canceller`] is the write side returned
//! alongside every signal that can be cancelled explicitly.
//!
//! Signals form a tree. Cancelling a parent cancels every descendant;
//! cancelling a child never affects its parent. Each signal transitions at
//! most once and remembers why: an explicit cancel or an elapsed deadline.
//!
//! Built on `tokio_util::sync::CancellationToken`, which is exposed through
//! [`CancellationSignal::token`] for interop with code that already speaks
//! tokens.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use super::clock::{Clock, SharedClock};
use super::result::ConcurrencyResult;

/// Why a signal fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelCause {
    /// Explicit cancel via a [`Canceller`] (own or inherited).
    Cancelled,
    /// A deadline on this signal or one of its ancestors elapsed.
    DeadlineExceeded,
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("cancelled"),
            Self::DeadlineExceeded => f.write_str("deadline exceeded"),
        }
    }
}

/// Read side of a cancellation scope. Cheap to clone.
#[derive(Clone)]
pub struct CancellationSignal {
    inner: Arc<SignalInner>,
}

struct SignalInner {
    token: CancellationToken,
    cause: Arc<OnceLock<CancelCause>>,
    parent: Option<CancellationSignal>,
    deadline: Option<Deadline>,
    timer: Option<AbortHandle>,
}

struct Deadline {
    at: Instant,
    clock: SharedClock,
}

impl Drop for SignalInner {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl SignalInner {
    fn expire_if_due(&self) {
        if let Some(deadline) = &self.deadline
            && !self.token.is_cancelled()
            && deadline.clock.now() >= deadline.at
        {
            fire(&self.token, &self.cause, CancelCause::DeadlineExceeded);
        }
    }
}

fn fire(token: &CancellationToken, cause: &OnceLock<CancelCause>, reason: CancelCause) {
    if token.is_cancelled() {
        return;
    }
    let _ = cause.set(reason);
    token.cancel();
}

/// Write side of a cancellation scope.
///
/// Dropping a `Canceller` does not cancel the signal.
#[derive(Clone)]
pub struct Canceller {
    token: CancellationToken,
    cause: Arc<OnceLock<CancelCause>>,
}

impl Canceller {
    /// Cancel the paired signal and all of its descendants. Idempotent.
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            tracing::debug!("cancellation requested");
        }
        fire(&self.token, &self.cause, CancelCause::Cancelled);
    }

    /// `true` once the paired signal has fired for any reason.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl fmt::Debug for Canceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Canceller")
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

impl CancellationSignal {
    fn build(
        parent: Option<&Self>,
        deadline: Option<Deadline>,
    ) -> (Self, Canceller) {
        let token = match parent {
            Some(parent) => parent.inner.token.child_token(),
            None => CancellationToken::new(),
        };
        let cause = Arc::new(OnceLock::new());

        let mut timer = None;
        if let Some(deadline) = &deadline {
            if deadline.clock.now() >= deadline.at {
                fire(&token, &cause, CancelCause::DeadlineExceeded);
            } else if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let token = token.clone();
                let cause = Arc::clone(&cause);
                let sleep = deadline.clock.sleep_until(deadline.at);
                let handle = runtime.spawn(async move {
                    tokio::select! {
                        () = token.cancelled() => {}
                        () = sleep => {
                            tracing::debug!("cancellation deadline elapsed");
                            fire(&token, &cause, CancelCause::DeadlineExceeded);
                        }
                    }
                });
                timer = Some(handle.abort_handle());
            }
        }

        let canceller = Canceller {
            token: token.clone(),
            cause: Arc::clone(&cause),
        };
        let signal = Self {
            inner: Arc::new(SignalInner {
                token,
                cause,
                parent: parent.cloned(),
                deadline,
                timer,
            }),
        };
        (signal, canceller)
    }

    /// New root scope with no parent and no deadline.
    #[must_use]
    pub fn root() -> (Self, Canceller) {
        Self::build(None, None)
    }

    /// A root signal that is never cancelled.
    #[must_use]
    pub fn never() -> Self {
        Self::root().0
    }

    /// Child scope that can be cancelled independently of `parent`.
    #[must_use]
    pub fn with_cancel(parent: &Self) -> (Self, Canceller) {
        Self::build(Some(parent), None)
    }

    /// Child scope that additionally fires `timeout` after now on `clock`.
    ///
    /// The deadline timer runs as a task on the current Tokio runtime and is
    /// aborted once the signal fires or every clone of it is dropped. Outside
    /// a runtime the deadline is still honoured by [`is_cancelled`],
    /// [`err`] and [`cancelled`] on this signal and its descendants, which
    /// check the clock directly.
    ///
    /// [`is_cancelled`]: Self::is_cancelled
    /// [`err`]: Self::err
    /// [`cancelled`]: Self::cancelled
    #[must_use]
    pub fn with_timeout(parent: &Self, timeout: Duration, clock: SharedClock) -> (Self, Canceller) {
        let now = clock.now();
        match now.checked_add(timeout) {
            Some(at) => Self::with_deadline(parent, at, clock),
            None => Self::with_cancel(parent),
        }
    }

    /// Child scope that additionally fires at `deadline` on `clock`.
    #[must_use]
    pub fn with_deadline(parent: &Self, deadline: Instant, clock: SharedClock) -> (Self, Canceller) {
        Self::build(
            Some(parent),
            Some(Deadline {
                at: deadline,
                clock,
            }),
        )
    }

    /// `true` once this signal or any ancestor has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.err().is_some()
    }

    /// Final cause, or `None` while the signal is still active.
    #[must_use]
    pub fn err(&self) -> Option<CancelCause> {
        self.inner.expire_if_due();
        let inherited = self.inner.parent.as_ref().and_then(Self::err);

        if !self.inner.token.is_cancelled() {
            return None;
        }
        self.inner
            .cause
            .get()
            .copied()
            .or(inherited)
            .or(Some(CancelCause::Cancelled))
    }

    /// Wait until the signal fires and return its cause.
    ///
    /// Wakes at the earliest deadline in the ancestor chain even when no
    /// timer task was spawned for it.
    pub async fn cancelled(&self) -> CancelCause {
        loop {
            if let Some(cause) = self.err() {
                return cause;
            }
            match self.earliest_deadline() {
                Some((at, clock)) => {
                    tokio::select! {
                        () = self.inner.token.cancelled() => {}
                        () = clock.sleep_until(at) => {}
                    }
                }
                None => self.inner.token.cancelled().await,
            }
        }
    }

    fn earliest_deadline(&self) -> Option<(Instant, SharedClock)> {
        let own = self
            .inner
            .deadline
            .as_ref()
            .map(|d| (d.at, Arc::clone(&d.clock)));
        let inherited = self.inner.parent.as_ref().and_then(Self::earliest_deadline);
        match (own, inherited) {
            (Some(a), Some(b)) => Some(if b.0 < a.0 { b } else { a }),
            (a, b) => a.or(b),
        }
    }

    /// Earliest deadline on this signal or any ancestor.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        let own = self.inner.deadline.as_ref().map(|d| d.at);
        let inherited = self.inner.parent.as_ref().and_then(Self::deadline);
        match (own, inherited) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Underlying token. Cancelling it directly is reported as
    /// [`CancelCause::Cancelled`].
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    /// Race `future` against this signal.
    ///
    /// An already fired signal returns its cause without polling `future`.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `future`, or the cancellation cause when
    /// the signal fires first.
    pub async fn run<F, T>(&self, future: F) -> ConcurrencyResult<T>
    where
        F: Future<Output = ConcurrencyResult<T>>,
    {
        if let Some(cause) = self.err() {
            return Err(cause.into());
        }
        tokio::select! {
            biased;
            cause = self.cancelled() => Err(cause.into()),
            result = future => result,
        }
    }

    /// Sleep for `duration` on `clock`, waking early if the signal fires.
    ///
    /// # Errors
    ///
    /// Returns the cancellation cause when the signal fires before the sleep
    /// completes.
    pub async fn sleep(&self, clock: &dyn Clock, duration: Duration) -> ConcurrencyResult<()> {
        let sleep = clock.sleep(duration);
        self.run(async move {
            sleep.await;
            Ok(())
        })
        .await
    }
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::never()
    }
}

impl fmt::Debug for CancellationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationSignal")
            .field("cause", &self.err())
            .field("deadline", &self.deadline())
            .field("has_parent", &self.inner.parent.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::{ManualClock, SystemClock};
    use crate::core::error::ConcurrencyError;

    #[test]
    fn test_root_cancel_is_idempotent() {
        let (signal, cancel) = CancellationSignal::root();
        assert_eq!(signal.err(), None);

        cancel.cancel();
        cancel.cancel();
        assert!(signal.is_cancelled());
        assert_eq!(signal.err(), Some(CancelCause::Cancelled));
    }

    #[test]
    fn test_parent_cancel_propagates_to_children() {
        let (root, cancel_root) = CancellationSignal::root();
        let (child, _cancel_child) = CancellationSignal::with_cancel(&root);
        let (grandchild, _) = CancellationSignal::with_cancel(&child);

        cancel_root.cancel();
        assert_eq!(child.err(), Some(CancelCause::Cancelled));
        assert_eq!(grandchild.err(), Some(CancelCause::Cancelled));
    }

    #[test]
    fn test_child_cancel_does_not_affect_parent() {
        let (root, _cancel_root) = CancellationSignal::root();
        let (child, cancel_child) = CancellationSignal::with_cancel(&root);

        cancel_child.cancel();
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
    }

    #[test]
    fn test_deadline_observed_without_runtime() {
        let clock = ManualClock::new();
        let (root, _) = CancellationSignal::root();
        let (signal, _) =
            CancellationSignal::with_timeout(&root, Duration::from_secs(2), clock.shared());

        assert_eq!(signal.err(), None);
        clock.advance(Duration::from_secs(2));
        assert_eq!(signal.err(), Some(CancelCause::DeadlineExceeded));
    }

    #[test]
    fn test_first_cause_wins() {
        let clock = ManualClock::new();
        let (root, _) = CancellationSignal::root();
        let (signal, cancel) =
            CancellationSignal::with_timeout(&root, Duration::from_secs(1), clock.shared());

        cancel.cancel();
        clock.advance(Duration::from_secs(5));
        assert_eq!(signal.err(), Some(CancelCause::Cancelled));
    }

    #[test]
    fn test_zero_timeout_fires_immediately() {
        let (root, _) = CancellationSignal::root();
        let (signal, _) =
            CancellationSignal::with_timeout(&root, Duration::ZERO, ManualClock::new().shared());
        assert_eq!(signal.err(), Some(CancelCause::DeadlineExceeded));
    }

    #[test]
    fn test_inherited_deadline() {
        let clock = ManualClock::new();
        let (root, _) = CancellationSignal::root();
        let (parent, _) =
            CancellationSignal::with_timeout(&root, Duration::from_secs(1), clock.shared());
        let (child, _) =
            CancellationSignal::with_timeout(&parent, Duration::from_secs(10), clock.shared());

        assert_eq!(child.deadline(), parent.deadline());

        clock.advance(Duration::from_secs(1));
        assert_eq!(child.err(), Some(CancelCause::DeadlineExceeded));
    }

    #[test]
    fn test_child_wakes_at_inherited_deadline_without_runtime() {
        let clock = ManualClock::new();
        let (root, _) = CancellationSignal::root();
        let (parent, _) =
            CancellationSignal::with_timeout(&root, Duration::from_secs(1), clock.shared());
        let (child, _) = CancellationSignal::with_cancel(&parent);

        let (cause, ()) = futures::executor::block_on(async {
            futures::join!(child.cancelled(), async {
                clock.advance(Duration::from_secs(1));
            })
        });
        assert_eq!(cause, CancelCause::DeadlineExceeded);
        assert_eq!(parent.err(), Some(CancelCause::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_cancelled_future() {
        let (root, _) = CancellationSignal::root();
        let (signal, _) =
            CancellationSignal::with_timeout(&root, Duration::from_millis(50), SystemClock::shared());

        assert_eq!(signal.cancelled().await, CancelCause::DeadlineExceeded);
        assert!(root.err().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_children_token() {
        let (root, _) = CancellationSignal::root();
        let (parent, _) =
            CancellationSignal::with_timeout(&root, Duration::from_millis(20), SystemClock::shared());
        let (child, _) = CancellationSignal::with_cancel(&parent);

        child.token().cancelled().await;
        assert_eq!(child.err(), Some(CancelCause::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_run_returns_cause() {
        let (signal, cancel) = CancellationSignal::root();
        cancel.cancel();

        let result = signal.run(async { Ok::<_, ConcurrencyError>(1) }).await;
        assert!(matches!(result, Err(ConcurrencyError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted_by_deadline() {
        let clock = SystemClock::shared();
        let (root, _) = CancellationSignal::root();
        let (signal, _) =
            CancellationSignal::with_timeout(&root, Duration::from_millis(10), Arc::clone(&clock));

        let result = signal.sleep(clock.as_ref(), Duration::from_secs(60)).await;
        assert!(matches!(result, Err(ConcurrencyError::DeadlineExceeded)));
    }
}
