//! Injectable monotonic time source
//!
//! Every component that reads time or sleeps does so through an
//! `Arc<dyn Clock>`. Two implementations ship with the crate:
//!
//! - [`SystemClock`] delegates to `tokio::time`, so tests running under
//!   `#[tokio::test(start_paused = true)]` observe virtual time for free.
//! - [`ManualClock`] is a fully manual timeline advanced with
//!   [`ManualClock::advance`], for state-machine tests that should not depend
//!   on the runtime at all.
//!
//! [`Ticker`] builds a periodic timer on top of any clock.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::config::{ConfigResult, ensure_non_zero};

/// Boxed delay future returned by [`Clock::sleep`].
pub type Sleep = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Monotonic time source with single-shot timers.
pub trait Clock: Send + Sync + fmt::Debug + 'static {
    /// Current monotonic instant.
    fn now(&self) -> Instant;

    /// Future completing once `duration` has elapsed on this clock.
    fn sleep(&self, duration: Duration) -> Sleep;

    /// Future completing once `deadline` is reached. Completes immediately
    /// when the deadline is already in the past.
    fn sleep_until(&self, deadline: Instant) -> Sleep {
        self.sleep(deadline.saturating_duration_since(self.now()))
    }
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// Wall clock backed by `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Shared handle to the system clock
    #[must_use]
    pub fn shared() -> SharedClock {
        Arc::new(Self)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        Box::pin(tokio::time::sleep(duration))
    }

    fn sleep_until(&self, deadline: Instant) -> Sleep {
        Box::pin(tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)))
    }
}

/// Manually advanced clock.
///
/// Time only moves when [`advance`](Self::advance) is called; pending sleeps
/// whose deadline has been reached are woken outside the internal lock.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<ManualInner>,
}

#[derive(Debug)]
struct ManualInner {
    state: Mutex<ManualState>,
}

#[derive(Debug)]
struct ManualState {
    origin: Instant,
    elapsed: Duration,
    sleepers: Vec<Arc<Sleeper>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    /// Clock starting at the current real instant
    #[must_use]
    pub fn new() -> Self {
        Self::with_start(Instant::now())
    }

    /// Clock starting at `origin`
    #[must_use]
    pub fn with_start(origin: Instant) -> Self {
        Self {
            inner: Arc::new(ManualInner {
                state: Mutex::new(ManualState {
                    origin,
                    elapsed: Duration::ZERO,
                    sleepers: Vec::new(),
                }),
            }),
        }
    }

    /// Shared handle to this clock
    #[must_use]
    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }

    /// Move time forward and wake every sleep that became due.
    pub fn advance(&self, delta: Duration) {
        let due = {
            let mut state = self.inner.state.lock();
            state.elapsed = state.elapsed.saturating_add(delta);
            let current = state.elapsed;
            let mut due = Vec::new();
            state.sleepers.retain(|sleeper| {
                if sleeper.deadline <= current {
                    due.push(Arc::clone(sleeper));
                    false
                } else {
                    true
                }
            });
            due
        };

        for sleeper in due {
            sleeper.complete();
        }
    }

    /// Total time advanced since construction
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.inner.state.lock().elapsed
    }

    /// Number of sleeps still waiting for their deadline.
    #[must_use]
    pub fn pending_sleepers(&self) -> usize {
        self.inner.state.lock().sleepers.len()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let state = self.inner.state.lock();
        state.origin + state.elapsed
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        let mut state = self.inner.state.lock();
        if duration.is_zero() {
            return Box::pin(std::future::ready(()));
        }
        let sleeper = Arc::new(Sleeper {
            deadline: state.elapsed.saturating_add(duration),
            slot: Mutex::new(SleeperSlot::default()),
        });
        state.sleepers.push(Arc::clone(&sleeper));
        Box::pin(ManualSleep {
            sleeper,
            clock: Arc::clone(&self.inner),
        })
    }
}

#[derive(Debug)]
struct Sleeper {
    deadline: Duration,
    slot: Mutex<SleeperSlot>,
}

#[derive(Debug, Default)]
struct SleeperSlot {
    completed: bool,
    waker: Option<Waker>,
}

impl Sleeper {
    fn complete(&self) {
        let waker = {
            let mut slot = self.slot.lock();
            slot.completed = true;
            slot.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

struct ManualSleep {
    sleeper: Arc<Sleeper>,
    clock: Arc<ManualInner>,
}

impl Future for ManualSleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut slot = self.sleeper.slot.lock();
        if slot.completed {
            return Poll::Ready(());
        }
        slot.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for ManualSleep {
    fn drop(&mut self) {
        let mut state = self.clock.state.lock();
        state
            .sleepers
            .retain(|sleeper| !Arc::ptr_eq(sleeper, &self.sleeper));
    }
}

/// Periodic timer.
///
/// The first tick completes one `period` after construction (or after the
/// last [`reset`](Self::reset)). When the consumer falls behind, missed
/// ticks are skipped: the next tick is scheduled one period after the moment
/// the late tick was observed.
#[derive(Debug)]
pub struct Ticker {
    clock: SharedClock,
    period: Duration,
    next: Option<Instant>,
}

impl Ticker {
    /// Create a ticker firing every `period`.
    ///
    /// # Errors
    ///
    /// Returns a validation error when `period` is zero.
    pub fn new(clock: SharedClock, period: Duration) -> ConfigResult<Self> {
        ensure_non_zero("period", period)?;
        let next = clock.now().checked_add(period);
        Ok(Self {
            clock,
            period,
            next,
        })
    }

    /// Tick period
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Wait for the next tick and return the instant it was observed.
    ///
    /// Returns `None` once the ticker has been stopped.
    pub async fn tick(&mut self) -> Option<Instant> {
        let deadline = self.next?;
        self.clock.sleep_until(deadline).await;

        let now = self.clock.now();
        let scheduled = deadline.checked_add(self.period);
        self.next = match scheduled {
            Some(at) if at > now => Some(at),
            _ => now.checked_add(self.period),
        };
        Some(now)
    }

    /// Restart the schedule from the current instant.
    pub fn reset(&mut self) {
        self.next = self.clock.now().checked_add(self.period);
    }

    /// Stop the ticker. Subsequent [`tick`](Self::tick) calls return `None`
    /// until [`reset`](Self::reset) is called.
    pub fn stop(&mut self) {
        self.next = None;
    }

    /// `true` once [`stop`](Self::stop) has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.next.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::from_millis(150));
        assert_eq!(clock.now() - start, Duration::from_millis(150));
        assert_eq!(clock.elapsed(), Duration::from_millis(150));
    }

    #[test]
    fn test_manual_sleep_completes_on_advance() {
        let clock = ManualClock::new();
        let mut sleep = clock.sleep(Duration::from_secs(1));

        assert!(sleep.as_mut().now_or_never().is_none());
        assert_eq!(clock.pending_sleepers(), 1);

        clock.advance(Duration::from_millis(999));
        assert!(sleep.as_mut().now_or_never().is_none());

        clock.advance(Duration::from_millis(1));
        assert!(sleep.as_mut().now_or_never().is_some());
        assert_eq!(clock.pending_sleepers(), 0);
    }

    #[test]
    fn test_zero_sleep_is_ready() {
        let clock = ManualClock::new();
        assert!(clock.sleep(Duration::ZERO).now_or_never().is_some());
        assert_eq!(clock.pending_sleepers(), 0);
    }

    #[test]
    fn test_dropped_sleep_is_unregistered() {
        let clock = ManualClock::new();
        let sleep = clock.sleep(Duration::from_secs(5));
        assert_eq!(clock.pending_sleepers(), 1);
        drop(sleep);
        assert_eq!(clock.pending_sleepers(), 0);
    }

    #[tokio::test]
    async fn test_manual_sleep_wakes_task() {
        let clock = ManualClock::new();
        let sleeper = clock.clone();
        let handle = tokio::spawn(async move {
            sleeper.sleep(Duration::from_secs(3)).await;
        });

        while clock.pending_sleepers() == 0 {
            tokio::task::yield_now().await;
        }
        clock.advance(Duration::from_secs(3));
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_clock_follows_paused_time() {
        let clock = SystemClock;
        let start = clock.now();
        clock.sleep(Duration::from_secs(10)).await;
        assert!(clock.now() - start >= Duration::from_secs(10));
    }

    #[test]
    fn test_ticker_rejects_zero_period() {
        assert!(Ticker::new(ManualClock::new().shared(), Duration::ZERO).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_periodic() {
        let clock = SystemClock::shared();
        let start = clock.now();
        let mut ticker = Ticker::new(clock, Duration::from_millis(100)).unwrap();

        let first = ticker.tick().await.unwrap();
        let second = ticker.tick().await.unwrap();
        assert_eq!(first - start, Duration::from_millis(100));
        assert_eq!(second - start, Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_skips_missed_ticks() {
        let clock = SystemClock::shared();
        let start = clock.now();
        let mut ticker = Ticker::new(Arc::clone(&clock), Duration::from_millis(100)).unwrap();

        tokio::time::advance(Duration::from_millis(350)).await;
        let late = ticker.tick().await.unwrap();
        assert_eq!(late - start, Duration::from_millis(350));

        let next = ticker.tick().await.unwrap();
        assert_eq!(next - start, Duration::from_millis(450));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_stop_and_reset() {
        let clock = SystemClock::shared();
        let mut ticker = Ticker::new(Arc::clone(&clock), Duration::from_millis(50)).unwrap();

        ticker.stop();
        assert!(ticker.is_stopped());
        assert!(ticker.tick().await.is_none());

        ticker.reset();
        let restarted = clock.now();
        let at = ticker.tick().await.unwrap();
        assert_eq!(at - restarted, Duration::from_millis(50));
    }
}
