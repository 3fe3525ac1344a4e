//! Integration tests for rate limiting
//!
//! Covers:
//! - Token bucket burst and refill through the front end
//! - Admission bounds of every algorithm under arbitrary call patterns
//! - Cancellation of blocked waiters
//! - FIFO service of blocked waiters

use std::sync::Arc;
use std::time::{Duration, Instant};

use nebula_concurrency::core::{CancellationSignal, ErrorKind, ManualClock, SystemClock};
use nebula_concurrency::patterns::rate_limiter::{
    Admission, RateAlgorithm, RateLimiter, RateLimiterConfig, SlidingWindow, SteadyTick, TokenBucket,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

/// Test: token bucket smoke
/// Scenario: capacity 3, one token per second, five calls at t=0 then two at t=2s
#[test]
fn test_token_bucket_burst_then_refill() {
    let clock = ManualClock::new();
    let limiter = RateLimiter::with_clock(
        RateLimiterConfig::TokenBucket {
            capacity: 3,
            refill_per_sec: 1.0,
        },
        clock.shared(),
    )
    .unwrap();

    let burst: Vec<bool> = (0..5).map(|_| limiter.allow()).collect();
    assert_eq!(burst, vec![true, true, true, false, false]);

    clock.advance(Duration::from_secs(2));
    let refilled: Vec<bool> = (0..2).map(|_| limiter.allow()).collect();
    assert_eq!(refilled, vec![true, true]);

    let snapshot = limiter.snapshot();
    assert_eq!(snapshot.admitted, 5);
    assert_eq!(snapshot.rejected, 2);
    assert_eq!(snapshot.available_permits, 0);
}

/// Test: a refill rate too small to express as a delay rejects instead of panicking
/// Scenario: capacity 1 at 1e-20 tokens/s; allow twice, then wait under a deadline
#[tokio::test(start_paused = true)]
async fn test_token_bucket_tiny_rate() {
    let limiter = RateLimiter::token_bucket(1, 1e-20).unwrap();
    assert!(limiter.allow());
    assert!(!limiter.allow());

    let (signal, _canceller) = CancellationSignal::with_timeout(
        &CancellationSignal::never(),
        Duration::from_secs(5),
        SystemClock::shared(),
    );
    let err = limiter.wait(&signal).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    assert_eq!(limiter.snapshot().admitted, 1);
}

/// Test: a cancelled wait never consumes a permit
#[tokio::test(start_paused = true)]
async fn test_wait_deadline_does_not_admit() {
    let limiter = RateLimiter::token_bucket(1, 1.0).unwrap();
    assert!(limiter.allow());

    let (signal, _canceller) = CancellationSignal::with_timeout(
        &CancellationSignal::never(),
        Duration::from_millis(200),
        SystemClock::shared(),
    );
    let err = limiter.wait(&signal).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);

    let snapshot = limiter.snapshot();
    assert_eq!(snapshot.admitted, 1);
    assert_eq!(snapshot.waiting_callers, 0);
}

/// Test: an already fired signal is reported before touching the algorithm
#[tokio::test]
async fn test_wait_with_fired_signal() {
    let limiter = RateLimiter::token_bucket(5, 1.0).unwrap();
    let (signal, canceller) = CancellationSignal::root();
    canceller.cancel();

    let err = limiter.wait(&signal).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(limiter.snapshot().available_permits, 5);
}

/// Test: blocked callers are admitted in arrival order
#[tokio::test(start_paused = true)]
async fn test_waiters_served_fifo() {
    let limiter = Arc::new(RateLimiter::steady_tick(Duration::from_millis(100)).unwrap());
    assert!(limiter.allow());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut handles = Vec::new();
    for id in 0..4 {
        let limiter = Arc::clone(&limiter);
        let tx = tx.clone();
        handles.push(tokio::spawn(async move {
            limiter.wait(&CancellationSignal::never()).await.unwrap();
            tx.send(id).unwrap();
        }));
        // let each waiter enqueue before the next one arrives
        tokio::task::yield_now().await;
    }
    drop(tx);

    for handle in handles {
        handle.await.unwrap();
    }
    let mut order = Vec::new();
    while let Some(id) = rx.recv().await {
        order.push(id);
    }
    assert_eq!(order, vec![0, 1, 2, 3]);
}

/// Test: sliding window rejects with the time until the oldest entry expires
#[test]
fn test_sliding_window_retry_after() {
    let start = Instant::now();
    let mut window = SlidingWindow::new(2, Duration::from_secs(1)).unwrap();
    assert_eq!(window.try_admit(start), Admission::Granted);
    assert_eq!(
        window.try_admit(start + Duration::from_millis(300)),
        Admission::Granted
    );
    assert_eq!(
        window.try_admit(start + Duration::from_millis(400)),
        Admission::RetryAfter(Duration::from_millis(600))
    );
    assert_eq!(
        window.try_admit(start + Duration::from_secs(1)),
        Admission::Granted
    );
}

/// Test: configuration round-trips through its tagged JSON form
#[cfg(not(feature = "humantime"))]
#[test]
fn test_config_from_json() {
    let config: RateLimiterConfig =
        serde_json::from_str(r#"{"strategy":"sliding_window","limit":10,"window":{"secs":1,"nanos":0}}"#)
            .unwrap();
    assert_eq!(
        config,
        RateLimiterConfig::SlidingWindow {
            limit: 10,
            window: Duration::from_secs(1)
        }
    );
    assert!(RateLimiter::new(config).is_ok());
}

fn instants(start: Instant, gaps_ms: &[u64]) -> Vec<Instant> {
    let mut now = start;
    gaps_ms
        .iter()
        .map(|gap| {
            now += Duration::from_millis(*gap);
            now
        })
        .collect()
}

proptest! {
    /// Admissions over any window never exceed `C + r * (t1 - t0)`.
    #[test]
    fn prop_token_bucket_bound(
        capacity in 1u32..10,
        rate in 0.0f64..50.0,
        gaps in prop::collection::vec(0u64..200, 1..120),
    ) {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(capacity, rate, start).unwrap();
        let times = instants(start, &gaps);
        let granted: Vec<bool> = times.iter().map(|t| bucket.try_admit(*t).is_granted()).collect();

        for i in 0..times.len() {
            let mut admitted = 0u32;
            for j in i..times.len() {
                admitted += u32::from(granted[j]);
                let span = times[j].duration_since(times[i]).as_secs_f64();
                let bound = f64::from(capacity) + rate * span;
                // relative slack covers float rounding in the incremental refill only
                prop_assert!(
                    f64::from(admitted) <= bound * (1.0 + 1e-12),
                    "{admitted} admissions in {span}s exceed bound {bound}"
                );
            }
        }
    }

    /// The retained set never holds more than `limit` entries.
    #[test]
    fn prop_sliding_window_occupancy(
        limit in 1u32..8,
        window_ms in 1u64..500,
        gaps in prop::collection::vec(0u64..100, 1..150),
    ) {
        let start = Instant::now();
        let mut window = SlidingWindow::new(limit, Duration::from_millis(window_ms)).unwrap();
        for now in instants(start, &gaps) {
            let _ = window.try_admit(now);
            prop_assert!(window.occupancy(now) <= limit as usize);
        }
    }

    /// Consecutive admissions are at least the minimum interval apart.
    #[test]
    fn prop_steady_tick_gap(
        interval_ms in 0u64..200,
        gaps in prop::collection::vec(0u64..150, 1..150),
    ) {
        let interval = Duration::from_millis(interval_ms);
        let start = Instant::now();
        let mut tick = SteadyTick::new(interval);
        let mut last: Option<Instant> = None;
        for now in instants(start, &gaps) {
            if tick.try_admit(now).is_granted() {
                if let Some(previous) = last {
                    prop_assert!(now.duration_since(previous) >= interval);
                }
                last = Some(now);
            }
        }
    }
}
