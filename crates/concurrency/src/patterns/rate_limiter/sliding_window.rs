//! Sliding window log algorithm

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::{Admission, RateAlgorithm};
use crate::core::{ConfigResult, ensure_non_zero, ensure_positive_u32};

/// Sliding window log
///
/// Keeps the instants of admissions made during the trailing `window`.
/// A call is admitted when fewer than `limit` admissions remain in the window
/// after expired entries are pruned. Pruning is lazy: it happens on every
/// observation rather than on a timer. The log grows with the admissions
/// actually in the window, not with `limit`.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    limit: u32,
    window: Duration,
    admissions: VecDeque<Instant>,
}

impl SlidingWindow {
    /// Create an empty window.
    ///
    /// # Errors
    ///
    /// Rejects a zero limit or a zero window.
    pub fn new(limit: u32, window: Duration) -> ConfigResult<Self> {
        ensure_positive_u32("limit", limit)?;
        ensure_non_zero("window", window)?;

        Ok(Self {
            limit,
            window,
            admissions: VecDeque::new(),
        })
    }

    /// Maximum admissions per window
    #[must_use]
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Window length
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Admissions retained after pruning at `now`.
    pub fn occupancy(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.admissions.len()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.admissions.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.admissions.pop_front();
            } else {
                break;
            }
        }
    }
}

impl RateAlgorithm for SlidingWindow {
    fn try_admit(&mut self, now: Instant) -> Admission {
        self.prune(now);

        if self.admissions.len() < self.limit as usize {
            self.admissions.push_back(now);
            return Admission::Granted;
        }

        match self.admissions.front() {
            Some(&oldest) => {
                Admission::RetryAfter(self.window - now.saturating_duration_since(oldest))
            }
            None => Admission::RetryAfter(self.window),
        }
    }

    fn available(&mut self, now: Instant) -> u64 {
        self.prune(now);
        u64::from(self.limit).saturating_sub(self.admissions.len() as u64)
    }

    fn reset(&mut self, _now: Instant) {
        self.admissions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation() {
        assert_eq!(
            SlidingWindow::new(0, Duration::from_secs(1)).unwrap_err().field(),
            "limit"
        );
        assert_eq!(
            SlidingWindow::new(1, Duration::ZERO).unwrap_err().field(),
            "window"
        );
    }

    #[test]
    fn test_limit_per_window() {
        let start = Instant::now();
        let mut window = SlidingWindow::new(2, Duration::from_secs(1)).unwrap();

        assert_eq!(window.try_admit(start), Admission::Granted);
        assert_eq!(
            window.try_admit(start + Duration::from_millis(400)),
            Admission::Granted
        );
        assert_eq!(
            window.try_admit(start + Duration::from_millis(500)),
            Admission::RetryAfter(Duration::from_millis(500))
        );
    }

    #[test]
    fn test_entries_expire_at_window_boundary() {
        let start = Instant::now();
        let mut window = SlidingWindow::new(1, Duration::from_secs(1)).unwrap();

        assert_eq!(window.try_admit(start), Admission::Granted);
        assert_eq!(window.occupancy(start + Duration::from_millis(999)), 1);
        assert_eq!(window.occupancy(start + Duration::from_secs(1)), 0);
        assert_eq!(
            window.try_admit(start + Duration::from_secs(1)),
            Admission::Granted
        );
    }

    #[test]
    fn test_huge_limit_allocates_lazily() {
        let start = Instant::now();
        let mut window = SlidingWindow::new(u32::MAX, Duration::from_secs(1)).unwrap();
        assert_eq!(window.available(start), u64::from(u32::MAX));

        for _ in 0..100 {
            assert_eq!(window.try_admit(start), Admission::Granted);
        }
        assert_eq!(window.occupancy(start), 100);
        assert!(window.admissions.capacity() < 1024);
    }

    #[test]
    fn test_available_and_reset() {
        let start = Instant::now();
        let mut window = SlidingWindow::new(3, Duration::from_secs(10)).unwrap();
        window.try_admit(start);
        assert_eq!(window.available(start), 2);
        window.reset(start);
        assert_eq!(window.available(start), 3);
    }
}
