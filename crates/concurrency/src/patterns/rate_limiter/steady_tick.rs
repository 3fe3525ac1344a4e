//! Steady tick algorithm

use std::time::{Duration, Instant};

use super::{Admission, RateAlgorithm};

/// Fixed-interval admissions.
///
/// Admissions are never closer together than `min_interval`. There is no
/// burst allowance beyond the first call. `Duration::MAX` admits the first
/// call and nothing after it; `Duration::ZERO` admits everything.
#[derive(Debug, Clone)]
pub struct SteadyTick {
    min_interval: Duration,
    last_admit: Option<Instant>,
}

impl SteadyTick {
    /// Create a ticker-style limiter
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_admit: None,
        }
    }

    /// Minimum gap between admissions
    #[must_use]
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Instant of the last admission
    #[must_use]
    pub fn last_admit(&self) -> Option<Instant> {
        self.last_admit
    }

    fn remaining(&self, now: Instant) -> Duration {
        match self.last_admit {
            Some(last) => self
                .min_interval
                .saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }
}

impl RateAlgorithm for SteadyTick {
    fn try_admit(&mut self, now: Instant) -> Admission {
        let remaining = self.remaining(now);
        if remaining.is_zero() {
            self.last_admit = Some(now);
            return Admission::Granted;
        }
        if self.min_interval == Duration::MAX {
            return Admission::Exhausted;
        }
        Admission::RetryAfter(remaining)
    }

    fn available(&mut self, now: Instant) -> u64 {
        u64::from(self.remaining(now).is_zero())
    }

    fn reset(&mut self, _now: Instant) {
        self.last_admit = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gap_enforced() {
        let start = Instant::now();
        let mut tick = SteadyTick::new(Duration::from_millis(100));

        assert_eq!(tick.try_admit(start), Admission::Granted);
        assert_eq!(
            tick.try_admit(start + Duration::from_millis(30)),
            Admission::RetryAfter(Duration::from_millis(70))
        );
        assert_eq!(
            tick.try_admit(start + Duration::from_millis(100)),
            Admission::Granted
        );
        assert_eq!(tick.last_admit(), Some(start + Duration::from_millis(100)));
    }

    #[test]
    fn test_infinite_interval_admits_once() {
        let start = Instant::now();
        let mut tick = SteadyTick::new(Duration::MAX);
        assert_eq!(tick.try_admit(start), Admission::Granted);
        assert_eq!(
            tick.try_admit(start + Duration::from_secs(86_400)),
            Admission::Exhausted
        );
    }

    #[test]
    fn test_zero_interval_admits_everything() {
        let start = Instant::now();
        let mut tick = SteadyTick::new(Duration::ZERO);
        for _ in 0..10 {
            assert_eq!(tick.try_admit(start), Admission::Granted);
        }
    }

    #[test]
    fn test_available() {
        let start = Instant::now();
        let mut tick = SteadyTick::new(Duration::from_secs(1));
        assert_eq!(tick.available(start), 1);
        tick.try_admit(start);
        assert_eq!(tick.available(start), 0);
        tick.reset(start);
        assert_eq!(tick.available(start), 1);
    }
}
