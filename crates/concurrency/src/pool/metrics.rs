//! Worker pool counters

use std::fmt;

/// Lifecycle phase of a worker pool. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PoolPhase {
    /// Accepting and processing jobs
    Running,
    /// No longer accepting jobs; queued jobs are still processed
    Draining,
    /// Every worker has exited
    Stopped,
}

impl fmt::Display for PoolPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Point-in-time view of a worker pool.
///
/// Counters are read under one lock, so `completed_ok + completed_err +
/// abandoned + in_flight <= submitted` holds in every snapshot; the
/// difference is the number of jobs still queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolMetrics {
    /// Jobs accepted onto the input queue
    pub submitted: u64,
    /// Jobs whose handler returned `Ok`
    pub completed_ok: u64,
    /// Jobs whose handler returned `Err` or panicked
    pub completed_err: u64,
    /// Jobs dropped by a forced stop, queued or running
    pub abandoned: u64,
    /// Jobs currently held by a worker
    pub in_flight: usize,
    /// Jobs waiting on the input queue
    pub queue_depth: usize,
    /// Current phase
    pub phase: PoolPhase,
    /// Jobs in flight when a shutdown timed out, `None` if none did
    pub in_flight_at_force_stop: Option<usize>,
}

impl PoolMetrics {
    /// Jobs that reached a terminal state
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed_ok + self.completed_err
    }
}

#[derive(Debug)]
pub(crate) struct PoolCounters {
    pub(crate) next_job_id: u64,
    pub(crate) submitted: u64,
    pub(crate) completed_ok: u64,
    pub(crate) completed_err: u64,
    pub(crate) abandoned: u64,
    pub(crate) in_flight: usize,
    pub(crate) phase: PoolPhase,
    pub(crate) in_flight_at_force_stop: Option<usize>,
}

impl PoolCounters {
    pub(crate) fn new() -> Self {
        Self {
            next_job_id: 1,
            submitted: 0,
            completed_ok: 0,
            completed_err: 0,
            abandoned: 0,
            in_flight: 0,
            phase: PoolPhase::Running,
            in_flight_at_force_stop: None,
        }
    }

    pub(crate) fn snapshot(&self, queue_depth: usize) -> PoolMetrics {
        PoolMetrics {
            submitted: self.submitted,
            completed_ok: self.completed_ok,
            completed_err: self.completed_err,
            abandoned: self.abandoned,
            in_flight: self.in_flight,
            queue_depth,
            phase: self.phase,
            in_flight_at_force_stop: self.in_flight_at_force_stop,
        }
    }

    /// Move to `to` if it is later than the current phase.
    pub(crate) fn advance(&mut self, to: PoolPhase) -> Option<(PoolPhase, PoolPhase)> {
        let from = self.phase;
        if to <= from {
            return None;
        }
        self.phase = to;
        Some((from, to))
    }

    pub(crate) fn finish(&mut self, ok: bool) {
        self.in_flight = self.in_flight.saturating_sub(1);
        if ok {
            self.completed_ok += 1;
        } else {
            self.completed_err += 1;
        }
    }

    pub(crate) fn abandon_in_flight(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.abandoned += 1;
    }
}
