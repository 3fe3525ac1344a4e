//! Core types shared by every pattern
//!
//! Error taxonomy, configuration validation, the injectable clock and the
//! cancellation scope used by all blocking operations.

mod cancellation;
mod clock;
mod config;
mod error;
mod result;

pub use cancellation::{CancelCause, CancellationSignal, Canceller};
pub use clock::{Clock, ManualClock, SharedClock, Sleep, SystemClock, Ticker};
pub use config::{ConfigError, ConfigResult, PatternConfig};
pub(crate) use config::{ensure_finite, ensure_non_zero, ensure_positive_u32, ensure_positive_usize};
pub use error::{ConcurrencyError, ErrorKind, UserError};
pub use result::{ConcurrencyResult, ConcurrencyResultExt, ResultExt};

/// Core constants
pub mod constants {
    use std::time::Duration;

    /// Default number of retry attempts
    pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

    /// Default first retry delay
    pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

    /// Default retry delay cap
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

    /// Default circuit breaker failure threshold
    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

    /// Default circuit breaker success threshold
    pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;

    /// Default circuit breaker recovery timeout
    pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);

    /// Default rate limit in permits per second
    pub const DEFAULT_RATE_LIMIT: f64 = 100.0;
}
