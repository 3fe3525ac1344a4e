//! Error types shared by every concurrency pattern

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::cancellation::CancelCause;
use super::config::ConfigError;

/// Errors surfaced by the concurrency primitives.
///
/// Every public operation returns either a value or one of these variants.
/// The type is `Clone` so that a single failure can be fanned out to
/// observers (hooks, result streams, retry statistics) without re-running
/// the operation that produced it.
#[derive(Debug, Clone, Error)]
pub enum ConcurrencyError {
    /// The caller-supplied cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The deadline attached to the cancellation signal elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The worker pool input queue is at capacity.
    #[error("input queue is full (capacity: {capacity})")]
    QueueFull {
        /// Configured input queue capacity
        capacity: usize,
    },

    /// The worker pool no longer accepts work.
    #[error("worker pool is shutting down")]
    ShuttingDown,

    /// An open circuit breaker rejected the call without running it.
    #[error("circuit breaker is open")]
    ShortCircuit {
        /// Time until the breaker admits a probe, if known
        retry_after: Option<Duration>,
    },

    /// The retry engine ran out of attempts on a retryable error.
    #[error("retry exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Error returned by the final attempt
        last_error: Box<ConcurrencyError>,
    },

    /// A user function panicked and the panic was captured at the worker boundary.
    #[error("user function panicked: {message}")]
    UserFault {
        /// Panic payload rendered as text
        message: String,
    },

    /// A component was constructed with invalid parameters.
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// Error returned by the caller-supplied operation, passed through untouched.
    #[error(transparent)]
    User(UserError),
}

/// Flat classification of [`ConcurrencyError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`ConcurrencyError::Cancelled`]
    Cancelled,
    /// See [`ConcurrencyError::DeadlineExceeded`]
    DeadlineExceeded,
    /// See [`ConcurrencyError::QueueFull`]
    QueueFull,
    /// See [`ConcurrencyError::ShuttingDown`]
    ShuttingDown,
    /// See [`ConcurrencyError::ShortCircuit`]
    ShortCircuit,
    /// See [`ConcurrencyError::RetryExhausted`]
    RetryExhausted,
    /// See [`ConcurrencyError::UserFault`]
    UserFault,
    /// See [`ConcurrencyError::InvalidConfig`]
    InvalidConfig,
    /// See [`ConcurrencyError::User`]
    User,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::QueueFull => "queue_full",
            Self::ShuttingDown => "shutting_down",
            Self::ShortCircuit => "short_circuit",
            Self::RetryExhausted => "retry_exhausted",
            Self::UserFault => "user_fault",
            Self::InvalidConfig => "invalid_config",
            Self::User => "user",
        };
        f.write_str(name)
    }
}

impl ConcurrencyError {
    /// Wrap a caller error.
    pub fn user<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::User(UserError::new(error))
    }

    /// Wrap a plain message as a caller error.
    pub fn user_msg(message: impl Into<String>) -> Self {
        Self::User(UserError::msg(message))
    }

    /// Create a short-circuit error
    #[must_use]
    pub fn short_circuit(retry_after: Option<Duration>) -> Self {
        Self::ShortCircuit { retry_after }
    }

    /// Create a retry-exhausted error
    #[must_use]
    pub fn retry_exhausted(attempts: u32, last_error: Self) -> Self {
        Self::RetryExhausted {
            attempts,
            last_error: Box::new(last_error),
        }
    }

    /// Discriminant of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Cancelled => ErrorKind::Cancelled,
            Self::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Self::QueueFull { .. } => ErrorKind::QueueFull,
            Self::ShuttingDown => ErrorKind::ShuttingDown,
            Self::ShortCircuit { .. } => ErrorKind::ShortCircuit,
            Self::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            Self::UserFault { .. } => ErrorKind::UserFault,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::User(_) => ErrorKind::User,
        }
    }

    /// `true` for errors produced by a fired cancellation signal.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }

    /// Hint for when the failed call may succeed again.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ShortCircuit { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Borrow the wrapped caller error, if this is a [`ConcurrencyError::User`].
    #[must_use]
    pub fn as_user(&self) -> Option<&UserError> {
        match self {
            Self::User(inner) => Some(inner),
            _ => None,
        }
    }
}

impl From<CancelCause> for ConcurrencyError {
    fn from(cause: CancelCause) -> Self {
        match cause {
            CancelCause::Cancelled => Self::Cancelled,
            CancelCause::DeadlineExceeded => Self::DeadlineExceeded,
        }
    }
}

/// Caller error carried by [`ConcurrencyError::User`].
///
/// Stored behind an `Arc` so the enclosing error stays cheaply clonable.
/// Use [`UserError::downcast_ref`] to recover the concrete type.
#[derive(Clone)]
pub struct UserError {
    inner: Arc<dyn StdError + Send + Sync>,
}

impl UserError {
    /// Wrap any error value.
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(error),
        }
    }

    /// Wrap a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Message(message.into()))
    }

    /// Attempt to view the wrapped error as `E`.
    #[must_use]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        self.inner.downcast_ref::<E>()
    }
}

impl fmt::Debug for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl StdError for UserError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source()
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
struct Message(String);

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error, PartialEq)]
    #[error("not found: {0}")]
    struct NotFound(&'static str);

    #[test]
    fn test_user_error_downcast() {
        let err = ConcurrencyError::user(NotFound("job-7"));
        assert_eq!(err.kind(), ErrorKind::User);
        assert_eq!(err.to_string(), "not found: job-7");

        let inner = err.as_user().and_then(UserError::downcast_ref::<NotFound>);
        assert_eq!(inner, Some(&NotFound("job-7")));
    }

    #[test]
    fn test_clone_keeps_message() {
        let err = ConcurrencyError::user_msg("flaky backend");
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
    }

    #[test]
    fn test_retry_exhausted_display_includes_last_error() {
        let err = ConcurrencyError::retry_exhausted(4, ConcurrencyError::user_msg("boom"));
        assert_eq!(err.kind(), ErrorKind::RetryExhausted);
        assert_eq!(err.to_string(), "retry exhausted after 4 attempts: boom");
    }

    #[test]
    fn test_cancel_cause_conversion() {
        assert!(matches!(
            ConcurrencyError::from(CancelCause::Cancelled),
            ConcurrencyError::Cancelled
        ));
        let deadline = ConcurrencyError::from(CancelCause::DeadlineExceeded);
        assert!(deadline.is_cancellation());
        assert_eq!(deadline.kind(), ErrorKind::DeadlineExceeded);
    }

    #[test]
    fn test_short_circuit_retry_after() {
        let err = ConcurrencyError::short_circuit(Some(Duration::from_millis(250)));
        assert_eq!(err.retry_after(), Some(Duration::from_millis(250)));
        assert_eq!(ConcurrencyError::ShuttingDown.retry_after(), None);
    }
}
