//! Result types and error handling utilities

use std::fmt;

use super::error::{ConcurrencyError, ErrorKind};

/// Result type for concurrency operations
pub type ConcurrencyResult<T> = Result<T, ConcurrencyError>;

/// Extension trait for foreign `Result` types
pub trait ResultExt<T> {
    /// Wrap the error as a [`ConcurrencyError::User`]
    fn into_user(self) -> ConcurrencyResult<T>;

    /// Wrap the error as a [`ConcurrencyError::User`], prefixing a context message
    fn context<C>(self, context: C) -> ConcurrencyResult<T>
    where
        C: fmt::Display;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn into_user(self) -> ConcurrencyResult<T> {
        self.map_err(ConcurrencyError::user)
    }

    fn context<C>(self, context: C) -> ConcurrencyResult<T>
    where
        C: fmt::Display,
    {
        self.map_err(|e| ConcurrencyError::user_msg(format!("{context}: {e}")))
    }
}

/// Inspection helpers for [`ConcurrencyResult`]
pub trait ConcurrencyResultExt<T> {
    /// Kind of the error, `None` on success
    fn error_kind(&self) -> Option<ErrorKind>;

    /// `true` when the result is a cancellation or deadline error
    fn is_cancelled(&self) -> bool;
}

impl<T> ConcurrencyResultExt<T> for ConcurrencyResult<T> {
    fn error_kind(&self) -> Option<ErrorKind> {
        self.as_ref().err().map(ConcurrencyError::kind)
    }

    fn is_cancelled(&self) -> bool {
        matches!(self, Err(e) if e.is_cancellation())
    }
}
