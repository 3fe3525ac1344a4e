//! Configuration validation shared by every pattern

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A field failed validation
    #[error("invalid `{field}`: {message}")]
    Validation {
        /// Offending field
        field: &'static str,
        /// Human readable reason
        message: String,
    },
}

impl ConfigError {
    /// Create a validation error
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    /// Name of the offending field
    #[must_use]
    pub fn field(&self) -> &'static str {
        match self {
            Self::Validation { field, .. } => field,
        }
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Base configuration trait for concurrency patterns
pub trait PatternConfig: Send + Sync + Serialize + for<'de> Deserialize<'de> + Clone {
    /// Check every field, failing on the first invalid one
    fn validate(&self) -> ConfigResult<()>;

    /// Get default configuration
    fn default_config() -> Self
    where
        Self: Sized;
}

pub(crate) fn ensure_positive_u32(field: &'static str, value: u32) -> ConfigResult<()> {
    if value == 0 {
        return Err(ConfigError::validation(field, "must be at least 1"));
    }
    Ok(())
}

pub(crate) fn ensure_positive_usize(field: &'static str, value: usize) -> ConfigResult<()> {
    if value == 0 {
        return Err(ConfigError::validation(field, "must be at least 1"));
    }
    Ok(())
}

pub(crate) fn ensure_non_zero(field: &'static str, value: Duration) -> ConfigResult<()> {
    if value.is_zero() {
        return Err(ConfigError::validation(field, "must be greater than zero"));
    }
    Ok(())
}

pub(crate) fn ensure_finite(field: &'static str, value: f64) -> ConfigResult<()> {
    if !value.is_finite() {
        return Err(ConfigError::validation(field, format!("must be finite, got {value}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ConfigError::validation("capacity", "must be at least 1");
        assert_eq!(err.field(), "capacity");
        assert_eq!(err.to_string(), "invalid `capacity`: must be at least 1");
    }

    #[test]
    fn test_helpers() {
        assert!(ensure_positive_u32("n", 0).is_err());
        assert!(ensure_positive_u32("n", 1).is_ok());
        assert!(ensure_positive_usize("q", 0).is_err());
        assert!(ensure_non_zero("d", Duration::ZERO).is_err());
        assert!(ensure_non_zero("d", Duration::from_nanos(1)).is_ok());
        assert!(ensure_finite("b", f64::NAN).is_err());
        assert!(ensure_finite("b", f64::INFINITY).is_err());
        assert!(ensure_finite("b", 2.0).is_ok());
    }
}
