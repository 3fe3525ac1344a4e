//! Observability hooks for the concurrency primitives
//!
//! Components log through `tracing` directly. Hooks are an additional,
//! structured channel: every state change worth exporting is emitted as a
//! [`PatternEvent`] to the [`ObservabilityHooks`] attached with `with_hooks`.
//!
//! ```rust
//! use std::sync::Arc;
//! use nebula_concurrency::observability::{LogLevel, LoggingHook, MetricsHook, ObservabilityHooks};
//!
//! let metrics = Arc::new(MetricsHook::new());
//! let hooks = ObservabilityHooks::new()
//!     .with_hook(Arc::new(LoggingHook::new(LogLevel::Info)))
//!     .with_hook(metrics.clone());
//! assert_eq!(metrics.counters().retry_attempts, 0);
//! # drop(hooks);
//! ```

pub mod hooks;

pub use hooks::{
    HookCounters, LogLevel, LoggingHook, MetricsHook, ObservabilityHook, ObservabilityHooks,
    PatternEvent,
};
