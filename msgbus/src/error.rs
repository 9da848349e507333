//! Structured error types for the message bus.
//!
//! Per the crate's error-handling design, the public dispatch surface itself
//! never returns `Result` — `Dispatcher::dispatch` reports `bool`, matching
//! the original engine's "the dispatcher never throws". These types exist
//! for the narrower internal surfaces that do have a real failure mode: the
//! wire codec and handler lifecycle management.

use thiserror::Error;

/// Failures from installing, uninstalling, or otherwise managing the
/// handler list.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("handler {name:?} is still in flight after {waited_ms}ms, giving up")]
    UninstallTimedOut { name: String, waited_ms: u64 },

    #[error("queue is closed")]
    QueueClosed,

    #[error("queue is at its configured capacity ({capacity})")]
    QueueFull { capacity: usize },
}

impl DispatchError {
    /// Whether retrying the same operation shortly afterward might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, DispatchError::UninstallTimedOut { .. } | DispatchError::QueueFull { .. })
    }

    /// Whether the error indicates the dispatcher itself cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DispatchError::QueueClosed)
    }
}

/// Failures decoding or encoding the external control-channel line
/// protocol (spec.md §4.4).
#[derive(Debug, Error)]
pub enum WireError {
    #[error("line does not start with the expected prefix {expected:?}")]
    PrefixMismatch { expected: &'static str },

    #[error("malformed escape sequence at byte offset {offset}")]
    MalformedEscape { offset: usize },

    #[error("line exceeds maximum length {max}")]
    TooLong { max: usize },
}

impl WireError {
    /// `true` for every variant here: malformed wire input is always the
    /// caller's fault, never recoverable by retrying the same bytes.
    pub fn is_recoverable(&self) -> bool {
        false
    }
}

/// Failures from [`DispatcherConfigBuilder::build`](crate::config::DispatcherConfigBuilder::build).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("uninstall_timeout_ms must be nonzero")]
    ZeroUninstallTimeout,
}
