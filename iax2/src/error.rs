//! Structured error types for the IAX2 transaction core.
//!
//! Like the message bus, the transaction's public surface is infallible —
//! `process_frame` returns an event or nothing, never `Result` — so these
//! types cover the narrower internal surfaces that do fail: wire decode and
//! socket I/O.

use thiserror::Error;

/// Failures decoding a frame or information-element list off the wire.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame shorter than the minimum header size ({min} bytes)")]
    TooShort { min: usize },

    #[error("unknown full-frame subclass {frame_type}/{subclass}")]
    UnknownSubclass { frame_type: u8, subclass: u8 },

    #[error("information element {ie_type} at offset {offset} declares length {declared} beyond remaining {remaining} bytes")]
    TruncatedIe {
        ie_type: u8,
        offset: usize,
        declared: usize,
        remaining: usize,
    },
}

impl FrameError {
    /// Malformed wire input is never recoverable by retrying the same bytes.
    pub fn is_recoverable(&self) -> bool {
        false
    }
}

/// Failures from the engine's socket or call-number allocation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no free call numbers available")]
    CallNumbersExhausted,

    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no transaction registered for call-number pair ({local}, {remote:?})")]
    UnknownTransaction { local: u16, remote: Option<u16> },
}

impl EngineError {
    /// Whether the same operation might succeed if retried shortly.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::CallNumbersExhausted)
    }

    /// Whether the error means the socket itself is no longer usable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Io(_))
    }
}

/// Failures from [`EngineConfigBuilder::build`](crate::config::EngineConfigBuilder::build).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("retrans_interval must be nonzero")]
    ZeroRetransInterval,

    #[error("transaction_timeout must be nonzero")]
    ZeroTransactionTimeout,

    #[error("max_in_frames must be nonzero")]
    ZeroMaxInFrames,
}
