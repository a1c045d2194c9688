//! Core error model.

use thiserror::Error;

use crate::clock::Timestamp;

/// Result type used by the core primitives.
pub type CoreResult<T> = Result<T, CoreError>;

/// Core-level error.
///
/// Keep this focused on deterministic failures of the primitives themselves.
/// Scheduling and persistence failures belong to the engine crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A time source reported a timestamp earlier than one it already returned.
    #[error("time source went backwards: {current} after {previous}")]
    ClockWentBackwards {
        previous: Timestamp,
        current: Timestamp,
    },
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
