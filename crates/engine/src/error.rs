//! Facade error model.

use thiserror::Error;

use crate::persistence::PersistenceError;

/// Result type returned by the job manager facade.
pub type JobQueueResult<T> = Result<T, JobQueueError>;

/// Structural failures surfaced to callers of the facade.
///
/// Failures of an individual job's run never show up here: they are resolved
/// by the retry state machine and reported through callbacks.
#[derive(Debug, Error)]
pub enum JobQueueError {
    /// Job params failed validation (caller misuse).
    #[error("invalid job params: {0}")]
    InvalidParams(String),

    /// A tag query was empty or contained an empty tag.
    #[error("invalid tag query: {0}")]
    InvalidTagQuery(String),

    /// Configuration invariant violated at construction.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A job asked to be persisted but has no durable encoding.
    #[error("job {0} is marked persistent but cannot be encoded")]
    NotPersistable(String),

    /// The persistence backend failed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// The manager was destroyed; no further work is accepted.
    #[error("job manager has been destroyed")]
    ManagerDestroyed,
}

impl JobQueueError {
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::InvalidParams(msg.into())
    }

    pub fn invalid_tag_query(msg: impl Into<String>) -> Self {
        Self::InvalidTagQuery(msg.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}
