//! Immutable job metadata.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::JobQueueError;

/// Retry limit applied when a job does not declare its own.
pub const DEFAULT_RETRY_LIMIT: u32 = 20;

/// Scheduling metadata declared by a job.
///
/// Built with chained setters:
///
/// ```
/// use std::time::Duration;
/// use jobqueue_engine::Params;
///
/// let params = Params::new(10)
///     .group_by("uploads")
///     .add_tags(["media", "user:42"])
///     .delay_in(Duration::from_secs(5))
///     .persist()
///     .require_network();
///
/// assert!(params.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Params {
    /// Higher runs first.
    pub priority: i32,
    /// Jobs sharing a group never run concurrently.
    pub group_id: Option<String>,
    pub tags: BTreeSet<String>,
    /// Initial delay before the job becomes ready.
    pub delay: Option<Duration>,
    /// Survive process restarts (requires an encodable job).
    pub persistent: bool,
    /// Only run while connectivity is available.
    pub requires_network: bool,
    /// Number of retries allowed after the first run.
    pub retry_limit: u32,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            priority: 0,
            group_id: None,
            tags: BTreeSet::new(),
            delay: None,
            persistent: false,
            requires_network: false,
            retry_limit: DEFAULT_RETRY_LIMIT,
        }
    }
}

impl Params {
    pub fn new(priority: i32) -> Self {
        Self {
            priority,
            ..Default::default()
        }
    }

    pub fn group_by(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn add_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn delay_in(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn persist(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn require_network(mut self) -> Self {
        self.requires_network = true;
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// Reject metadata the scheduler cannot honour.
    pub fn validate(&self) -> Result<(), JobQueueError> {
        if self.priority < 0 {
            return Err(JobQueueError::invalid_params(format!(
                "priority must not be negative (got {})",
                self.priority
            )));
        }
        if self.group_id.as_deref().is_some_and(str::is_empty) {
            return Err(JobQueueError::invalid_params("group id must not be empty"));
        }
        if self.tags.iter().any(String::is_empty) {
            return Err(JobQueueError::invalid_params("tags must not be empty strings"));
        }
        Ok(())
    }
}
