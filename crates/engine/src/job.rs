//! The unit of work: metadata plus a small, closed set of lifecycle hooks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::params::Params;
use crate::persistence::PersistenceError;

/// A schedulable unit of work.
///
/// Only [`Job::params`] and [`Job::on_run`] are required. Hooks are invoked
/// on consumer threads (or the thread calling into the manager) and must not
/// block indefinitely.
pub trait Job: Send + Sync + 'static {
    /// Scheduling metadata, read once when the job is added.
    fn params(&self) -> Params;

    /// Perform the work. An `Err` (or a panic) is a failed run.
    fn on_run(&self) -> anyhow::Result<()>;

    /// Called exactly once, when the job is accepted by the manager.
    fn on_added(&self) {}

    /// Called when the job leaves the scheduler without completing.
    fn on_cancel(&self, _reason: CancelReason) {}

    /// Decide whether a failed run should be retried.
    ///
    /// Only consulted while the job still has retries left; `run_count`
    /// includes the run that just failed.
    fn should_re_run(&self, _error: &anyhow::Error, _run_count: u32, _retry_limit: u32) -> RetryDecision {
        RetryDecision::retry()
    }

    /// Durable encoding used for persistent jobs.
    ///
    /// Jobs that never set [`Params::persistent`] can keep the default.
    fn encode(&self) -> Result<JobPayload, PersistenceError> {
        Err(PersistenceError::NotEncodable(
            std::any::type_name::<Self>().to_string(),
        ))
    }
}

/// Outcome of a job's retry hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Give up; the job is cancelled.
    Cancel,
    /// Requeue the job.
    Retry {
        /// Overrides the configured backoff for this requeue.
        delay: Option<Duration>,
        /// Lowers the job's priority from the next run on. Values above the
        /// current priority are ignored; negative values become 0.
        priority: Option<i32>,
    },
}

impl RetryDecision {
    pub fn retry() -> Self {
        Self::Retry {
            delay: None,
            priority: None,
        }
    }

    pub fn cancel() -> Self {
        Self::Cancel
    }

    /// Set the requeue delay (no-op on `Cancel`).
    pub fn with_delay(self, delay: Duration) -> Self {
        match self {
            Self::Retry { priority, .. } => Self::Retry {
                delay: Some(delay),
                priority,
            },
            Self::Cancel => Self::Cancel,
        }
    }

    /// Set the requeue priority (no-op on `Cancel`). Only lowering takes
    /// effect.
    pub fn with_priority(self, priority: i32) -> Self {
        match self {
            Self::Retry { delay, .. } => Self::Retry {
                delay,
                priority: Some(priority),
            },
            Self::Cancel => Self::Cancel,
        }
    }
}

/// Why a job left the scheduler without completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// Matched a tag cancellation before it started running.
    CancelledByTags,
    /// Matched a tag cancellation while running, and the run failed.
    CancelledWhileRunning,
    /// The retry hook declined another attempt.
    RetryDeclined,
    /// Failed with no retries left.
    ReachedRetryLimit,
    /// `on_run` (or the retry hook) panicked.
    Panicked,
}

/// Cause of a failed run.
#[derive(Debug)]
pub enum JobFailure {
    Error(anyhow::Error),
    Panicked(String),
}

impl core::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            JobFailure::Error(e) => write!(f, "{e:#}"),
            JobFailure::Panicked(msg) => write!(f, "job panicked: {msg}"),
        }
    }
}

/// Serialized form of a persistent job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Registry key used to decode the job after a restart.
    pub kind: String,
    pub data: serde_json::Value,
}

impl JobPayload {
    pub fn encode<T: Serialize>(kind: impl Into<String>, job: &T) -> Result<Self, PersistenceError> {
        let data = serde_json::to_value(job)
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        Ok(Self {
            kind: kind.into(),
            data,
        })
    }
}

type Decoder = Box<dyn Fn(serde_json::Value) -> Result<Arc<dyn Job>, PersistenceError> + Send + Sync>;

/// Decoders for persistent job kinds.
///
/// Every kind a persistent job encodes itself as must be registered before
/// the manager is built, or its records are skipped at startup.
#[derive(Default)]
pub struct JobRegistry {
    decoders: HashMap<String, Decoder>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` as the decoder for `kind`.
    pub fn register<T>(&mut self, kind: impl Into<String>) -> &mut Self
    where
        T: Job + DeserializeOwned,
    {
        self.decoders.insert(
            kind.into(),
            Box::new(|data: serde_json::Value| {
                let job: T = serde_json::from_value(data)
                    .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
                Ok(Arc::new(job) as Arc<dyn Job>)
            }),
        );
        self
    }

    /// Builder-style [`JobRegistry::register`].
    pub fn with<T>(mut self, kind: impl Into<String>) -> Self
    where
        T: Job + DeserializeOwned,
    {
        self.register::<T>(kind);
        self
    }

    pub fn decode(&self, payload: &JobPayload) -> Result<Arc<dyn Job>, PersistenceError> {
        let decoder = self
            .decoders
            .get(&payload.kind)
            .ok_or_else(|| PersistenceError::UnknownKind(payload.kind.clone()))?;
        decoder(payload.data.clone())
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.decoders.contains_key(kind)
    }
}

impl core::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut kinds: Vec<_> = self.decoders.keys().collect();
        kinds.sort();
        f.debug_struct("JobRegistry").field("kinds", &kinds).finish()
    }
}

/// A job assembled from params and a closure.
///
/// Handy for jobs that never need to be persisted:
///
/// ```
/// use jobqueue_engine::{FnJob, Params};
///
/// let job = FnJob::new(Params::new(1).group_by("sync"), || {
///     // do the work
///     Ok(())
/// });
/// # let _ = job;
/// ```
pub struct FnJob<F> {
    params: Params,
    run: F,
}

impl<F> FnJob<F>
where
    F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
{
    pub fn new(params: Params, run: F) -> Self {
        Self { params, run }
    }
}

impl<F> Job for FnJob<F>
where
    F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn params(&self) -> Params {
        self.params.clone()
    }

    fn on_run(&self) -> anyhow::Result<()> {
        (self.run)()
    }
}
