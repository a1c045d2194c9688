//! Embeddable background job scheduler.
//!
//! Jobs carry a priority, optional group, tags, initial delay, a network
//! requirement and a persistence flag. A [`JobManager`] keeps them in two
//! ordered queues (transient and persistent), hands the best eligible one to
//! a bounded pool of consumer threads, retries failures with backoff, and
//! restores persistent jobs after a restart.
//!
//! ```no_run
//! use jobqueue_engine::{Configuration, FnJob, JobManager, Params, TagConstraint};
//!
//! # fn main() -> Result<(), jobqueue_engine::JobQueueError> {
//! let manager = JobManager::new(Configuration::builder().with_id("uploads").build()?)?;
//!
//! manager.add(FnJob::new(Params::new(5).group_by("photos").add_tags(["user:7"]), || {
//!     // upload one photo
//!     Ok(())
//! }))?;
//!
//! manager.cancel_by_tags(TagConstraint::Any, ["user:7"])?;
//! manager.destroy()?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod callback;
pub mod config;
pub mod connectivity;
pub mod constraint;
pub mod error;
mod executor;
pub mod holder;
pub mod job;
pub mod manager;
pub mod params;
pub mod persistence;
pub mod queue;
pub mod tags;

pub use backoff::{BackoffPolicy, BackoffStrategy};
pub use callback::{CallbackRegistry, JobCallback};
pub use config::{Configuration, ConfigurationBuilder};
pub use connectivity::{AlwaysConnected, ConnectivityListener, ConnectivitySource, ManualConnectivity};
pub use constraint::Constraints;
pub use error::{JobQueueError, JobQueueResult};
pub use holder::{JobHolder, JobRecord, JobStatus, ReadyKey};
pub use job::{CancelReason, FnJob, Job, JobFailure, JobPayload, JobRegistry, RetryDecision};
pub use manager::{CancelResult, JobManager};
pub use params::{DEFAULT_RETRY_LIMIT, Params};
pub use persistence::{FilePersistence, InMemoryPersistence, PersistenceBackend, PersistenceError};
pub use queue::{Candidate, JobQueue, MemoryQueue, PersistentQueue, Recovery};
pub use tags::{TagConstraint, TagQuery};

pub use jobqueue_core::{JobId, MockClock, SessionId, SystemClock, TimeSource, Timestamp};
