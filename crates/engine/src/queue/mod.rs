//! Ordered stores of waiting job holders.
//!
//! A manager owns two queues: a [`MemoryQueue`] for transient jobs and a
//! [`PersistentQueue`] for jobs that must survive a restart. Both are only
//! touched from inside the manager's lock.

mod memory;
mod persistent;

pub use memory::MemoryQueue;
pub use persistent::{PersistentQueue, Recovery};

use jobqueue_core::{JobId, SessionId, Timestamp};

use crate::constraint::Constraints;
use crate::holder::{JobHolder, ReadyKey};
use crate::persistence::PersistenceError;
use crate::tags::{TagConstraint, TagQuery};

/// The best eligible holder of a queue, as reported by a peek.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Candidate {
    pub key: ReadyKey,
    pub id: JobId,
}

/// Queue abstraction.
pub trait JobQueue: Send + core::fmt::Debug {
    /// Insert a holder, replacing any holder with the same id.
    fn insert(&mut self, holder: JobHolder) -> Result<(), PersistenceError>;

    /// The highest-priority ready holder allowed by `constraints`, without
    /// removing it.
    fn peek_next_eligible(&mut self, constraints: &Constraints<'_>) -> Option<Candidate>;

    /// Claim a holder for `session`: it leaves the waiting set and its run
    /// count is incremented.
    fn take(&mut self, id: JobId, session: SessionId) -> Option<JobHolder>;

    /// Drop a waiting holder for good.
    fn remove(&mut self, id: JobId) -> Option<JobHolder>;

    /// Forget a holder that was taken and reached a terminal state.
    fn finish(&mut self, id: JobId);

    /// Waiting holders.
    fn count(&self) -> usize;

    /// Waiting holders that could run right now. Grouped holders count once
    /// per group.
    fn count_ready(&mut self, constraints: &Constraints<'_>) -> usize;

    /// Earliest instant a not-yet-ready holder becomes ready.
    fn next_ready_at(&self) -> Option<Timestamp>;

    fn find_by_tags(&self, constraint: TagConstraint, query: &TagQuery) -> Vec<JobId>;

    fn get(&self, id: JobId) -> Option<&JobHolder>;

    fn ids(&self) -> Vec<JobId>;

    /// Drop every waiting holder.
    fn clear(&mut self);
}
