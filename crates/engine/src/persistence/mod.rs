//! Durable storage for persistent jobs.
//!
//! Backends only store [`JobRecord`]s; ordering and eligibility live in the
//! in-memory queue index built on top of them.

mod file;
mod in_memory;

pub use file::FilePersistence;
pub use in_memory::InMemoryPersistence;

use jobqueue_core::JobId;

use crate::holder::JobRecord;

/// Persistence backend abstraction.
pub trait PersistenceBackend: Send + Sync + core::fmt::Debug {
    /// Every stored record, ordered by insertion sequence.
    fn load_all(&self) -> Result<Vec<JobRecord>, PersistenceError>;

    /// Insert or replace the record with the same id.
    fn upsert(&self, record: &JobRecord) -> Result<(), PersistenceError>;

    /// Remove a record. Removing an unknown id is not an error.
    fn remove(&self, id: &JobId) -> Result<(), PersistenceError>;

    fn count(&self) -> Result<usize, PersistenceError>;

    /// Push buffered writes to stable storage.
    fn flush(&self) -> Result<(), PersistenceError> {
        Ok(())
    }
}

/// Persistence error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("no decoder registered for job kind {0:?}")]
    UnknownKind(String),
    #[error("job {0} has no durable encoding")]
    NotEncodable(String),
    #[error("persistence lock poisoned")]
    Poisoned,
}

impl PersistenceError {
    pub fn storage(err: impl core::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }
}

fn sorted_by_sequence(mut records: Vec<JobRecord>) -> Vec<JobRecord> {
    records.sort_by_key(|r| (r.sequence, r.id));
    records
}

#[cfg(test)]
pub(crate) fn sample_record(sequence: u64) -> JobRecord {
    use jobqueue_core::Timestamp;

    JobRecord {
        id: JobId::new(),
        priority: 1,
        group_id: None,
        tags: std::collections::BTreeSet::new(),
        requires_network: false,
        retry_limit: 3,
        created_at: Timestamp::from_nanos(sequence),
        ready_at: Timestamp::from_nanos(sequence),
        seniority: Timestamp::from_nanos(sequence),
        sequence,
        run_count: 0,
        running_session: None,
        payload: crate::job::JobPayload {
            kind: "noop".to_string(),
            data: serde_json::Value::Null,
        },
    }
}
