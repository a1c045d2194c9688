use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use jobqueue_core::JobId;

use super::{PersistenceBackend, PersistenceError, sorted_by_sequence};
use crate::holder::JobRecord;

/// In-memory backend for tests/dev.
///
/// Clones share storage, so a test can keep a handle, destroy one manager and
/// build another on the same records to simulate a restart.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPersistence {
    records: Arc<RwLock<BTreeMap<JobId, JobRecord>>>,
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make every subsequent write fail with a storage error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    /// Read a single record, bypassing the scheduler.
    pub fn get(&self, id: &JobId) -> Option<JobRecord> {
        self.records.read().ok()?.get(id).cloned()
    }

    fn check_writable(&self) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(PersistenceError::Storage("writes disabled".to_string()));
        }
        Ok(())
    }
}

impl PersistenceBackend for InMemoryPersistence {
    fn load_all(&self) -> Result<Vec<JobRecord>, PersistenceError> {
        let records = self.records.read().map_err(|_| PersistenceError::Poisoned)?;
        Ok(sorted_by_sequence(records.values().cloned().collect()))
    }

    fn upsert(&self, record: &JobRecord) -> Result<(), PersistenceError> {
        self.check_writable()?;
        let mut records = self.records.write().map_err(|_| PersistenceError::Poisoned)?;
        records.insert(record.id, record.clone());
        Ok(())
    }

    fn remove(&self, id: &JobId) -> Result<(), PersistenceError> {
        self.check_writable()?;
        let mut records = self.records.write().map_err(|_| PersistenceError::Poisoned)?;
        records.remove(id);
        Ok(())
    }

    fn count(&self) -> Result<usize, PersistenceError> {
        let records = self.records.read().map_err(|_| PersistenceError::Poisoned)?;
        Ok(records.len())
    }
}
