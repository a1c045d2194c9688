use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use jobqueue_core::JobId;

use super::{PersistenceBackend, PersistenceError, sorted_by_sequence};
use crate::holder::JobRecord;

/// Single-file JSON backend.
///
/// The whole record set is rewritten on every mutation: serialized to a
/// sibling temp file, synced, then renamed over the target, so a crash leaves
/// either the old or the new snapshot on disk.
#[derive(Debug)]
pub struct FilePersistence {
    path: PathBuf,
    records: Mutex<BTreeMap<JobId, JobRecord>>,
}

impl FilePersistence {
    /// Open (or create on first write) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        let records = match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => {
                let list: Vec<JobRecord> = serde_json::from_slice(&bytes)
                    .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
                list.into_iter().map(|r| (r.id, r)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(PersistenceError::storage(e)),
        };
        tracing::debug!(path = %path.display(), records = records.len(), "opened job store");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_snapshot(&self, records: &BTreeMap<JobId, JobRecord>) -> Result<(), PersistenceError> {
        let list = sorted_by_sequence(records.values().cloned().collect());
        let bytes = serde_json::to_vec(&list)
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;

        let tmp = self.path.with_extension("tmp");
        let mut file = File::create(&tmp).map_err(PersistenceError::storage)?;
        file.write_all(&bytes).map_err(PersistenceError::storage)?;
        file.sync_all().map_err(PersistenceError::storage)?;
        fs::rename(&tmp, &self.path).map_err(PersistenceError::storage)?;
        Ok(())
    }

    /// Apply `change` to a copy of the records, persist it, then commit it to
    /// the cache. A failed write leaves the cache untouched.
    fn mutate(
        &self,
        change: impl FnOnce(&mut BTreeMap<JobId, JobRecord>),
    ) -> Result<(), PersistenceError> {
        let mut records = self.records.lock().map_err(|_| PersistenceError::Poisoned)?;
        let mut next = records.clone();
        change(&mut next);
        self.write_snapshot(&next)?;
        *records = next;
        Ok(())
    }
}

impl PersistenceBackend for FilePersistence {
    fn load_all(&self) -> Result<Vec<JobRecord>, PersistenceError> {
        let records = self.records.lock().map_err(|_| PersistenceError::Poisoned)?;
        Ok(sorted_by_sequence(records.values().cloned().collect()))
    }

    fn upsert(&self, record: &JobRecord) -> Result<(), PersistenceError> {
        self.mutate(|records| {
            records.insert(record.id, record.clone());
        })
    }

    fn remove(&self, id: &JobId) -> Result<(), PersistenceError> {
        {
            let records = self.records.lock().map_err(|_| PersistenceError::Poisoned)?;
            if !records.contains_key(id) {
                return Ok(());
            }
        }
        self.mutate(|records| {
            records.remove(id);
        })
    }

    fn count(&self) -> Result<usize, PersistenceError> {
        let records = self.records.lock().map_err(|_| PersistenceError::Poisoned)?;
        Ok(records.len())
    }

    fn flush(&self) -> Result<(), PersistenceError> {
        let records = self.records.lock().map_err(|_| PersistenceError::Poisoned)?;
        self.write_snapshot(&records)
    }
}
