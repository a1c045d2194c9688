use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use jobqueue_core::{JobId, SessionId, Timestamp};

use super::{Candidate, JobQueue, MemoryQueue};
use crate::constraint::Constraints;
use crate::holder::JobHolder;
use crate::job::JobRegistry;
use crate::persistence::{PersistenceBackend, PersistenceError};
use crate::tags::{TagConstraint, TagQuery};

/// Queue for persistent jobs.
///
/// Ordering is served from an in-memory index; every state change is written
/// through to the backend. A record leaves the backend only when its job
/// reaches a terminal state, so a crash mid-run leaves it recoverable.
#[derive(Debug)]
pub struct PersistentQueue {
    index: MemoryQueue,
    backend: Arc<dyn PersistenceBackend>,
}

/// Result of rebuilding a queue from its backend.
#[derive(Debug)]
pub struct Recovery {
    pub queue: PersistentQueue,
    /// First sequence number not used by any loaded holder.
    pub next_sequence: u64,
    /// Holders that were marked running by an earlier session.
    pub interrupted: usize,
    /// Records left in the backend because they could not be decoded.
    pub skipped: usize,
}

impl PersistentQueue {
    pub fn new(backend: Arc<dyn PersistenceBackend>) -> Self {
        Self {
            index: MemoryQueue::new(),
            backend,
        }
    }

    /// Rebuild the queue from `backend` for a fresh `session`.
    ///
    /// Holders left running by another session are reset to waiting with
    /// their run count intact.
    pub fn load(
        backend: Arc<dyn PersistenceBackend>,
        registry: &JobRegistry,
        session: SessionId,
    ) -> Result<Recovery, PersistenceError> {
        let records = guarded("load", || backend.load_all())?;
        let mut queue = Self::new(backend);
        let mut next_sequence = 0;
        let mut interrupted = 0;
        let mut skipped = 0;

        for record in records {
            let id = record.id;
            next_sequence = next_sequence.max(record.sequence.saturating_add(1));
            let mut holder = match JobHolder::from_record(record, registry) {
                Ok(holder) => holder,
                Err(e) => {
                    tracing::error!(job_id = %id, error = %e, "skipping undecodable persisted job");
                    skipped += 1;
                    continue;
                }
            };

            if holder.running_session().is_some_and(|s| s != session) {
                holder.reset_interrupted();
                interrupted += 1;
                queue.write(&holder);
            }
            queue.index.insert(holder)?;
        }

        Ok(Recovery {
            queue,
            next_sequence,
            interrupted,
            skipped,
        })
    }

    pub fn backend(&self) -> &Arc<dyn PersistenceBackend> {
        &self.backend
    }

    /// Best-effort write used on paths that cannot report an error.
    fn write(&self, holder: &JobHolder) {
        let record = holder.to_record();
        if let Err(e) = record.and_then(|r| guarded("upsert", || self.backend.upsert(&r))) {
            tracing::warn!(job_id = %holder.id(), error = %e, "failed to persist job state");
        }
    }

    fn erase(&self, id: JobId) {
        if let Err(e) = guarded("remove", || self.backend.remove(&id)) {
            tracing::warn!(job_id = %id, error = %e, "failed to remove persisted job");
        }
    }
}

/// A panicking backend call becomes a storage error; queue state never
/// depends on the backend unwinding cleanly.
fn guarded<T>(
    op: &str,
    call: impl FnOnce() -> Result<T, PersistenceError>,
) -> Result<T, PersistenceError> {
    catch_unwind(AssertUnwindSafe(call)).unwrap_or_else(|_| {
        Err(PersistenceError::storage(format!("backend panicked during {op}")))
    })
}

impl JobQueue for PersistentQueue {
    /// The holder is indexed even when the backend write fails; callers that
    /// must not keep an unpersisted holder remove it again.
    fn insert(&mut self, holder: JobHolder) -> Result<(), PersistenceError> {
        let written = holder
            .to_record()
            .and_then(|r| guarded("upsert", || self.backend.upsert(&r)));
        self.index.insert(holder)?;
        written
    }

    fn peek_next_eligible(&mut self, constraints: &Constraints<'_>) -> Option<Candidate> {
        self.index.peek_next_eligible(constraints)
    }

    fn take(&mut self, id: JobId, session: SessionId) -> Option<JobHolder> {
        let holder = self.index.take(id, session)?;
        self.write(&holder);
        Some(holder)
    }

    fn remove(&mut self, id: JobId) -> Option<JobHolder> {
        let holder = self.index.remove(id);
        self.erase(id);
        holder
    }

    fn finish(&mut self, id: JobId) {
        self.erase(id);
    }

    fn count(&self) -> usize {
        self.index.count()
    }

    fn count_ready(&mut self, constraints: &Constraints<'_>) -> usize {
        self.index.count_ready(constraints)
    }

    fn next_ready_at(&self) -> Option<Timestamp> {
        self.index.next_ready_at()
    }

    fn find_by_tags(&self, constraint: TagConstraint, query: &TagQuery) -> Vec<JobId> {
        self.index.find_by_tags(constraint, query)
    }

    fn get(&self, id: JobId) -> Option<&JobHolder> {
        self.index.get(id)
    }

    fn ids(&self) -> Vec<JobId> {
        self.index.ids()
    }

    fn clear(&mut self) {
        for id in self.index.ids() {
            self.erase(id);
        }
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobPayload};
    use crate::params::Params;
    use crate::persistence::InMemoryPersistence;
    use serde::{Deserialize, Serialize};
    use std::collections::HashSet;

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl Job for Ping {
        fn params(&self) -> Params {
            Params::new(1).persist()
        }

        fn on_run(&self) -> anyhow::Result<()> {
            Ok(())
        }

        fn encode(&self) -> Result<JobPayload, PersistenceError> {
            JobPayload::encode("ping", self)
        }
    }

    fn ping(n: u32, sequence: u64) -> JobHolder {
        let job = Ping { n };
        let payload = job.encode().unwrap();
        let params = job.params();
        JobHolder::new(Arc::new(job), &params, Timestamp::from_nanos(n.into()), sequence)
            .with_payload(payload)
    }

    fn everything<'a>(groups: &'a HashSet<String>, held: &'a HashSet<JobId>) -> Constraints<'a> {
        Constraints {
            now: Timestamp::from_nanos(u64::MAX),
            network_available: true,
            running_groups: groups,
            held_back: held,
        }
    }

    #[test]
    fn writes_through_and_finishes() {
        let backend = InMemoryPersistence::new();
        let mut queue = PersistentQueue::new(Arc::new(backend.clone()));
        let h = ping(1, 0);
        let id = h.id();

        queue.insert(h).unwrap();
        assert_eq!(backend.count().unwrap(), 1);

        let session = SessionId::new();
        let taken = queue.take(id, session).unwrap();
        assert_eq!(taken.run_count(), 1);
        assert_eq!(queue.count(), 0);
        assert_eq!(backend.get(&id).unwrap().running_session, Some(session));

        queue.finish(id);
        assert_eq!(backend.count().unwrap(), 0);
    }

    #[test]
    fn load_resets_interrupted_holders() {
        let backend = InMemoryPersistence::new();
        let dead_session = SessionId::new();
        let first_id;
        {
            let mut queue = PersistentQueue::new(Arc::new(backend.clone()));
            let first = ping(1, 4);
            first_id = first.id();
            queue.insert(first).unwrap();
            queue.insert(ping(2, 7)).unwrap();
            queue.take(first_id, dead_session).unwrap();
        }

        let registry = JobRegistry::new().with::<Ping>("ping");
        let fresh = SessionId::new();
        let recovery = PersistentQueue::load(Arc::new(backend.clone()), &registry, fresh).unwrap();

        assert_eq!(recovery.next_sequence, 8);
        assert_eq!(recovery.interrupted, 1);
        assert_eq!(recovery.skipped, 0);
        assert_eq!(recovery.queue.count(), 2);

        let restored = recovery.queue.get(first_id).unwrap();
        assert_eq!(restored.run_count(), 1);
        assert_eq!(restored.running_session(), None);
        assert_eq!(backend.get(&first_id).unwrap().running_session, None);
    }

    #[test]
    fn undecodable_records_stay_in_backend() {
        let backend = InMemoryPersistence::new();
        {
            let mut queue = PersistentQueue::new(Arc::new(backend.clone()));
            queue.insert(ping(1, 0)).unwrap();
        }

        let recovery =
            PersistentQueue::load(Arc::new(backend.clone()), &JobRegistry::new(), SessionId::new())
                .unwrap();

        assert_eq!(recovery.skipped, 1);
        assert_eq!(recovery.queue.count(), 0);
        assert_eq!(backend.count().unwrap(), 1);
    }

    #[test]
    fn failed_write_is_reported_but_indexed() {
        let backend = InMemoryPersistence::new();
        backend.set_fail_writes(true);
        let mut queue = PersistentQueue::new(Arc::new(backend.clone()));

        assert!(queue.insert(ping(1, 0)).is_err());
        assert_eq!(queue.count(), 1);

        let groups = HashSet::new();
        let held = HashSet::new();
        assert!(queue.peek_next_eligible(&everything(&groups, &held)).is_some());
    }

    /// Lets the first `healthy` upserts through, then panics.
    #[derive(Debug)]
    struct Crashing {
        inner: InMemoryPersistence,
        healthy: std::sync::atomic::AtomicUsize,
    }

    impl PersistenceBackend for Crashing {
        fn load_all(&self) -> Result<Vec<crate::holder::JobRecord>, PersistenceError> {
            self.inner.load_all()
        }

        fn upsert(&self, record: &crate::holder::JobRecord) -> Result<(), PersistenceError> {
            let left = self.healthy.load(std::sync::atomic::Ordering::SeqCst);
            if left == 0 {
                panic!("disk on fire");
            }
            self.healthy.store(left - 1, std::sync::atomic::Ordering::SeqCst);
            self.inner.upsert(record)
        }

        fn remove(&self, id: &JobId) -> Result<(), PersistenceError> {
            self.inner.remove(id)
        }

        fn count(&self) -> Result<usize, PersistenceError> {
            self.inner.count()
        }
    }

    #[test]
    fn backend_panic_on_take_still_hands_out_the_holder() {
        let backend = Crashing {
            inner: InMemoryPersistence::new(),
            healthy: 1.into(),
        };
        let mut queue = PersistentQueue::new(Arc::new(backend));
        let h = ping(1, 0);
        let id = h.id();
        queue.insert(h).unwrap();

        let taken = queue.take(id, SessionId::new()).unwrap();
        assert_eq!(taken.id(), id);
        assert_eq!(queue.count(), 0);

        assert!(matches!(
            queue.insert(ping(2, 1)),
            Err(PersistenceError::Storage(msg)) if msg.contains("upsert")
        ));
    }

    #[test]
    fn clear_empties_backend() {
        let backend = InMemoryPersistence::new();
        let mut queue = PersistentQueue::new(Arc::new(backend.clone()));
        queue.insert(ping(1, 0)).unwrap();
        queue.insert(ping(2, 1)).unwrap();

        queue.clear();

        assert_eq!(queue.count(), 0);
        assert_eq!(backend.count().unwrap(), 0);
    }
}
