//! The job manager facade and its coordination state.

use std::cell::Cell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};

use jobqueue_core::{JobId, SessionId, Timestamp};
use tracing::{debug, info, warn};

use crate::callback::{CallbackRegistry, JobCallback, JobEvent};
use crate::config::Configuration;
use crate::connectivity::ConnectivityListener;
use crate::constraint::Constraints;
use crate::error::{JobQueueError, JobQueueResult};
use crate::executor;
use crate::holder::{JobHolder, JobStatus};
use crate::job::{CancelReason, Job};
use crate::persistence::PersistenceError;
use crate::queue::{JobQueue, MemoryQueue, PersistentQueue};
use crate::tags::{TagConstraint, TagQuery};

thread_local! {
    static CONSUMER_OF: Cell<Option<SessionId>> = const { Cell::new(None) };
}

pub(crate) fn mark_consumer_thread(session: SessionId) {
    CONSUMER_OF.with(|c| c.set(Some(session)));
}

fn is_consumer_thread(session: SessionId) -> bool {
    CONSUMER_OF.with(Cell::get) == Some(session)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Running,
    Stopped,
    Destroyed,
}

#[derive(Debug)]
pub(crate) struct RunningJob {
    pub(crate) tags: BTreeSet<String>,
    pub(crate) cancel_requested: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Pool {
    pub(crate) workers: usize,
    pub(crate) idle: usize,
    pub(crate) next_worker_id: u64,
    pub(crate) handles: Vec<JoinHandle<()>>,
}

/// Everything guarded by the manager lock.
#[derive(Debug)]
pub(crate) struct State {
    memory: MemoryQueue,
    durable: PersistentQueue,
    pub(crate) running: HashMap<JobId, RunningJob>,
    pub(crate) running_groups: HashSet<String>,
    /// Added jobs whose `added` notifications are still being delivered.
    announcing: HashSet<JobId>,
    /// Announcing jobs matched by a tag cancellation; removed and cancelled
    /// once their announcement ends.
    pending_cancel: HashSet<JobId>,
    next_sequence: u64,
    pub(crate) pool: Pool,
    pub(crate) lifecycle: Lifecycle,
}

impl State {
    pub(crate) fn queue_mut(&mut self, persistent: bool) -> &mut dyn JobQueue {
        if persistent {
            &mut self.durable
        } else {
            &mut self.memory
        }
    }

    fn queue(&self, persistent: bool) -> &dyn JobQueue {
        if persistent { &self.durable } else { &self.memory }
    }

    /// Claim the best eligible holder across both queues and occupy its
    /// group slot.
    pub(crate) fn claim_next(
        &mut self,
        now: Timestamp,
        network_available: bool,
        session: SessionId,
    ) -> Option<JobHolder> {
        let constraints = Constraints {
            now,
            network_available,
            running_groups: &self.running_groups,
            held_back: &self.announcing,
        };
        let transient = self.memory.peek_next_eligible(&constraints);
        let durable = self.durable.peek_next_eligible(&constraints);

        let holder = match (transient, durable) {
            (Some(t), Some(d)) if d < t => self.durable.take(d.id, session),
            (Some(t), _) => self.memory.take(t.id, session),
            (None, Some(d)) => self.durable.take(d.id, session),
            (None, None) => None,
        }?;

        if let Some(group) = holder.group_id() {
            self.running_groups.insert(group.to_string());
        }
        self.running.insert(
            holder.id(),
            RunningJob {
                tags: holder.tags().clone(),
                cancel_requested: false,
            },
        );
        Some(holder)
    }

    /// Free the group slot and running entry of a finished run.
    pub(crate) fn release(&mut self, id: JobId, group: Option<&str>) {
        self.running.remove(&id);
        if let Some(group) = group {
            self.running_groups.remove(group);
        }
    }

    pub(crate) fn count_ready(&mut self, now: Timestamp, network_available: bool) -> usize {
        let constraints = Constraints {
            now,
            network_available,
            running_groups: &self.running_groups,
            held_back: &self.announcing,
        };
        self.memory.count_ready(&constraints) + self.durable.count_ready(&constraints)
    }

    pub(crate) fn waiting(&self) -> usize {
        self.memory.count() + self.durable.count()
    }

    pub(crate) fn next_ready_at(&self) -> Option<Timestamp> {
        match (self.memory.next_ready_at(), self.durable.next_ready_at()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn status(&self, id: JobId, now: Timestamp, network_available: bool) -> JobStatus {
        if self.running.contains_key(&id) {
            return JobStatus::Running;
        }
        let holder = match self.memory.get(id).or_else(|| self.durable.get(id)) {
            Some(holder) => holder,
            None => return JobStatus::Unknown,
        };
        let constraints = Constraints {
            now,
            network_available,
            running_groups: &self.running_groups,
            held_back: &self.announcing,
        };
        if constraints.is_ready(holder) {
            JobStatus::WaitingReady
        } else {
            JobStatus::WaitingNotReady
        }
    }
}

/// State shared between the facade and its consumer threads.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) config: Configuration,
    pub(crate) session: SessionId,
    pub(crate) state: Mutex<State>,
    /// Signalled whenever a consumer may find new work.
    pub(crate) work_available: Condvar,
    /// Signalled whenever a consumer exits.
    pub(crate) consumers_changed: Condvar,
    pub(crate) callbacks: CallbackRegistry,
}

impl Shared {
    /// A panic elsewhere must not wedge the manager, so poisoning is ignored.
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn now(&self) -> Timestamp {
        self.config.clock().now()
    }

    pub(crate) fn network_available(&self) -> bool {
        self.config.connectivity().is_connected()
    }
}

/// Outcome of [`JobManager::cancel_by_tags`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CancelResult {
    /// Waiting jobs removed and cancelled.
    pub cancelled: Vec<JobId>,
    /// Running jobs marked for cancellation; they are resolved when their
    /// current run ends.
    pub deferred: Vec<JobId>,
}

/// Embeddable background job scheduler.
///
/// Dropping the manager stops its consumers after their current job without
/// waiting for them; call [`JobManager::destroy`] to wait.
pub struct JobManager {
    shared: Arc<Shared>,
    push_subscribed: bool,
}

impl JobManager {
    /// Build a manager, restoring persisted jobs from the configured backend.
    ///
    /// Jobs left running by an earlier session are reset to waiting with
    /// their run counts intact.
    pub fn new(config: Configuration) -> JobQueueResult<Self> {
        let session = SessionId::new();
        let recovery =
            PersistentQueue::load(Arc::clone(config.persistence()), config.registry(), session)?;
        info!(
            manager = %config.id(),
            session = %session,
            restored = recovery.queue.count(),
            interrupted = recovery.interrupted,
            skipped = recovery.skipped,
            "job manager started"
        );

        let state = State {
            memory: MemoryQueue::new(),
            durable: recovery.queue,
            running: HashMap::new(),
            running_groups: HashSet::new(),
            announcing: HashSet::new(),
            pending_cancel: HashSet::new(),
            next_sequence: recovery.next_sequence,
            pool: Pool::default(),
            lifecycle: Lifecycle::Running,
        };
        let shared = Arc::new(Shared {
            config,
            session,
            state: Mutex::new(state),
            work_available: Condvar::new(),
            consumers_changed: Condvar::new(),
            callbacks: CallbackRegistry::new(),
        });

        let wakeup: Arc<dyn ConnectivityListener> = Arc::new(NetworkWakeup {
            shared: Arc::downgrade(&shared),
        });
        let push_subscribed = shared.config.connectivity().set_listener(Some(wakeup));

        {
            let mut state = shared.lock_state();
            executor::ensure_consumers(&shared, &mut state);
        }

        Ok(Self {
            shared,
            push_subscribed,
        })
    }

    /// Schedule a job. Returns its id.
    pub fn add<J: Job>(&self, job: J) -> JobQueueResult<JobId> {
        self.add_arc(Arc::new(job))
    }

    pub fn add_arc(&self, job: Arc<dyn Job>) -> JobQueueResult<JobId> {
        let params = job.params();
        params.validate()?;
        let payload = if params.persistent {
            Some(job.encode().map_err(|e| match e {
                PersistenceError::NotEncodable(name) => JobQueueError::NotPersistable(name),
                other => JobQueueError::Persistence(other),
            })?)
        } else {
            None
        };

        let holder = {
            let mut state = self.shared.lock_state();
            if state.lifecycle == Lifecycle::Destroyed {
                return Err(JobQueueError::ManagerDestroyed);
            }
            let sequence = state.next_sequence;
            state.next_sequence += 1;

            let mut holder = JobHolder::new(Arc::clone(&job), &params, self.shared.now(), sequence);
            if let Some(payload) = payload {
                holder = holder.with_payload(payload);
            }
            let id = holder.id();

            if let Err(e) = state.queue_mut(params.persistent).insert(holder.clone()) {
                state.queue_mut(params.persistent).remove(id);
                return Err(e.into());
            }
            state.announcing.insert(id);
            holder
        };
        let id = holder.id();

        if catch_unwind(AssertUnwindSafe(|| job.on_added())).is_err() {
            warn!(job_id = %id, "on_added panicked");
        }
        self.shared.callbacks.dispatch(&JobEvent::Added(&holder));

        let cancelled = {
            let mut state = self.shared.lock_state();
            state.announcing.remove(&id);
            let cancelled = if state.pending_cancel.remove(&id) {
                state.queue_mut(params.persistent).remove(id)
            } else {
                None
            };
            if cancelled.is_none() {
                self.shared.work_available.notify_all();
                executor::ensure_consumers(&self.shared, &mut state);
            }
            cancelled
        };
        debug!(
            manager = %self.shared.config.id(),
            job_id = %id,
            priority = holder.priority(),
            group = ?holder.group_id(),
            persistent = holder.is_persistent(),
            cancelled = cancelled.is_some(),
            "job added"
        );
        if let Some(holder) = cancelled {
            self.notify_cancelled(&holder, CancelReason::CancelledByTags);
        }
        Ok(id)
    }

    fn notify_cancelled(&self, holder: &JobHolder, reason: CancelReason) {
        if catch_unwind(AssertUnwindSafe(|| holder.job().on_cancel(reason))).is_err() {
            warn!(job_id = %holder.id(), "on_cancel panicked");
        }
        self.shared
            .callbacks
            .dispatch(&JobEvent::Cancelled(holder, reason, None));
    }

    /// Cancel every job whose tags satisfy `constraint` against `tags`.
    ///
    /// Waiting jobs are removed and cancelled immediately. Running jobs are
    /// only marked: they are not interrupted, will not be retried, and are
    /// cancelled if their current run fails. Jobs whose `add` is still
    /// delivering its `added` notifications are cancelled as soon as that
    /// finishes, before they can run; they are reported as deferred.
    pub fn cancel_by_tags<I, T>(&self, constraint: TagConstraint, tags: I) -> JobQueueResult<CancelResult>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let query = TagQuery::new(tags)?;
        let mut removed = Vec::new();
        let mut deferred = Vec::new();
        {
            let mut state = self.shared.lock_state();
            for persistent in [false, true] {
                let matched = state.queue(persistent).find_by_tags(constraint, &query);
                for id in matched {
                    if state.announcing.contains(&id) {
                        if state.pending_cancel.insert(id) {
                            deferred.push(id);
                        }
                        continue;
                    }
                    if let Some(holder) = state.queue_mut(persistent).remove(id) {
                        removed.push(holder);
                    }
                }
            }
            for (id, running) in state.running.iter_mut() {
                if !running.cancel_requested && constraint.matches(&query, &running.tags) {
                    running.cancel_requested = true;
                    deferred.push(*id);
                }
            }
            deferred.sort();
        }

        for holder in &removed {
            self.notify_cancelled(holder, CancelReason::CancelledByTags);
        }

        info!(
            manager = %self.shared.config.id(),
            tags = ?query.tags(),
            constraint = ?constraint,
            cancelled = removed.len(),
            deferred = deferred.len(),
            "cancelled jobs by tags"
        );
        Ok(CancelResult {
            cancelled: removed.iter().map(JobHolder::id).collect(),
            deferred,
        })
    }

    pub fn add_callback(&self, callback: Arc<dyn JobCallback>) {
        self.shared.callbacks.add(callback);
    }

    /// Returns whether the callback was registered.
    pub fn remove_callback(&self, callback: &Arc<dyn JobCallback>) -> bool {
        self.shared.callbacks.remove(callback)
    }

    /// Jobs known to the manager: waiting plus running.
    pub fn count(&self) -> usize {
        let state = self.shared.lock_state();
        state.waiting() + state.running.len()
    }

    /// Waiting jobs that could start right now. Jobs sharing a group count
    /// once.
    pub fn count_ready(&self) -> usize {
        let mut state = self.shared.lock_state();
        let (now, network) = (self.shared.now(), self.shared.network_available());
        state.count_ready(now, network)
    }

    pub fn job_status(&self, id: JobId) -> JobStatus {
        let state = self.shared.lock_state();
        state.status(id, self.shared.now(), self.shared.network_available())
    }

    /// Groups that currently have a running job, sorted.
    pub fn active_groups(&self) -> Vec<String> {
        let state = self.shared.lock_state();
        let mut groups: Vec<String> = state.running_groups.iter().cloned().collect();
        groups.sort();
        groups
    }

    pub fn active_consumer_count(&self) -> usize {
        self.shared.lock_state().pool.workers
    }

    /// Identifies this manager instance in persisted running markers.
    pub fn session_id(&self) -> SessionId {
        self.shared.session
    }

    pub fn config(&self) -> &Configuration {
        &self.shared.config
    }

    /// Pause consumption. Running jobs finish; waiting jobs stay queued and
    /// `add` keeps accepting work.
    pub fn stop(&self) -> JobQueueResult<()> {
        let mut state = self.shared.lock_state();
        match state.lifecycle {
            Lifecycle::Destroyed => Err(JobQueueError::ManagerDestroyed),
            _ => {
                state.lifecycle = Lifecycle::Stopped;
                info!(manager = %self.shared.config.id(), "job manager stopped");
                Ok(())
            }
        }
    }

    /// Resume consumption after [`JobManager::stop`].
    pub fn start(&self) -> JobQueueResult<()> {
        let mut state = self.shared.lock_state();
        match state.lifecycle {
            Lifecycle::Destroyed => Err(JobQueueError::ManagerDestroyed),
            _ => {
                state.lifecycle = Lifecycle::Running;
                self.shared.work_available.notify_all();
                executor::ensure_consumers(&self.shared, &mut state);
                info!(manager = %self.shared.config.id(), "job manager started consuming");
                Ok(())
            }
        }
    }

    /// Drop every waiting job without notifying anyone. Running jobs are
    /// unaffected.
    pub fn clear(&self) {
        let mut state = self.shared.lock_state();
        let dropped = state.waiting();
        state.memory.clear();
        state.durable.clear();
        state.pending_cancel.clear();
        info!(manager = %self.shared.config.id(), dropped, "cleared waiting jobs");
    }

    /// Stop accepting work, wait for running jobs to finish, and flush the
    /// persistence backend. Idempotent.
    ///
    /// Called from inside a job of this manager, it waits for every other
    /// consumer but not its own.
    pub fn destroy(&self) -> JobQueueResult<()> {
        let handles = {
            let mut state = self.shared.lock_state();
            if state.lifecycle == Lifecycle::Destroyed {
                return Ok(());
            }
            state.lifecycle = Lifecycle::Destroyed;
            self.shared.work_available.notify_all();
            info!(
                manager = %self.shared.config.id(),
                running = state.running.len(),
                "destroying job manager"
            );

            let floor = usize::from(is_consumer_thread(self.shared.session));
            while state.pool.workers > floor {
                state = self
                    .shared
                    .consumers_changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            std::mem::take(&mut state.pool.handles)
        };

        if self.push_subscribed {
            self.shared.config.connectivity().set_listener(None);
        }

        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }

        self.shared.config.persistence().flush()?;
        info!(manager = %self.shared.config.id(), "job manager destroyed");
        Ok(())
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        let mut state = self.shared.lock_state();
        if state.lifecycle == Lifecycle::Destroyed {
            return;
        }
        state.lifecycle = Lifecycle::Destroyed;
        self.shared.work_available.notify_all();
        drop(state);
        if self.push_subscribed {
            self.shared.config.connectivity().set_listener(None);
        }
    }
}

impl core::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobManager")
            .field("id", &self.shared.config.id())
            .field("session", &self.shared.session)
            .field("push_subscribed", &self.push_subscribed)
            .finish_non_exhaustive()
    }
}

/// Wakes consumers as soon as connectivity returns.
struct NetworkWakeup {
    shared: Weak<Shared>,
}

impl ConnectivityListener for NetworkWakeup {
    fn on_network_change(&self, connected: bool) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        debug!(manager = %shared.config.id(), connected, "network change");
        if connected {
            let mut state = shared.lock_state();
            shared.work_available.notify_all();
            executor::ensure_consumers(&shared, &mut state);
        }
    }
}
