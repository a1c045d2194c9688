//! Scheduling envelope around a job.

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::sync::Arc;

use jobqueue_core::{JobId, SessionId, Timestamp};
use serde::{Deserialize, Serialize};

use crate::job::{Job, JobPayload, JobRegistry};
use crate::params::Params;
use crate::persistence::PersistenceError;

/// Externally visible state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// Queued, but blocked by its delay, backoff, connectivity or group.
    WaitingNotReady,
    /// Queued and eligible for the next free consumer.
    WaitingReady,
    Running,
    /// Not known to this manager (finished, cancelled, or never added).
    Unknown,
}

/// Ordering key of a ready holder: priority descending, then seniority and
/// insertion sequence ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReadyKey {
    priority: Reverse<i32>,
    seniority: Timestamp,
    sequence: u64,
}

/// A job plus the runtime state the scheduler keeps about it.
///
/// Cloning is cheap: the job itself is shared.
#[derive(Clone)]
pub struct JobHolder {
    id: JobId,
    job: Arc<dyn Job>,
    payload: Option<JobPayload>,
    priority: i32,
    group_id: Option<String>,
    tags: BTreeSet<String>,
    persistent: bool,
    requires_network: bool,
    retry_limit: u32,
    created_at: Timestamp,
    ready_at: Timestamp,
    seniority: Timestamp,
    sequence: u64,
    run_count: u32,
    running_session: Option<SessionId>,
}

impl JobHolder {
    /// Wrap a freshly added job.
    ///
    /// `sequence` must be unique per manager; it breaks ties between holders
    /// created at the same instant.
    pub fn new(job: Arc<dyn Job>, params: &Params, now: Timestamp, sequence: u64) -> Self {
        let ready_at = match params.delay {
            Some(delay) => now.saturating_add(delay),
            None => now,
        };
        Self {
            id: JobId::new(),
            job,
            payload: None,
            priority: params.priority,
            group_id: params.group_id.clone(),
            tags: params.tags.clone(),
            persistent: params.persistent,
            requires_network: params.requires_network,
            retry_limit: params.retry_limit,
            created_at: now,
            ready_at,
            seniority: now,
            sequence,
            run_count: 0,
            running_session: None,
        }
    }

    /// Attach the durable encoding of the job.
    pub fn with_payload(mut self, payload: JobPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Rebuild a holder from its persisted record.
    pub fn from_record(record: JobRecord, registry: &JobRegistry) -> Result<Self, PersistenceError> {
        let job = registry.decode(&record.payload)?;
        Ok(Self {
            id: record.id,
            job,
            payload: Some(record.payload),
            priority: record.priority,
            group_id: record.group_id,
            tags: record.tags,
            persistent: true,
            requires_network: record.requires_network,
            retry_limit: record.retry_limit,
            created_at: record.created_at,
            ready_at: record.ready_at,
            seniority: record.seniority,
            sequence: record.sequence,
            run_count: record.run_count,
            running_session: record.running_session,
        })
    }

    /// Snapshot this holder for a persistence backend.
    pub fn to_record(&self) -> Result<JobRecord, PersistenceError> {
        let payload = self
            .payload
            .clone()
            .ok_or_else(|| PersistenceError::NotEncodable(self.id.to_string()))?;
        Ok(JobRecord {
            id: self.id,
            priority: self.priority,
            group_id: self.group_id.clone(),
            tags: self.tags.clone(),
            requires_network: self.requires_network,
            retry_limit: self.retry_limit,
            created_at: self.created_at,
            ready_at: self.ready_at,
            seniority: self.seniority,
            sequence: self.sequence,
            run_count: self.run_count,
            running_session: self.running_session,
            payload,
        })
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn job(&self) -> &Arc<dyn Job> {
        &self.job
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn requires_network(&self) -> bool {
        self.requires_network
    }

    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Earliest instant the job may run.
    pub fn ready_at(&self) -> Timestamp {
        self.ready_at
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn run_count(&self) -> u32 {
        self.run_count
    }

    pub fn running_session(&self) -> Option<SessionId> {
        self.running_session
    }

    pub fn is_ready(&self, now: Timestamp) -> bool {
        self.ready_at <= now
    }

    /// Whether another attempt is allowed after the current one fails.
    ///
    /// A job with retry limit `L` runs at most `L + 1` times.
    pub fn can_retry(&self) -> bool {
        self.run_count <= self.retry_limit
    }

    pub fn ready_key(&self) -> ReadyKey {
        ReadyKey {
            priority: Reverse(self.priority),
            seniority: self.seniority,
            sequence: self.sequence,
        }
    }

    pub(crate) fn mark_running(&mut self, session: SessionId) {
        self.run_count = self.run_count.saturating_add(1);
        self.running_session = Some(session);
    }

    /// Put a failed holder back in line. It competes by its new ready time,
    /// not its original creation time. A requeue may only lower the priority.
    pub(crate) fn requeue(&mut self, ready_at: Timestamp, priority: Option<i32>) {
        self.ready_at = ready_at;
        self.seniority = ready_at;
        self.running_session = None;
        if let Some(priority) = priority {
            self.priority = priority.clamp(0, self.priority.max(0));
        }
    }

    /// Clear a running marker left behind by an earlier session.
    pub(crate) fn reset_interrupted(&mut self) {
        self.running_session = None;
    }
}

impl core::fmt::Debug for JobHolder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobHolder")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("group_id", &self.group_id)
            .field("tags", &self.tags)
            .field("persistent", &self.persistent)
            .field("requires_network", &self.requires_network)
            .field("ready_at", &self.ready_at)
            .field("run_count", &self.run_count)
            .field("running_session", &self.running_session)
            .finish_non_exhaustive()
    }
}

/// Durable snapshot of a [`JobHolder`], as stored by persistence backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub priority: i32,
    pub group_id: Option<String>,
    pub tags: BTreeSet<String>,
    pub requires_network: bool,
    pub retry_limit: u32,
    pub created_at: Timestamp,
    pub ready_at: Timestamp,
    pub seniority: Timestamp,
    pub sequence: u64,
    pub run_count: u32,
    pub running_session: Option<SessionId>,
    pub payload: JobPayload,
}
