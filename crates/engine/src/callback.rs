//! Lifecycle notifications.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use crate::holder::JobHolder;
use crate::job::{CancelReason, JobFailure};

/// Listener for job lifecycle events.
///
/// Events are delivered on whichever thread caused them (a consumer thread,
/// or the caller of `add` / `cancel_by_tags`). Implementations must not block
/// indefinitely. A panicking listener is logged and skipped.
pub trait JobCallback: Send + Sync {
    fn on_added(&self, _job: &JobHolder) {}

    fn on_run_started(&self, _job: &JobHolder) {}

    fn on_done(&self, _job: &JobHolder) {}

    /// `failure` is the cause of the last failed run, if the job ran at all.
    fn on_cancelled(&self, _job: &JobHolder, _reason: CancelReason, _failure: Option<&JobFailure>) {}

    fn on_will_retry(&self, _job: &JobHolder, _cause: &anyhow::Error) {}
}

pub(crate) enum JobEvent<'a> {
    Added(&'a JobHolder),
    RunStarted(&'a JobHolder),
    Done(&'a JobHolder),
    Cancelled(&'a JobHolder, CancelReason, Option<&'a JobFailure>),
    WillRetry(&'a JobHolder, &'a anyhow::Error),
}

impl JobEvent<'_> {
    fn name(&self) -> &'static str {
        match self {
            JobEvent::Added(_) => "added",
            JobEvent::RunStarted(_) => "run_started",
            JobEvent::Done(_) => "done",
            JobEvent::Cancelled(..) => "cancelled",
            JobEvent::WillRetry(..) => "will_retry",
        }
    }

    fn holder(&self) -> &JobHolder {
        match self {
            JobEvent::Added(h)
            | JobEvent::RunStarted(h)
            | JobEvent::Done(h)
            | JobEvent::Cancelled(h, ..)
            | JobEvent::WillRetry(h, _) => h,
        }
    }

    fn deliver(&self, listener: &dyn JobCallback) {
        match *self {
            JobEvent::Added(h) => listener.on_added(h),
            JobEvent::RunStarted(h) => listener.on_run_started(h),
            JobEvent::Done(h) => listener.on_done(h),
            JobEvent::Cancelled(h, reason, failure) => listener.on_cancelled(h, reason, failure),
            JobEvent::WillRetry(h, cause) => listener.on_will_retry(h, cause),
        }
    }
}

/// Ordered set of listeners.
#[derive(Default)]
pub struct CallbackRegistry {
    listeners: RwLock<Vec<Arc<dyn JobCallback>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn JobCallback>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Remove a listener by identity. Returns whether it was registered.
    pub fn remove(&self, listener: &Arc<dyn JobCallback>) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver to a snapshot of the listeners taken before the first call, so
    /// concurrent add/remove never affects an in-progress dispatch.
    pub(crate) fn dispatch(&self, event: &JobEvent<'_>) {
        let snapshot: Vec<Arc<dyn JobCallback>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for listener in snapshot {
            let delivered = catch_unwind(AssertUnwindSafe(|| event.deliver(listener.as_ref())));
            if delivered.is_err() {
                tracing::warn!(
                    job_id = %event.holder().id(),
                    event = event.name(),
                    "job callback panicked"
                );
            }
        }
    }
}

impl core::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}
