//! Consumer pool: worker threads that claim, run and settle jobs.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use jobqueue_core::JobId;
use tracing::{debug, error, warn};

use crate::callback::JobEvent;
use crate::config::Configuration;
use crate::holder::JobHolder;
use crate::job::{CancelReason, JobFailure, RetryDecision};
use crate::manager::{self, Lifecycle, Shared, State};

const MIN_WAIT: Duration = Duration::from_millis(1);

/// Consumers wanted for the current load.
///
/// In-flight jobs count as load. While anything is waiting at least one
/// consumer is kept so delayed and network-gated jobs are re-checked.
pub(crate) fn desired_consumers(config: &Configuration, ready: usize, running: usize, waiting: usize) -> usize {
    let mut desired = (ready + running)
        .div_ceil(config.load_factor())
        .clamp(config.min_consumers(), config.max_consumers());
    if desired == 0 && waiting > 0 {
        desired = 1;
    }
    desired
}

/// Start consumers until the pool matches the current load.
///
/// Never stops consumers: surplus ones retire on their own once idle past the
/// keep-alive.
pub(crate) fn ensure_consumers(shared: &Arc<Shared>, state: &mut State) {
    if state.lifecycle != Lifecycle::Running {
        return;
    }
    state.pool.handles.retain(|h| !h.is_finished());

    let (now, network) = (shared.now(), shared.network_available());
    let ready = state.count_ready(now, network);
    let desired = desired_consumers(&shared.config, ready, state.running.len(), state.waiting());

    while state.pool.workers < desired {
        let worker_id = state.pool.next_worker_id;
        state.pool.next_worker_id += 1;
        let name = format!("{}-consumer-{}", shared.config.id(), worker_id);
        let worker = Arc::clone(shared);

        match thread::Builder::new()
            .name(name.clone())
            .spawn(move || consumer_loop(worker))
        {
            Ok(handle) => {
                state.pool.workers += 1;
                state.pool.handles.push(handle);
                debug!(
                    consumer = %name,
                    workers = state.pool.workers,
                    idle = state.pool.idle,
                    ready,
                    "started consumer"
                );
            }
            Err(e) => {
                error!(consumer = %name, error = %e, "failed to spawn consumer thread");
                break;
            }
        }
    }
}

/// A consumer's place in `Pool::workers`, given back however the consumer
/// exits.
struct WorkerSlot<'a> {
    shared: &'a Shared,
}

impl Drop for WorkerSlot<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.lock_state();
        state.pool.workers = state.pool.workers.saturating_sub(1);
        self.shared.consumers_changed.notify_all();
        if thread::panicking() {
            // no user code here: a second panic while unwinding aborts
            error!(manager = %self.shared.config.id(), "consumer thread panicked");
        }
    }
}

fn consumer_loop(shared: Arc<Shared>) {
    manager::mark_consumer_thread(shared.session);
    let _slot = WorkerSlot { shared: &shared };
    let config = &shared.config;
    let keep_alive = config.consumer_keep_alive();
    let mut idle_since = Instant::now();
    let mut state = shared.lock_state();

    loop {
        if state.lifecycle == Lifecycle::Destroyed {
            break;
        }

        if state.lifecycle == Lifecycle::Running {
            let (now, network) = (shared.now(), shared.network_available());
            if let Some(holder) = state.claim_next(now, network, shared.session) {
                debug!(
                    manager = %config.id(),
                    job_id = %holder.id(),
                    run_count = holder.run_count(),
                    "claimed job"
                );
                ensure_consumers(&shared, &mut state);
                drop(state);

                run_job(&shared, holder);

                idle_since = Instant::now();
                state = shared.lock_state();
                continue;
            }
        }

        let idle_for = idle_since.elapsed();
        let workers = state.pool.workers;
        if idle_for >= keep_alive
            && workers > config.min_consumers()
            && (workers > 1 || state.waiting() == 0)
        {
            debug!(manager = %config.id(), workers, "retiring idle consumer");
            break;
        }

        let mut timeout = keep_alive
            .checked_sub(idle_for)
            .filter(|d| !d.is_zero())
            .unwrap_or(config.poll_interval())
            .min(config.poll_interval());
        if let Some(next) = state.next_ready_at() {
            timeout = timeout.min(next.saturating_duration_since(shared.now()));
        }

        state.pool.idle += 1;
        let (guard, _) = shared
            .work_available
            .wait_timeout(state, timeout.max(MIN_WAIT))
            .unwrap_or_else(PoisonError::into_inner);
        state = guard;
        state.pool.idle -= 1;
    }

    drop(state);
}

/// Holds a job's group slot and running entry; frees them on drop if the
/// run is abandoned before it is settled.
struct RunGuard<'a> {
    shared: &'a Shared,
    id: JobId,
    group: Option<String>,
    armed: bool,
}

impl RunGuard<'_> {
    fn release(&mut self, state: &mut State) {
        state.release(self.id, self.group.as_deref());
        self.armed = false;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.shared.lock_state();
        state.release(self.id, self.group.as_deref());
        self.shared.work_available.notify_all();
    }
}

enum Disposition {
    Done,
    Retry {
        delay: Option<Duration>,
        priority: Option<i32>,
    },
    Cancel(CancelReason),
}

fn run_job(shared: &Arc<Shared>, mut holder: JobHolder) {
    let id = holder.id();
    let mut guard = RunGuard {
        shared,
        id,
        group: holder.group_id().map(str::to_string),
        armed: true,
    };

    shared.callbacks.dispatch(&JobEvent::RunStarted(&holder));

    let job = Arc::clone(holder.job());
    let failure = match catch_unwind(AssertUnwindSafe(|| job.on_run())) {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(JobFailure::Error(e)),
        Err(panic) => Some(JobFailure::Panicked(panic_message(panic.as_ref()))),
    };

    let cancel_requested = {
        let state = shared.lock_state();
        state.running.get(&id).is_some_and(|r| r.cancel_requested)
    };

    let disposition = match &failure {
        None => Disposition::Done,
        Some(_) if cancel_requested => Disposition::Cancel(CancelReason::CancelledWhileRunning),
        Some(JobFailure::Panicked(_)) => Disposition::Cancel(CancelReason::Panicked),
        Some(JobFailure::Error(_)) if !holder.can_retry() => {
            Disposition::Cancel(CancelReason::ReachedRetryLimit)
        }
        Some(JobFailure::Error(e)) => {
            let (run_count, retry_limit) = (holder.run_count(), holder.retry_limit());
            match catch_unwind(AssertUnwindSafe(|| job.should_re_run(e, run_count, retry_limit))) {
                Ok(RetryDecision::Retry { delay, priority }) => Disposition::Retry { delay, priority },
                Ok(RetryDecision::Cancel) => Disposition::Cancel(CancelReason::RetryDeclined),
                Err(_) => {
                    warn!(job_id = %id, "should_re_run panicked");
                    Disposition::Cancel(CancelReason::Panicked)
                }
            }
        }
    };

    let disposition = {
        let mut state = shared.lock_state();
        let persistent = holder.is_persistent();
        let cancel_requested = state.running.get(&id).is_some_and(|r| r.cancel_requested);

        let disposition = match disposition {
            Disposition::Retry { .. } if cancel_requested => {
                Disposition::Cancel(CancelReason::CancelledWhileRunning)
            }
            other => other,
        };

        match &disposition {
            Disposition::Retry { delay, priority } => {
                let delay = delay.unwrap_or_else(|| {
                    shared
                        .config
                        .backoff()
                        .delay_for(holder.run_count(), holder.sequence())
                });
                holder.requeue(shared.now().saturating_add(delay), *priority);
                if let Err(e) = state.queue_mut(persistent).insert(holder.clone()) {
                    warn!(job_id = %id, error = %e, "failed to persist requeued job");
                }
            }
            Disposition::Done | Disposition::Cancel(_) => state.queue_mut(persistent).finish(id),
        }

        guard.release(&mut state);
        shared.work_available.notify_all();
        disposition
    };

    match disposition {
        Disposition::Done => {
            debug!(job_id = %id, run_count = holder.run_count(), "job completed");
            shared.callbacks.dispatch(&JobEvent::Done(&holder));
        }
        Disposition::Retry { .. } => {
            warn!(
                job_id = %id,
                run_count = holder.run_count(),
                ready_at = %holder.ready_at(),
                error = %failure.as_ref().map(ToString::to_string).unwrap_or_default(),
                "job failed, will retry"
            );
            if let Some(JobFailure::Error(cause)) = &failure {
                shared.callbacks.dispatch(&JobEvent::WillRetry(&holder, cause));
            }
        }
        Disposition::Cancel(reason) => {
            warn!(
                job_id = %id,
                run_count = holder.run_count(),
                reason = ?reason,
                error = %failure.as_ref().map(ToString::to_string).unwrap_or_default(),
                "job cancelled"
            );
            if catch_unwind(AssertUnwindSafe(|| job.on_cancel(reason))).is_err() {
                warn!(job_id = %id, "on_cancel panicked");
            }
            shared
                .callbacks
                .dispatch(&JobEvent::Cancelled(&holder, reason, failure.as_ref()));
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(min: usize, max: usize, load_factor: usize) -> Configuration {
        Configuration::builder()
            .with_min_consumers(min)
            .with_max_consumers(max)
            .with_load_factor(load_factor)
            .build()
            .unwrap()
    }

    #[test]
    fn sizing_rounds_up_per_load_factor() {
        let c = config(0, 5, 3);
        assert_eq!(desired_consumers(&c, 0, 0, 0), 0);
        assert_eq!(desired_consumers(&c, 1, 0, 1), 1);
        assert_eq!(desired_consumers(&c, 3, 0, 3), 1);
        assert_eq!(desired_consumers(&c, 4, 0, 4), 2);
        assert_eq!(desired_consumers(&c, 4, 3, 4), 3);
    }

    #[test]
    fn sizing_respects_bounds() {
        let c = config(2, 4, 1);
        assert_eq!(desired_consumers(&c, 0, 0, 0), 2);
        assert_eq!(desired_consumers(&c, 100, 0, 100), 4);
    }

    #[test]
    fn waiting_work_keeps_one_consumer() {
        let c = config(0, 5, 3);
        assert_eq!(desired_consumers(&c, 0, 0, 2), 1);
    }

    #[test]
    fn panic_messages_are_extracted() {
        let payload = catch_unwind(|| panic!("boom {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 7");

        let payload = catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");
    }
}
