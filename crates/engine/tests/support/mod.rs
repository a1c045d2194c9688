//! Test-scoped fixtures shared by the integration tests.
#![allow(dead_code)]

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jobqueue_engine::{CancelReason, JobCallback, JobFailure, JobHolder, JobId};

pub const WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Added(JobId),
    RunStarted(JobId),
    Done(JobId),
    Cancelled(JobId, CancelReason),
    WillRetry(JobId),
}

impl Event {
    pub fn id(&self) -> JobId {
        match self {
            Event::Added(id)
            | Event::RunStarted(id)
            | Event::Done(id)
            | Event::Cancelled(id, _)
            | Event::WillRetry(id) => *id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Done(_) | Event::Cancelled(..))
    }
}

/// Forwards every lifecycle event into a channel owned by the test.
pub struct RecordingCallback {
    tx: Sender<Event>,
}

impl RecordingCallback {
    pub fn channel() -> (Arc<Self>, Events) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Self { tx }), Events { rx })
    }

    fn send(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl JobCallback for RecordingCallback {
    fn on_added(&self, job: &JobHolder) {
        self.send(Event::Added(job.id()));
    }

    fn on_run_started(&self, job: &JobHolder) {
        self.send(Event::RunStarted(job.id()));
    }

    fn on_done(&self, job: &JobHolder) {
        self.send(Event::Done(job.id()));
    }

    fn on_cancelled(&self, job: &JobHolder, reason: CancelReason, _failure: Option<&JobFailure>) {
        self.send(Event::Cancelled(job.id(), reason));
    }

    fn on_will_retry(&self, job: &JobHolder, _cause: &anyhow::Error) {
        self.send(Event::WillRetry(job.id()));
    }
}

/// Receiving end of a [`RecordingCallback`].
pub struct Events {
    rx: Receiver<Event>,
}

impl Events {
    pub fn next(&self) -> Event {
        self.rx.recv_timeout(WAIT).expect("timed out waiting for a job event")
    }

    /// Collect events until `stop` matches one, returning all of them
    /// (including the match).
    pub fn until(&self, stop: impl Fn(&Event) -> bool) -> Vec<Event> {
        let mut seen = Vec::new();
        loop {
            let event = self.next();
            let done = stop(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    /// Collect events until `count` jobs reached a terminal state.
    pub fn until_terminal(&self, count: usize) -> Vec<Event> {
        let mut seen = Vec::new();
        let mut terminal = 0;
        while terminal < count {
            let event = self.next();
            if event.is_terminal() {
                terminal += 1;
            }
            seen.push(event);
        }
        seen
    }

    /// Assert nothing arrives for `quiet`.
    pub fn assert_quiet(&self, quiet: Duration) {
        match self.rx.recv_timeout(quiet) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(event) => panic!("unexpected event {event:?}"),
            Err(RecvTimeoutError::Disconnected) => {}
        }
    }
}

pub fn started(events: &[Event]) -> Vec<JobId> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::RunStarted(id) => Some(*id),
            _ => None,
        })
        .collect()
}

/// A latch a job blocks on until the test opens it.
#[derive(Clone)]
pub struct Gate {
    rx: Arc<Mutex<Receiver<()>>>,
    tx: Sender<()>,
}

impl Gate {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            rx: Arc::new(Mutex::new(rx)),
            tx,
        }
    }

    /// Block until opened. Gives up after [`WAIT`] so a broken test cannot
    /// hang the suite.
    pub fn wait(&self) {
        let _ = self.rx.lock().unwrap().recv_timeout(WAIT);
    }

    pub fn open(&self) {
        let _ = self.tx.send(());
    }
}

/// Wait until `condition` holds, polling.
pub fn eventually(condition: impl Fn() -> bool) {
    let deadline = std::time::Instant::now() + WAIT;
    while !condition() {
        assert!(std::time::Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

pub fn init_tracing() {
    jobqueue_observability::init_for_tests();
}
