//! Manager configuration.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use jobqueue_core::{SystemClock, TimeSource, check_monotonic};
use tracing::warn;

use crate::backoff::BackoffPolicy;
use crate::connectivity::{AlwaysConnected, ConnectivitySource};
use crate::error::JobQueueError;
use crate::job::JobRegistry;
use crate::persistence::{InMemoryPersistence, PersistenceBackend};

pub const DEFAULT_ID: &str = "default_job_manager";
pub const DEFAULT_MIN_CONSUMERS: usize = 0;
pub const DEFAULT_MAX_CONSUMERS: usize = 5;
pub const DEFAULT_LOAD_FACTOR: usize = 3;
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(15);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Validated, immutable manager configuration.
#[derive(Debug, Clone)]
pub struct Configuration {
    id: String,
    min_consumers: usize,
    max_consumers: usize,
    load_factor: usize,
    consumer_keep_alive: Duration,
    poll_interval: Duration,
    backoff: BackoffPolicy,
    persistence: Arc<dyn PersistenceBackend>,
    connectivity: Arc<dyn ConnectivitySource>,
    clock: Arc<dyn TimeSource>,
    registry: Arc<JobRegistry>,
}

impl Configuration {
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::default()
    }

    /// Used for logging and consumer thread names.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Consumers kept alive even when idle.
    pub fn min_consumers(&self) -> usize {
        self.min_consumers
    }

    pub fn max_consumers(&self) -> usize {
        self.max_consumers
    }

    /// Jobs per consumer before another consumer is started.
    pub fn load_factor(&self) -> usize {
        self.load_factor
    }

    /// Idle time after which a consumer above the minimum retires.
    pub fn consumer_keep_alive(&self) -> Duration {
        self.consumer_keep_alive
    }

    /// Upper bound on how long an idle consumer sleeps before re-checking
    /// time- and connectivity-dependent jobs.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    pub fn persistence(&self) -> &Arc<dyn PersistenceBackend> {
        &self.persistence
    }

    pub fn connectivity(&self) -> &Arc<dyn ConnectivitySource> {
        &self.connectivity
    }

    pub fn clock(&self) -> &Arc<dyn TimeSource> {
        &self.clock
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }
}

/// Builder for [`Configuration`].
#[derive(Debug, Clone)]
pub struct ConfigurationBuilder {
    id: String,
    min_consumers: usize,
    max_consumers: usize,
    load_factor: usize,
    consumer_keep_alive: Duration,
    poll_interval: Duration,
    backoff: BackoffPolicy,
    persistence: Option<Arc<dyn PersistenceBackend>>,
    connectivity: Option<Arc<dyn ConnectivitySource>>,
    clock: Option<Arc<dyn TimeSource>>,
    registry: Arc<JobRegistry>,
}

impl Default for ConfigurationBuilder {
    fn default() -> Self {
        Self {
            id: DEFAULT_ID.to_string(),
            min_consumers: DEFAULT_MIN_CONSUMERS,
            max_consumers: DEFAULT_MAX_CONSUMERS,
            load_factor: DEFAULT_LOAD_FACTOR,
            consumer_keep_alive: DEFAULT_KEEP_ALIVE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            backoff: BackoffPolicy::default(),
            persistence: None,
            connectivity: None,
            clock: None,
            registry: Arc::new(JobRegistry::new()),
        }
    }
}

impl ConfigurationBuilder {
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_min_consumers(mut self, min: usize) -> Self {
        self.min_consumers = min;
        self
    }

    pub fn with_max_consumers(mut self, max: usize) -> Self {
        self.max_consumers = max;
        self
    }

    pub fn with_load_factor(mut self, load_factor: usize) -> Self {
        self.load_factor = load_factor;
        self
    }

    pub fn with_consumer_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.consumer_keep_alive = keep_alive;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_persistence(mut self, backend: Arc<dyn PersistenceBackend>) -> Self {
        self.persistence = Some(backend);
        self
    }

    pub fn with_connectivity(mut self, source: Arc<dyn ConnectivitySource>) -> Self {
        self.connectivity = Some(source);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_registry(mut self, registry: JobRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Apply `JOBQUEUE_*` environment variables on top of the current values.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(id) = lookup("JOBQUEUE_ID") {
            self.id = id;
        }
        if let Some(v) = parse_var(&lookup, "JOBQUEUE_MIN_CONSUMERS") {
            self.min_consumers = v;
        }
        if let Some(v) = parse_var(&lookup, "JOBQUEUE_MAX_CONSUMERS") {
            self.max_consumers = v;
        }
        if let Some(v) = parse_var(&lookup, "JOBQUEUE_LOAD_FACTOR") {
            self.load_factor = v;
        }
        if let Some(ms) = parse_var(&lookup, "JOBQUEUE_KEEP_ALIVE_MS") {
            self.consumer_keep_alive = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "JOBQUEUE_POLL_INTERVAL_MS") {
            self.poll_interval = Duration::from_millis(ms);
        }
        self
    }

    pub fn build(self) -> Result<Configuration, JobQueueError> {
        if self.id.trim().is_empty() {
            return Err(JobQueueError::invalid_config("id must not be empty"));
        }
        if self.max_consumers == 0 {
            return Err(JobQueueError::invalid_config("max_consumers must be at least 1"));
        }
        if self.min_consumers > self.max_consumers {
            return Err(JobQueueError::invalid_config(format!(
                "min_consumers ({}) exceeds max_consumers ({})",
                self.min_consumers, self.max_consumers
            )));
        }
        if self.load_factor == 0 {
            return Err(JobQueueError::invalid_config("load_factor must be at least 1"));
        }
        if self.consumer_keep_alive.is_zero() {
            return Err(JobQueueError::invalid_config("consumer_keep_alive must be positive"));
        }
        if self.poll_interval.is_zero() {
            return Err(JobQueueError::invalid_config("poll_interval must be positive"));
        }

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()) as Arc<dyn TimeSource>);
        check_monotonic(clock.as_ref()).map_err(|e| JobQueueError::invalid_config(e.to_string()))?;

        Ok(Configuration {
            id: self.id,
            min_consumers: self.min_consumers,
            max_consumers: self.max_consumers,
            load_factor: self.load_factor,
            consumer_keep_alive: self.consumer_keep_alive,
            poll_interval: self.poll_interval,
            backoff: self.backoff,
            persistence: self
                .persistence
                .unwrap_or_else(|| InMemoryPersistence::arc() as Arc<dyn PersistenceBackend>),
            connectivity: self
                .connectivity
                .unwrap_or_else(|| Arc::new(AlwaysConnected) as Arc<dyn ConnectivitySource>),
            clock,
            registry: self.registry,
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "ignoring unparsable environment override");
            None
        }
    }
}
