//! Time source contract.
//!
//! The scheduler never reads the system clock directly: delays, backoff and
//! readiness are all computed against an injected [`TimeSource`], so tests can
//! drive them with [`MockClock`] instead of sleeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A point in scheduler time, in nanoseconds.
///
/// [`SystemClock`] anchors it at the Unix epoch so persisted timestamps stay
/// meaningful across restarts; virtual clocks may start anywhere.
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    pub fn saturating_add(self, delta: Duration) -> Self {
        let delta = u64::try_from(delta.as_nanos()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(delta))
    }

    /// Time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl core::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

/// Source of monotonic timestamps.
pub trait TimeSource: Send + Sync + core::fmt::Debug {
    fn now(&self) -> Timestamp;
}

impl<T> TimeSource for Arc<T>
where
    T: TimeSource + ?Sized,
{
    fn now(&self) -> Timestamp {
        (**self).now()
    }
}

/// Wall-clock time source.
///
/// Reads UTC nanoseconds and never returns a value smaller than one it has
/// already handed out, so a wall-clock step backwards cannot reorder jobs.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicU64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeSource for SystemClock {
    fn now(&self) -> Timestamp {
        let wall = Utc::now()
            .timestamp_nanos_opt()
            .map(|n| n.max(0) as u64)
            .unwrap_or(u64::MAX);
        let previous = self.last.fetch_max(wall, Ordering::AcqRel);
        Timestamp(previous.max(wall))
    }
}

/// Virtual time source for tests.
///
/// Clones share the same underlying instant; time only moves when the test
/// calls [`MockClock::advance`] or [`MockClock::set`].
#[derive(Debug, Clone, Default)]
pub struct MockClock {
    nanos: Arc<AtomicU64>,
}

impl MockClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(start: Timestamp) -> Self {
        Self {
            nanos: Arc::new(AtomicU64::new(start.0)),
        }
    }

    pub fn advance(&self, delta: Duration) {
        let delta = u64::try_from(delta.as_nanos()).unwrap_or(u64::MAX);
        let _ = self
            .nanos
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_add(delta))
            });
    }

    /// Jump to an absolute instant. Moving backwards is allowed so tests can
    /// exercise monotonicity checks.
    pub fn set(&self, at: Timestamp) {
        self.nanos.store(at.0, Ordering::Release);
    }
}

impl TimeSource for MockClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.nanos.load(Ordering::Acquire))
    }
}

/// Read a time source twice and reject it if the second reading is earlier.
pub fn check_monotonic(source: &dyn TimeSource) -> Result<(), CoreError> {
    let previous = source.now();
    let current = source.now();
    if current < previous {
        return Err(CoreError::ClockWentBackwards { previous, current });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn system_clock_never_goes_backwards() {
        let clock = SystemClock::new();
        let mut last = clock.now();
        for _ in 0..1_000 {
            let next = clock.now();
            assert!(next >= last);
            last = next;
        }
    }

    #[test]
    fn mock_clock_clones_share_time() {
        let clock = MockClock::starting_at(Timestamp::from_nanos(10));
        let other = clock.clone();

        clock.advance(Duration::from_nanos(5));

        assert_eq!(other.now(), Timestamp::from_nanos(15));
    }

    #[test]
    fn timestamp_arithmetic_saturates() {
        let near_max = Timestamp::from_nanos(u64::MAX - 1);
        assert_eq!(
            near_max.saturating_add(Duration::from_secs(1)),
            Timestamp::from_nanos(u64::MAX)
        );

        let early = Timestamp::from_nanos(100);
        let late = Timestamp::from_nanos(250);
        assert_eq!(late.saturating_duration_since(early), Duration::from_nanos(150));
        assert_eq!(early.saturating_duration_since(late), Duration::ZERO);
    }

    #[derive(Debug)]
    struct SteppingBackwards(Mutex<u64>);

    impl TimeSource for SteppingBackwards {
        fn now(&self) -> Timestamp {
            let mut n = self.0.lock().unwrap();
            *n -= 1;
            Timestamp(*n)
        }
    }

    #[test]
    fn check_monotonic_rejects_backwards_source() {
        let source = SteppingBackwards(Mutex::new(100));
        let err = check_monotonic(&source).unwrap_err();
        assert_eq!(
            err,
            CoreError::ClockWentBackwards {
                previous: Timestamp(99),
                current: Timestamp(98),
            }
        );
    }

    #[test]
    fn check_monotonic_accepts_frozen_mock() {
        assert!(check_monotonic(&MockClock::new()).is_ok());
    }
}
