//! Backoff applied to jobs that are requeued after a failed run.

use std::time::Duration;

/// Shape of the delay curve between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffStrategy {
    /// Same delay before every requeue.
    Fixed,
    /// `base * run_count`, capped.
    Linear,
    /// `base * 2^(run_count - 1)`, capped.
    #[default]
    Exponential,
}

/// Delay policy for retried jobs.
///
/// A job's retry hook may override the computed delay for a single requeue;
/// otherwise this policy decides when the job becomes ready again.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failed run.
    pub base_delay: Duration,
    /// Upper bound before jitter.
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Fraction of the delay (0.0 to 1.0) spread either side of it.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Requeue immediately.
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Constant delay, no jitter.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn linear(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        }
    }

    /// Doubling delay with 10% jitter.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the next run of a job that has run `attempt` times.
    ///
    /// `seed` spreads the jitter across jobs failing at the same attempt; the
    /// scheduler passes the job's insertion sequence, so a given job always
    /// gets the same delay for the same attempt.
    pub fn delay_for(&self, attempt: u32, seed: u64) -> Duration {
        let Some(step) = attempt.checked_sub(1) else {
            return Duration::ZERO;
        };
        let raw = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => self
                .base_delay
                .saturating_mul(1u32.checked_shl(step).unwrap_or(u32::MAX)),
        };
        let capped = raw.min(self.max_delay);
        if self.jitter <= 0.0 || capped.is_zero() {
            return capped;
        }

        let secs = capped.as_secs_f64();
        let jittered = secs + secs * self.jitter * noise(seed, attempt);
        Duration::try_from_secs_f64(jittered.max(0.0)).unwrap_or(Duration::MAX)
    }
}

/// Deterministic value in `[-1, 1)` mixed from `seed` and `attempt`
/// (splitmix64 finalizer).
fn noise(seed: u64, attempt: u32) -> f64 {
    let mut z = seed ^ u64::from(attempt).rotate_left(32);
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    (z >> 11) as f64 / (1u64 << 53) as f64 * 2.0 - 1.0
}
