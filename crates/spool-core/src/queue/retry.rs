//! Retry policies: when a failed task runs again, and how long to keep
//! retrying a busy database.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

use crate::ports::clock::to_chrono;

/// Retry policy for failed tasks.
///
/// The retry bound itself lives on the task (`max_retries`); this only
/// decides the delay before a requeued task becomes claimable again.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry. Zero requeues immediately.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    pub max_delay: Duration,
}

/// What happens to a task after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    Requeue {
        retry_count: u32,
        run_after: Option<DateTime<Utc>>,
    },
    Fail,
}

impl RetryPolicy {
    /// Failed tasks are claimable again straight away.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    pub fn exponential(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
        }
    }

    /// Delay before retry number `retry` (1-indexed):
    /// `base_delay * multiplier^(retry - 1)`, capped at `max_delay`.
    pub fn next_delay(&self, retry: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let base_secs = self.base_delay.as_secs_f64();
        let delay_secs = base_secs * self.multiplier.powi(retry.saturating_sub(1) as i32);
        let cap = self.max_delay.max(self.base_delay);
        if !delay_secs.is_finite() || delay_secs >= cap.as_secs_f64() {
            return cap;
        }
        Duration::from_secs_f64(delay_secs)
    }

    /// Requeue while `retry_count < max_retries`, otherwise fail for good.
    pub fn decide(&self, retry_count: u32, max_retries: u32, now: DateTime<Utc>) -> FailureDisposition {
        if retry_count >= max_retries {
            return FailureDisposition::Fail;
        }
        let retry_count = retry_count + 1;
        let delay = self.next_delay(retry_count);
        let run_after = (!delay.is_zero()).then(|| now + to_chrono(delay));
        FailureDisposition::Requeue {
            retry_count,
            run_after,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::immediate()
    }
}

/// How a store rides out lock contention.
///
/// SQLite already waits up to `lock_wait` on a locked database; after
/// that the whole transaction is retried with jittered exponential delay,
/// up to `max_attempts` times, before `StoreError::Busy` is returned.
#[derive(Debug, Clone, PartialEq)]
pub struct BusyPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub lock_wait: Duration,
}

impl BusyPolicy {
    /// Uniform in `[d/2, d]` where `d = min(base_delay * 2^(attempt-1), max_delay)`.
    pub fn delay_for<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let full = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        let full_ms = full.as_millis() as u64;
        if full_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng.gen_range(full_ms / 2..=full_ms))
    }
}

impl Default for BusyPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
            lock_wait: Duration::from_millis(250),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn immediate_policy_never_delays() {
        let policy = RetryPolicy::immediate();
        assert_eq!(policy.next_delay(1), Duration::ZERO);
        assert_eq!(
            policy.decide(0, 2, Utc::now()),
            FailureDisposition::Requeue {
                retry_count: 1,
                run_after: None
            }
        );
    }

    #[test]
    fn exponential_backoff_increases_and_caps() {
        let policy = RetryPolicy::exponential(Duration::from_secs(2), 2.0, Duration::from_secs(10));

        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
        assert_eq!(policy.next_delay(2), Duration::from_secs(4));
        assert_eq!(policy.next_delay(3), Duration::from_secs(8));
        assert_eq!(policy.next_delay(4), Duration::from_secs(10));
        assert_eq!(policy.next_delay(40), Duration::from_secs(10));
    }

    #[test]
    fn decide_respects_retry_bound() {
        let policy = RetryPolicy::immediate();
        let now = Utc::now();
        assert!(matches!(
            policy.decide(1, 2, now),
            FailureDisposition::Requeue { retry_count: 2, .. }
        ));
        assert_eq!(policy.decide(2, 2, now), FailureDisposition::Fail);
        assert_eq!(policy.decide(0, 0, now), FailureDisposition::Fail);
    }

    #[test]
    fn delayed_retry_sets_run_after() {
        let policy = RetryPolicy::exponential(Duration::from_secs(30), 2.0, Duration::from_secs(300));
        let now = Utc::now();
        let FailureDisposition::Requeue { run_after, .. } = policy.decide(0, 3, now) else {
            panic!("expected requeue");
        };
        assert_eq!(run_after, Some(now + chrono::Duration::seconds(30)));
    }

    #[test]
    fn busy_delay_is_jittered_within_bounds() {
        let policy = BusyPolicy::default();
        let mut rng = StdRng::seed_from_u64(9);
        for attempt in 1..=8 {
            let d = policy.delay_for(attempt, &mut rng);
            let full = (policy.base_delay * 2u32.pow(attempt - 1)).min(policy.max_delay);
            assert!(d >= full / 2 && d <= full, "attempt {attempt}: {d:?}");
        }
    }
}
