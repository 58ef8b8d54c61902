//! Per-item eligibility and backoff bookkeeping.
//!
//! `RetryPolicy` decides what an attempt does to an item (reschedule, drop at
//! the ceiling, or finish it). The state store applies that decision inside
//! the same transaction that appends the attempt, so the retry count, the
//! next-eligible time and the status always change together.
//!
//! `RetryScheduler` picks which eligible items a pass may trigger.

use chrono::{DateTime, Duration, Utc};

use crate::config::SchedulerConfig;
use crate::store::{AttemptEffect, AttemptOutcome, QueuedItem};

/// Retry ceiling and backoff buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Items are dropped when their retry count reaches this.
    pub retry_ceiling: u32,
    /// Added to every observed throttle.
    pub safety_buffer: Duration,
}

impl RetryPolicy {
    pub fn new(retry_ceiling: u32, safety_buffer: Duration) -> Self {
        Self {
            retry_ceiling,
            safety_buffer,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.retry_ceiling, config.safety_buffer())
    }

    /// When an item throttled for `throttle_secs` at `observed_at` may be tried again.
    pub fn next_eligible(&self, observed_at: DateTime<Utc>, throttle_secs: u64) -> DateTime<Utc> {
        // clamp absurd durations instead of overflowing the timestamp
        let secs = throttle_secs.min(u64::from(u32::MAX)) as i64;
        observed_at + Duration::seconds(secs) + self.safety_buffer
    }

    /// Decide what an attempt at `at` does to `item`.
    ///
    /// Throttled backoff is computed from the duration observed on this attempt,
    /// counted from this attempt's time. Transient errors also consume a retry so a
    /// persistently failing item still reaches the ceiling.
    pub fn apply(
        &self,
        item: &QueuedItem,
        outcome: AttemptOutcome,
        observed_throttle_secs: Option<u64>,
        at: DateTime<Utc>,
    ) -> AttemptEffect {
        if !item.is_pending() {
            return AttemptEffect::NotQueued;
        }

        let next_eligible_at = match outcome {
            AttemptOutcome::Accepted => return AttemptEffect::Removed,
            AttemptOutcome::StillThrottled => self.next_eligible(at, observed_throttle_secs.unwrap_or(0)),
            AttemptOutcome::TransientError => at + self.safety_buffer,
        };

        let retry_count = item.retry_count.saturating_add(1);
        if retry_count >= self.retry_ceiling {
            AttemptEffect::RetryCeilingReached { retry_count }
        } else {
            AttemptEffect::Rescheduled {
                retry_count,
                next_eligible_at,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

/// Selects the batch a pass is allowed to trigger.
#[derive(Debug, Clone, Default)]
pub struct RetryScheduler {
    policy: RetryPolicy,
}

impl RetryScheduler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Take at most `available_slots` items, keeping the store's oldest-waiting-first order.
    pub fn select_batch(&self, eligible: Vec<QueuedItem>, available_slots: usize) -> Vec<QueuedItem> {
        let mut batch = eligible;
        batch.truncate(available_slots);
        batch
    }
}
