//! Slot inference from attempt history.
//!
//! The downstream system grants `total` slots, each recharging `recharge_period`
//! after use, and never tells us how many are left. Every attempt, accepted or
//! throttled, consumed a slot, so the free count is the total minus the distinct
//! items attempted inside the trailing recharge window.

use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::store::StateStore;

/// Snapshot of inferred capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotStatus {
    pub total: usize,
    pub used: usize,
    pub available: usize,
    /// When the oldest counted attempt recharges; set only when nothing is available.
    pub next_slot_at: Option<DateTime<Utc>>,
}

/// Derives available capacity from the store's attempt log.
pub struct SlotCalculator<'a> {
    store: &'a StateStore,
    total: usize,
    recharge_period: chrono::Duration,
}

impl<'a> SlotCalculator<'a> {
    pub fn new(store: &'a StateStore, config: &SchedulerConfig) -> Self {
        Self {
            store,
            total: config.total_slots,
            recharge_period: config.recharge_period(),
        }
    }

    /// Inferred capacity at `now`.
    pub fn status(&self, now: DateTime<Utc>) -> Result<SlotStatus> {
        let attempts = self.store.recent_attempts(self.recharge_period, now)?;

        let mut seen = HashSet::new();
        let mut oldest_counted = None;
        for attempt in &attempts {
            if seen.insert(&attempt.key) && oldest_counted.is_none() {
                oldest_counted = Some(attempt.attempted_at);
            }
        }

        let used = seen.len();
        let available = self.total.saturating_sub(used);
        let next_slot_at = match available {
            0 => oldest_counted.map(|at| at + self.recharge_period),
            _ => None,
        };

        tracing::debug!(total = self.total, used, available, "Slot status computed");
        Ok(SlotStatus {
            total: self.total,
            used,
            available,
            next_slot_at,
        })
    }

    /// Available slots, or zero if the history cannot be read.
    pub fn available(&self, now: DateTime<Utc>) -> usize {
        match self.status(now) {
            Ok(status) => status.available,
            Err(e) => {
                tracing::warn!(error = %e, "Attempt history unreadable, assuming no capacity");
                0
            }
        }
    }
}
