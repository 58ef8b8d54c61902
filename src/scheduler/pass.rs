//! One bounded scheduling pass.
//!
//! `Start → CheckBreaker → ComputeBudget → SelectBatch → ForEachItem{Trigger → RecordOutcome} → End`
//!
//! Items are processed one at a time so the attempt log records triggers in the
//! order they really happened. The pass holds the store's pass lease for its
//! whole duration and can only be cancelled between items.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};

use crate::clock::{Clock, SystemClock};
use crate::collab::{TriggerAction, TriggerResponse};
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::scheduler::breaker::{BreakerState, CircuitBreaker};
use crate::scheduler::retry::{RetryPolicy, RetryScheduler};
use crate::scheduler::slots::SlotCalculator;
use crate::store::{AttemptEffect, AttemptOutcome, ErrorKind, ItemKey, QueuedItem, StateStore};

/// How a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassStatus {
    /// Batch exhausted, or nothing to do
    Completed,
    /// Circuit breaker open before or during the pass
    BreakerHalted,
    /// State store unreadable, unwritable or leased by another pass
    StoreUnavailable,
    /// Stop requested; the pass ended at an item boundary
    Cancelled,
}

impl PassStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassStatus::Completed => "completed",
            PassStatus::BreakerHalted => "breaker-halted",
            PassStatus::StoreUnavailable => "store-unavailable",
            PassStatus::Cancelled => "cancelled",
        }
    }

    /// Process exit code for the invoking scheduler.
    pub fn exit_code(&self) -> u8 {
        match self {
            PassStatus::Completed | PassStatus::Cancelled => 0,
            PassStatus::BreakerHalted => 2,
            PassStatus::StoreUnavailable => 3,
        }
    }
}

impl std::fmt::Display for PassStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-pass counters for logging and monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassSummary {
    pub available_slots: usize,
    pub eligible: usize,
    pub attempted: usize,
    pub accepted: usize,
    pub throttled: usize,
    pub errored: usize,
    pub ceiling_reached: usize,
    pub breaker: BreakerState,
    /// Set when no slot was free
    pub next_slot_at: Option<DateTime<Utc>>,
}

impl Default for PassSummary {
    fn default() -> Self {
        Self {
            available_slots: 0,
            eligible: 0,
            attempted: 0,
            accepted: 0,
            throttled: 0,
            errored: 0,
            ceiling_reached: 0,
            breaker: BreakerState::Closed,
            next_slot_at: None,
        }
    }
}

/// Summary plus terminal status of one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub summary: PassSummary,
    pub status: PassStatus,
    /// Cause, for halted or failed passes
    pub detail: Option<String>,
}

/// Orchestrates one pass over the queue.
pub struct ProcessingLoop<'a> {
    store: &'a StateStore,
    trigger: &'a dyn TriggerAction,
    config: SchedulerConfig,
    scheduler: RetryScheduler,
    clock: Arc<dyn Clock>,
    stop: Arc<AtomicBool>,
}

impl<'a> ProcessingLoop<'a> {
    pub fn new(store: &'a StateStore, trigger: &'a dyn TriggerAction, config: SchedulerConfig) -> Self {
        let scheduler = RetryScheduler::new(RetryPolicy::from_config(&config));
        Self {
            store,
            trigger,
            config,
            scheduler,
            clock: Arc::new(SystemClock),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Share a flag that ends the pass at the next item boundary once set.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// Run one pass. Never panics on store failure; the status says what happened.
    pub async fn run_pass(&self) -> PassReport {
        let started = self.clock.now();
        let holder = format!("pass-{}-{}", std::process::id(), started.timestamp_millis());
        let mut summary = PassSummary::default();

        let lock = match self
            .store
            .try_acquire_pass_lock(&holder, started, self.config.lock_ttl())
        {
            Ok(lock) => lock,
            Err(e) => return self.finish(summary, Err(e)),
        };

        let outcome = self.run_locked(&mut summary).await;

        if let Err(e) = lock.release() {
            log::warn!("Pass lock release failed: {}", e);
        }
        self.finish(summary, outcome)
    }

    async fn run_locked(&self, summary: &mut PassSummary) -> Result<(PassStatus, Option<String>)> {
        let now = self.clock.now();
        let breaker = CircuitBreaker::new(self.store, &self.config);

        if breaker.should_halt(now)? {
            summary.breaker = BreakerState::Open;
            return Ok((
                PassStatus::BreakerHalted,
                Some("circuit breaker open before pass".to_string()),
            ));
        }

        let slots = SlotCalculator::new(self.store, &self.config).status(now)?;
        summary.available_slots = slots.available;
        log::info!("Available processing slots: {}/{}", slots.available, slots.total);
        if slots.available == 0 {
            summary.next_slot_at = slots.next_slot_at;
            if let Some(at) = slots.next_slot_at {
                log::info!("No slots available. Next slot at: {}", at.to_rfc3339());
            }
            return Ok((PassStatus::Completed, None));
        }

        let eligible = self.store.list_eligible(now)?;
        summary.eligible = eligible.len();
        let batch = self.scheduler.select_batch(eligible, slots.available);
        if batch.is_empty() {
            log::info!("No items ready for processing");
            return Ok((PassStatus::Completed, None));
        }
        log::info!("Processing {} item(s)...", batch.len());

        let last = batch.len() - 1;
        for (index, item) in batch.iter().enumerate() {
            if self.stop.load(Ordering::SeqCst) {
                log::warn!("Stop requested; ending pass before {}", item.key);
                return Ok((PassStatus::Cancelled, Some("stop requested".to_string())));
            }

            let failed = self.process_item(item, summary).await?;

            if failed && breaker.should_halt(self.clock.now())? {
                summary.breaker = BreakerState::Open;
                return Ok((
                    PassStatus::BreakerHalted,
                    Some(format!("circuit breaker tripped after {}", item.key)),
                ));
            }

            if index < last && !self.config.post_trigger_delay().is_zero() {
                tokio::time::sleep(self.config.post_trigger_delay()).await;
            }
        }

        Ok((PassStatus::Completed, None))
    }

    /// Trigger one item and record the outcome. Returns true for an unexpected failure.
    async fn process_item(&self, item: &QueuedItem, summary: &mut PassSummary) -> Result<bool> {
        log::info!(
            "Processing {} (retry {}/{})",
            item.key,
            item.retry_count,
            self.config.retry_ceiling
        );

        let response = self.trigger_with_timeout(&item.key).await;
        let at = self.clock.now();
        let classified = Classified::from(response);

        let effect = self.store.record_attempt(
            &item.key,
            classified.outcome,
            classified.throttle_secs,
            at,
            self.scheduler.policy(),
        )?;
        if let Some((kind, detail)) = &classified.error {
            self.store.record_error(*kind, detail, Some(&item.key), at)?;
        }

        summary.attempted += 1;
        match classified.outcome {
            AttemptOutcome::Accepted => summary.accepted += 1,
            AttemptOutcome::StillThrottled => summary.throttled += 1,
            AttemptOutcome::TransientError => summary.errored += 1,
        }

        match &effect {
            AttemptEffect::Removed => log::info!("  accepted, {} removed from queue", item.key),
            AttemptEffect::Rescheduled {
                retry_count,
                next_eligible_at,
            } => log::info!(
                "  {} (retry {}), next attempt at {}",
                classified.describe(),
                retry_count,
                next_eligible_at.to_rfc3339()
            ),
            AttemptEffect::RetryCeilingReached { retry_count } => {
                summary.ceiling_reached += 1;
                log::warn!(
                    "  {} after {} retries; retry ceiling reached, {} removed",
                    classified.describe(),
                    retry_count,
                    item.key
                );
            }
            AttemptEffect::NotQueued => log::warn!("  {} was no longer queued", item.key),
        }

        Ok(classified.error.is_some())
    }

    async fn trigger_with_timeout(&self, key: &ItemKey) -> TriggerResponse {
        let timeout = self.config.trigger_timeout();
        match tokio::time::timeout(timeout, self.trigger.trigger(key)).await {
            Ok(response) => response,
            Err(_) => TriggerResponse::TransientError {
                detail: format!("trigger timed out after {}s", timeout.as_secs()),
            },
        }
    }

    fn finish(
        &self,
        summary: PassSummary,
        outcome: Result<(PassStatus, Option<String>)>,
    ) -> PassReport {
        let (status, detail) = match outcome {
            Ok(done) => done,
            Err(e) => {
                if !e.is_store_failure() {
                    log::warn!("Unexpected non-store error ended the pass: {}", e);
                }
                (PassStatus::StoreUnavailable, Some(e.to_string()))
            }
        };

        match status {
            PassStatus::BreakerHalted => log::error!(
                "Pass halted by circuit breaker: {}",
                detail.as_deref().unwrap_or("open")
            ),
            PassStatus::StoreUnavailable => log::error!(
                "Pass aborted, state store unavailable: {}",
                detail.as_deref().unwrap_or("unknown")
            ),
            _ => {}
        }
        tracing::info!(
            status = status.as_str(),
            attempted = summary.attempted,
            accepted = summary.accepted,
            throttled = summary.throttled,
            errored = summary.errored,
            breaker = summary.breaker.as_str(),
            "Pass finished"
        );

        PassReport {
            summary,
            status,
            detail,
        }
    }
}

/// A trigger response mapped onto what gets recorded.
struct Classified {
    outcome: AttemptOutcome,
    throttle_secs: Option<u64>,
    error: Option<(ErrorKind, String)>,
}

impl Classified {
    fn describe(&self) -> String {
        match (&self.outcome, self.throttle_secs, &self.error) {
            (AttemptOutcome::StillThrottled, Some(secs), _) => format!("still throttled ({}s)", secs),
            (_, _, Some((_, detail))) => format!("failed: {}", detail),
            (outcome, _, None) => outcome.to_string(),
        }
    }
}

impl From<TriggerResponse> for Classified {
    fn from(response: TriggerResponse) -> Self {
        match response {
            TriggerResponse::Accepted => Self {
                outcome: AttemptOutcome::Accepted,
                throttle_secs: None,
                error: None,
            },
            TriggerResponse::StillThrottled { throttle_secs } => Self {
                outcome: AttemptOutcome::StillThrottled,
                throttle_secs: Some(throttle_secs),
                error: None,
            },
            TriggerResponse::TransientError { detail } => Self {
                outcome: AttemptOutcome::TransientError,
                throttle_secs: None,
                error: Some((ErrorKind::TransientError, detail)),
            },
            TriggerResponse::Unrecognized { detail } => Self {
                outcome: AttemptOutcome::TransientError,
                throttle_secs: None,
                error: Some((ErrorKind::Unknown, detail)),
            },
        }
    }
}
