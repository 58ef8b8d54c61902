//! Processing pass integration tests
//!
//! Drives whole passes through the public API with a scripted trigger and a manual clock.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Duration;
use retrigger::clock::{Clock, ManualClock};
use retrigger::collab::{Discovery, DiscoveryBatch, IssueDiscoverySource, TriggerAction, TriggerResponse, ingest};
use retrigger::config::SchedulerConfig;
use retrigger::error::Result;
use retrigger::scheduler::{BreakerState, CircuitBreaker, PassStatus, ProcessingLoop, RetryPolicy, SlotCalculator};
use retrigger::store::{AttemptOutcome, ErrorKind, ItemKey, ItemStatus, StateStore};
use tempfile::TempDir;

struct ScriptedTrigger {
    responses: Mutex<VecDeque<TriggerResponse>>,
    calls: Mutex<usize>,
}

impl ScriptedTrigger {
    fn new(responses: Vec<TriggerResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(0),
        }
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl TriggerAction for ScriptedTrigger {
    async fn trigger(&self, _key: &ItemKey) -> TriggerResponse {
        *self.calls.lock().unwrap() += 1;
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(TriggerResponse::Accepted)
    }
}

struct StaticDiscovery(DiscoveryBatch);

#[async_trait]
impl IssueDiscoverySource for StaticDiscovery {
    async fn discover(&self) -> Result<DiscoveryBatch> {
        Ok(self.0.clone())
    }
}

fn config() -> SchedulerConfig {
    SchedulerConfig {
        safety_buffer_secs: 2,
        post_trigger_delay_ms: 0,
        ..SchedulerConfig::default()
    }
}

fn issue(n: u64) -> ItemKey {
    ItemKey::new("acme/widgets", n)
}

/// Integration test: discover, wait out the throttle, retry, reschedule, accept
#[tokio::test]
async fn test_throttled_item_lifecycle() {
    let temp = TempDir::new().unwrap();
    let store = StateStore::open_at(temp.path()).unwrap();
    let clock = Arc::new(ManualClock::at_secs(1_700_000_000));
    let t0 = clock.now();
    let policy = RetryPolicy::from_config(&config());

    let source = StaticDiscovery(DiscoveryBatch {
        found: vec![Discovery {
            key: issue(1),
            throttle_secs: 600,
            observed_at: t0,
        }],
        ..Default::default()
    });
    ingest(&store, &source, &policy, t0).await.unwrap();
    let item = store.get_item(&issue(1)).unwrap().unwrap();
    assert_eq!(item.next_eligible_at, t0 + Duration::seconds(602));

    let trigger = ScriptedTrigger::new(vec![
        TriggerResponse::StillThrottled { throttle_secs: 600 },
        TriggerResponse::Accepted,
    ]);
    let processing = ProcessingLoop::new(&store, &trigger, config()).with_clock(clock.clone());

    // not yet eligible
    clock.set(t0 + Duration::seconds(601));
    let report = processing.run_pass().await;
    assert_eq!(report.status, PassStatus::Completed);
    assert_eq!(trigger.calls(), 0);

    clock.set(t0 + Duration::seconds(602));
    let report = processing.run_pass().await;
    assert_eq!(report.summary.throttled, 1);
    let item = store.get_item(&issue(1)).unwrap().unwrap();
    assert_eq!(item.retry_count, 1);
    assert_eq!(item.next_eligible_at, t0 + Duration::seconds(602 + 602));

    clock.set(t0 + Duration::seconds(1204));
    let report = processing.run_pass().await;
    assert_eq!(report.summary.accepted, 1);
    assert!(store.pending_items().unwrap().is_empty());

    let attempts = store.attempts_for(&issue(1)).unwrap();
    let outcomes: Vec<AttemptOutcome> = attempts.iter().map(|a| a.outcome).collect();
    assert_eq!(outcomes, vec![AttemptOutcome::StillThrottled, AttemptOutcome::Accepted]);
}

/// Integration test: an item that never gets through is dropped at the retry ceiling
#[tokio::test]
async fn test_retry_ceiling_drops_item_without_tripping_breaker() {
    let temp = TempDir::new().unwrap();
    let store = StateStore::open_at(temp.path()).unwrap();
    let clock = Arc::new(ManualClock::at_secs(1_700_000_000));
    let policy = RetryPolicy::from_config(&config());
    store.upsert_item(&issue(1), 0, clock.now(), &policy).unwrap();

    let trigger = ScriptedTrigger::new(
        (0..3)
            .map(|_| TriggerResponse::StillThrottled { throttle_secs: 60 })
            .collect(),
    );

    for _ in 0..3 {
        clock.advance(Duration::minutes(5));
        let report = ProcessingLoop::new(&store, &trigger, config())
            .with_clock(clock.clone())
            .run_pass()
            .await;
        assert_eq!(report.status, PassStatus::Completed);
    }

    assert_eq!(trigger.calls(), 3);
    let item = store.get_item(&issue(1)).unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Removed);

    let errors = store.recent_errors(Duration::minutes(30), clock.now()).unwrap();
    assert!(errors.iter().any(|e| e.kind == ErrorKind::RetryCeilingReached));

    let breaker = CircuitBreaker::new(&store, &config()).evaluate(clock.now()).unwrap();
    assert_eq!(breaker.state, BreakerState::Closed);

    // nothing left to trigger
    clock.advance(Duration::minutes(5));
    ProcessingLoop::new(&store, &trigger, config())
        .with_clock(clock.clone())
        .run_pass()
        .await;
    assert_eq!(trigger.calls(), 3);
}

/// Integration test: capacity and breaker state survive a restart
#[tokio::test]
async fn test_state_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::at_secs(1_700_000_000));
    let policy = RetryPolicy::from_config(&config());

    {
        let store = StateStore::open_at(temp.path()).unwrap();
        for n in 1..=20 {
            store
                .upsert_item(&issue(n), 0, clock.now() - Duration::minutes(10), &policy)
                .unwrap();
        }
        let trigger = ScriptedTrigger::new(vec![]);
        let report = ProcessingLoop::new(&store, &trigger, config())
            .with_clock(clock.clone())
            .run_pass()
            .await;
        assert_eq!(report.summary.attempted, 15);
    }

    let store = StateStore::open_at(temp.path()).unwrap();
    clock.advance(Duration::minutes(1));
    assert_eq!(SlotCalculator::new(&store, &config()).available(clock.now()), 0);
    assert_eq!(store.pending_items().unwrap().len(), 5);

    let trigger = ScriptedTrigger::new(vec![]);
    let report = ProcessingLoop::new(&store, &trigger, config())
        .with_clock(clock.clone())
        .run_pass()
        .await;
    assert_eq!(report.summary.attempted, 0);
    assert_eq!(trigger.calls(), 0);

    clock.advance(Duration::minutes(30));
    let report = ProcessingLoop::new(&store, &trigger, config())
        .with_clock(clock.clone())
        .run_pass()
        .await;
    assert_eq!(report.summary.attempted, 5);
}

/// Integration test: a broken downstream trips the breaker and later passes stay halted
#[tokio::test]
async fn test_breaker_halts_following_passes_until_window_passes() {
    let temp = TempDir::new().unwrap();
    let store = StateStore::open_at(temp.path()).unwrap();
    let clock = Arc::new(ManualClock::at_secs(1_700_000_000));
    let policy = RetryPolicy::from_config(&config());
    for n in 1..=10 {
        store
            .upsert_item(&issue(n), 0, clock.now() - Duration::minutes(10), &policy)
            .unwrap();
    }

    let trigger = ScriptedTrigger::new(
        (0..5)
            .map(|_| TriggerResponse::TransientError {
                detail: "502 Bad Gateway".to_string(),
            })
            .collect(),
    );
    let report = ProcessingLoop::new(&store, &trigger, config())
        .with_clock(clock.clone())
        .run_pass()
        .await;
    assert_eq!(report.status, PassStatus::BreakerHalted);
    assert_eq!(trigger.calls(), 5);

    clock.advance(Duration::minutes(1));
    let report = ProcessingLoop::new(&store, &trigger, config())
        .with_clock(clock.clone())
        .run_pass()
        .await;
    assert_eq!(report.status, PassStatus::BreakerHalted);
    assert_eq!(trigger.calls(), 5);

    clock.advance(Duration::minutes(5));
    let report = ProcessingLoop::new(&store, &trigger, config())
        .with_clock(clock.clone())
        .run_pass()
        .await;
    assert_ne!(report.status, PassStatus::BreakerHalted);
    assert!(trigger.calls() > 5);
}
