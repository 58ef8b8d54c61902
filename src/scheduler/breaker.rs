//! Circuit breaker over the error log.
//!
//! State is never stored: every evaluation rebuilds it from the trailing error
//! window. Scanning from the newest event backward, unexpected errors
//! (`TransientError`, `Unknown`) extend the run; a `Throttled` or
//! `RetryCeilingReached` event, or an accepted attempt, ends it. The breaker's
//! own `CircuitOpened` entries are skipped so an open breaker stays open until
//! the run ages out of the window. Entries sharing a timestamp are ordered by
//! their position in the journal the two logs share.

use chrono::{DateTime, Utc};

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::store::{AttemptOutcome, ErrorKind, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerDecision {
    pub state: BreakerState,
    /// Length of the current run of unexpected errors
    pub consecutive_failures: usize,
    /// Newest event in the window is already a `CircuitOpened` entry
    already_reported: bool,
}

pub struct CircuitBreaker<'a> {
    store: &'a StateStore,
    threshold: usize,
    window: chrono::Duration,
}

impl<'a> CircuitBreaker<'a> {
    pub fn new(store: &'a StateStore, config: &SchedulerConfig) -> Self {
        Self {
            store,
            threshold: config.breaker_threshold,
            window: config.breaker_window(),
        }
    }

    /// Compute the breaker state at `now` without writing anything.
    pub fn evaluate(&self, now: DateTime<Utc>) -> Result<BreakerDecision> {
        let errors = self.store.recent_errors(self.window, now)?;
        let last_success = self
            .store
            .recent_attempts(self.window, now)?
            .into_iter()
            .filter(|a| a.outcome == AttemptOutcome::Accepted)
            .map(|a| (a.attempted_at, a.seq))
            .max();

        let already_reported = errors.first().is_some_and(|e| e.kind == ErrorKind::CircuitOpened);

        let mut run = 0;
        for event in &errors {
            if last_success.is_some_and(|success| (event.occurred_at, event.seq) <= success) {
                break;
            }
            match event.kind {
                ErrorKind::CircuitOpened => continue,
                kind if kind.is_expected() => break,
                _ => run += 1,
            }
        }

        let state = if self.threshold > 0 && run >= self.threshold {
            BreakerState::Open
        } else {
            BreakerState::Closed
        };

        Ok(BreakerDecision {
            state,
            consecutive_failures: run,
            already_reported,
        })
    }

    /// True when processing must halt. Logs `CircuitOpened` on the transition to open.
    pub fn should_halt(&self, now: DateTime<Utc>) -> Result<bool> {
        let decision = self.evaluate(now)?;
        if decision.state == BreakerState::Closed {
            return Ok(false);
        }

        if !decision.already_reported {
            let detail = format!(
                "Circuit breaker tripped: {} consecutive errors in last {} seconds",
                decision.consecutive_failures,
                self.window.num_seconds()
            );
            tracing::error!(consecutive = decision.consecutive_failures, "{}", detail);
            self.store.record_error(ErrorKind::CircuitOpened, &detail, None, now)?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::RetryPolicy;
    use crate::store::ItemKey;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn create_temp_store() -> (StateStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = StateStore::open_at(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn errors(store: &StateStore, kind: ErrorKind, count: usize, at: DateTime<Utc>) {
        for _ in 0..count {
            store.record_error(kind, "boom", None, at).unwrap();
        }
    }

    #[test]
    fn test_opens_at_threshold() {
        let (store, _temp) = create_temp_store();
        let config = SchedulerConfig::default();
        let breaker = CircuitBreaker::new(&store, &config);

        errors(&store, ErrorKind::TransientError, 4, t(0));
        assert!(!breaker.should_halt(t(10)).unwrap());

        errors(&store, ErrorKind::Unknown, 1, t(5));
        let decision = breaker.evaluate(t(10)).unwrap();
        assert_eq!(decision.state, BreakerState::Open);
        assert_eq!(decision.consecutive_failures, 5);
        assert!(breaker.should_halt(t(10)).unwrap());
    }

    #[test]
    fn test_throttled_interrupts_run() {
        let (store, _temp) = create_temp_store();
        let config = SchedulerConfig::default();
        let breaker = CircuitBreaker::new(&store, &config);

        errors(&store, ErrorKind::TransientError, 5, t(0));
        errors(&store, ErrorKind::Throttled, 1, t(1));
        errors(&store, ErrorKind::TransientError, 4, t(2));

        let decision = breaker.evaluate(t(10)).unwrap();
        assert_eq!(decision.state, BreakerState::Closed);
        assert_eq!(decision.consecutive_failures, 4);
        assert!(!breaker.should_halt(t(10)).unwrap());
    }

    #[test]
    fn test_retry_ceiling_alone_never_opens() {
        let (store, _temp) = create_temp_store();
        let config = SchedulerConfig::default();
        let breaker = CircuitBreaker::new(&store, &config);

        errors(&store, ErrorKind::RetryCeilingReached, 20, t(0));
        assert!(!breaker.should_halt(t(1)).unwrap());
    }

    #[test]
    fn test_success_interrupts_run() {
        let (store, _temp) = create_temp_store();
        let config = SchedulerConfig::default();
        let breaker = CircuitBreaker::new(&store, &config);

        errors(&store, ErrorKind::TransientError, 3, t(0));
        store
            .record_attempt(
                &ItemKey::new("acme/widgets", 1),
                AttemptOutcome::Accepted,
                None,
                t(1),
                &RetryPolicy::default(),
            )
            .unwrap();
        errors(&store, ErrorKind::TransientError, 3, t(2));

        let decision = breaker.evaluate(t(10)).unwrap();
        assert_eq!(decision.consecutive_failures, 3);
        assert_eq!(decision.state, BreakerState::Closed);
    }

    #[test]
    fn test_errors_after_success_at_same_instant_count() {
        let (store, _temp) = create_temp_store();
        let config = SchedulerConfig::default();
        let breaker = CircuitBreaker::new(&store, &config);

        errors(&store, ErrorKind::TransientError, 2, t(0));
        store
            .record_attempt(
                &ItemKey::new("acme/widgets", 1),
                AttemptOutcome::Accepted,
                None,
                t(0),
                &RetryPolicy::default(),
            )
            .unwrap();
        errors(&store, ErrorKind::TransientError, 6, t(0));

        let decision = breaker.evaluate(t(1)).unwrap();
        assert_eq!(decision.consecutive_failures, 6);
        assert_eq!(decision.state, BreakerState::Open);
    }

    #[test]
    fn test_window_ages_errors_out() {
        let (store, _temp) = create_temp_store();
        let config = SchedulerConfig::default();
        let breaker = CircuitBreaker::new(&store, &config);

        errors(&store, ErrorKind::TransientError, 5, t(0));
        assert!(breaker.should_halt(t(299)).unwrap());
        assert!(!breaker.should_halt(t(300)).unwrap());
    }

    #[test]
    fn test_circuit_opened_logged_once_and_stays_open() {
        let (store, _temp) = create_temp_store();
        let config = SchedulerConfig::default();
        let breaker = CircuitBreaker::new(&store, &config);

        errors(&store, ErrorKind::TransientError, 5, t(0));
        assert!(breaker.should_halt(t(1)).unwrap());
        assert!(breaker.should_halt(t(2)).unwrap());

        let opened: Vec<_> = store
            .recent_errors(Duration::minutes(5), t(2))
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == ErrorKind::CircuitOpened)
            .collect();
        assert_eq!(opened.len(), 1);
    }

    #[test]
    fn test_circuit_opened_does_not_count() {
        let (store, _temp) = create_temp_store();
        let config = SchedulerConfig::default();
        let breaker = CircuitBreaker::new(&store, &config);

        errors(&store, ErrorKind::CircuitOpened, 10, t(0));
        errors(&store, ErrorKind::TransientError, 1, t(1));
        let decision = breaker.evaluate(t(2)).unwrap();
        assert_eq!(decision.consecutive_failures, 1);
        assert_eq!(decision.state, BreakerState::Closed);
    }
}
