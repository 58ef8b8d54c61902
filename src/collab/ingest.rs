//! Feeding discovery results into the state store.

use chrono::{DateTime, Utc};

use crate::collab::IssueDiscoverySource;
use crate::error::Result;
use crate::scheduler::RetryPolicy;
use crate::store::{ErrorKind, StateStore, UpsertOutcome};

/// Counts from one ingest run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub inserted: usize,
    pub refreshed: usize,
    pub revived: usize,
    pub ignored: usize,
    pub resolved: usize,
    pub failures: usize,
}

impl IngestReport {
    /// Items newly queued by this run.
    pub fn queued(&self) -> usize {
        self.inserted + self.revived
    }
}

/// Run discovery once and upsert everything it found.
///
/// Discovery failures on individual namespaces are logged as `Unknown` error events
/// and do not stop the run. A failure of the whole source is returned to the caller.
pub async fn ingest(
    store: &StateStore,
    source: &dyn IssueDiscoverySource,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<IngestReport> {
    let batch = source.discover().await?;
    let mut report = IngestReport::default();

    for found in &batch.found {
        let outcome = store.upsert_item(&found.key, found.throttle_secs, found.observed_at, policy)?;
        log::info!(
            "{:?} {} (throttled {}s at {})",
            outcome,
            found.key,
            found.throttle_secs,
            found.observed_at.to_rfc3339()
        );
        match outcome {
            UpsertOutcome::Inserted => report.inserted += 1,
            UpsertOutcome::Refreshed => report.refreshed += 1,
            UpsertOutcome::Revived => report.revived += 1,
            UpsertOutcome::Ignored => report.ignored += 1,
        }
    }

    for key in &batch.resolved {
        if store.remove_item(key, now)? {
            log::info!("Removed {} from queue: resolved outside the scheduler", key);
            report.resolved += 1;
        }
    }

    for failure in &batch.failures {
        log::warn!("Discovery failure: {}", failure);
        store.record_error(ErrorKind::Unknown, &format!("scan error: {}", failure), None, now)?;
        report.failures += 1;
    }

    Ok(report)
}
