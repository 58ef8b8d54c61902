//! Typed records persisted by the state store.
//!
//! Three entity collections live in the store: queued items, the append-only
//! attempt log and the append-only error log. Enums carry an `as_str` form
//! used as the persisted column value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RetriggerError;

/// Composite identity of a queued item: `(namespace, identifier)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    /// Resource namespace, e.g. `owner/repo`
    pub namespace: String,
    /// Item identifier within the namespace, e.g. an issue number
    pub identifier: u64,
}

impl ItemKey {
    pub fn new(namespace: impl Into<String>, identifier: u64) -> Self {
        Self {
            namespace: namespace.into(),
            identifier,
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.namespace, self.identifier)
    }
}

/// Lifecycle of a queued item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// Waiting for its next trigger
    Pending,
    /// Accepted, exhausted or removed externally; terminal until revived by discovery
    Removed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Removed => "removed",
        }
    }
}

impl FromStr for ItemStatus {
    type Err = RetriggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "removed" => Ok(ItemStatus::Removed),
            other => Err(RetriggerError::InvalidData(format!("unknown item status: {}", other))),
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A unit of pending work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedItem {
    pub key: ItemKey,
    pub discovered_at: DateTime<Utc>,
    pub next_eligible_at: DateTime<Utc>,
    pub retry_count: u32,
    /// Most recently observed throttle duration, in seconds
    pub last_throttle_secs: Option<u64>,
    pub status: ItemStatus,
    pub last_error: Option<String>,
    pub removed_at: Option<DateTime<Utc>>,
}

impl QueuedItem {
    pub fn is_pending(&self) -> bool {
        self.status == ItemStatus::Pending
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.next_eligible_at <= now
    }
}

/// Classified result of one trigger invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Accepted,
    StillThrottled,
    TransientError,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Accepted => "accepted",
            AttemptOutcome::StillThrottled => "still_throttled",
            AttemptOutcome::TransientError => "transient_error",
        }
    }
}

impl FromStr for AttemptOutcome {
    type Err = RetriggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(AttemptOutcome::Accepted),
            "still_throttled" => Ok(AttemptOutcome::StillThrottled),
            "transient_error" => Ok(AttemptOutcome::TransientError),
            other => Err(RetriggerError::InvalidData(format!("unknown attempt outcome: {}", other))),
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable log entry of one trigger invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub id: i64,
    /// Position in the journal shared with error events
    pub seq: i64,
    pub key: ItemKey,
    pub attempted_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    /// Present only for `StillThrottled`
    pub observed_throttle_secs: Option<u64>,
}

/// Classification of an error log entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Throttled,
    TransientError,
    RetryCeilingReached,
    CircuitOpened,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Throttled => "throttled",
            ErrorKind::TransientError => "transient_error",
            ErrorKind::RetryCeilingReached => "retry_ceiling_reached",
            ErrorKind::CircuitOpened => "circuit_opened",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Housekeeping signals that never count toward the breaker threshold.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            ErrorKind::Throttled | ErrorKind::RetryCeilingReached | ErrorKind::CircuitOpened
        )
    }
}

impl FromStr for ErrorKind {
    type Err = RetriggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "throttled" => Ok(ErrorKind::Throttled),
            "transient_error" => Ok(ErrorKind::TransientError),
            "retry_ceiling_reached" => Ok(ErrorKind::RetryCeilingReached),
            "circuit_opened" => Ok(ErrorKind::CircuitOpened),
            "unknown" => Ok(ErrorKind::Unknown),
            other => Err(RetriggerError::InvalidData(format!("unknown error kind: {}", other))),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classified failure log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub id: i64,
    /// Position in the journal shared with attempts; breaks ties between entries sharing a timestamp
    pub seq: i64,
    pub occurred_at: DateTime<Utc>,
    pub kind: ErrorKind,
    pub key: Option<ItemKey>,
    pub detail: String,
}

/// What `upsert_item` did with a discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New key
    Inserted,
    /// Already pending; next-eligible kept at the later of old and new
    Refreshed,
    /// Was removed, observation is newer than the removal
    Revived,
    /// Was removed, observation predates the removal
    Ignored,
}

/// What `record_attempt` did to the item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptEffect {
    /// Accepted; item is terminal
    Removed,
    /// Still pending with a new eligibility time
    Rescheduled {
        retry_count: u32,
        next_eligible_at: DateTime<Utc>,
    },
    /// Retry count reached the ceiling; item dropped and cleanup logged
    RetryCeilingReached { retry_count: u32 },
    /// Item was not pending when the attempt landed; only the attempt was logged
    NotQueued,
}

/// Counts shown by the `status` command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub eligible: usize,
    pub retried: usize,
    pub removed: usize,
}
