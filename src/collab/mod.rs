//! Collaborators the scheduler drives but does not implement.
//!
//! - **IssueDiscoverySource**: finds throttled items and how long they were told to wait
//! - **TriggerAction**: performs the side-effecting retrigger for one item
//!
//! The GitHub-backed implementations live in `crate::github`; tests use scripted fakes.

mod ingest;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::store::ItemKey;

pub use ingest::{IngestReport, ingest};

/// One throttled item seen by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    pub key: ItemKey,
    pub throttle_secs: u64,
    /// When the throttle was stated (e.g. the bot comment's timestamp)
    pub observed_at: DateTime<Utc>,
}

/// Everything a discovery run produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryBatch {
    pub found: Vec<Discovery>,
    /// Items whose latest signal shows they no longer need a retrigger
    pub resolved: Vec<ItemKey>,
    /// Per-namespace failures that did not stop the run
    pub failures: Vec<String>,
}

/// Produces throttled work items.
#[async_trait]
pub trait IssueDiscoverySource: Send + Sync {
    async fn discover(&self) -> Result<DiscoveryBatch>;
}

/// Response from the downstream system after a retrigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerResponse {
    Accepted,
    StillThrottled { throttle_secs: u64 },
    TransientError { detail: String },
    /// The downstream answered with something we cannot classify
    Unrecognized { detail: String },
}

/// Performs the remote retrigger for one item. Must be safe to repeat.
#[async_trait]
pub trait TriggerAction: Send + Sync {
    async fn trigger(&self, key: &ItemKey) -> TriggerResponse;
}
