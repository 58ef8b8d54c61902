//! Durable state for the retry scheduler.
//!
//! A single SQLite database holds three relations:
//! - **queued_items**: pending work keyed by `(namespace, identifier)`
//! - **attempts**: append-only log of every trigger invocation (slot evidence)
//! - **error_events**: append-only classified failure log (breaker evidence)
//!
//! plus a one-row `pass_lock` lease that serializes scheduling passes.
//!
//! # Example
//!
//! ```ignore
//! use retrigger::store::{ItemKey, StateStore};
//!
//! let store = StateStore::open_at(Path::new("/tmp/retrigger"))?;
//! store.upsert_item(&ItemKey::new("acme/widgets", 42), 600, now, &policy)?;
//! let ready = store.list_eligible(now)?;
//! ```

mod records;
mod state_store;

pub use records::{
    AttemptEffect, AttemptOutcome, AttemptRecord, ErrorEvent, ErrorKind, ItemKey, ItemStatus, QueueStats, QueuedItem,
    UpsertOutcome,
};
pub use state_store::{PassLock, StateStore};
