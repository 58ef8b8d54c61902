//! Retrigger - a capacity-inferring retry scheduler
//!
//! Retrigger retries work items a downstream bot rejected for rate limiting. The
//! bot never reports its remaining capacity, so the scheduler infers it from its
//! own attempt history and spends it on the items that have waited longest.

pub mod clock;
pub mod collab;
pub mod config;
pub mod error;
pub mod github;
pub mod scheduler;
pub mod store;

pub use error::{Result, RetriggerError};
