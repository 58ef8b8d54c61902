//! Scheduling decisions for throttled items.
//!
//! This module provides:
//! - **RetryPolicy / RetryScheduler**: when an item may be retried and which items run first
//! - **SlotCalculator**: available capacity inferred from the attempt log
//! - **CircuitBreaker**: halts processing after a run of unexpected failures
//! - **ProcessingLoop**: one bounded pass tying the above together
//!
//! # Architecture
//!
//! Nothing here holds state between passes. Every pass re-derives capacity and
//! breaker state from the store, so a process can exit after each pass and the
//! next invocation picks up exactly where the last one stopped.
//!
//! # Example
//!
//! ```ignore
//! use retrigger::scheduler::ProcessingLoop;
//! use retrigger::store::StateStore;
//!
//! let store = StateStore::open_at(Path::new("/tmp/retrigger"))?;
//! let report = ProcessingLoop::new(&store, &trigger, config.scheduler).run_pass().await;
//! std::process::exit(report.status.exit_code() as i32);
//! ```

mod breaker;
mod pass;
mod retry;
mod slots;

pub use breaker::{BreakerDecision, BreakerState, CircuitBreaker};
pub use pass::{PassReport, PassStatus, PassSummary, ProcessingLoop};
pub use retry::{RetryPolicy, RetryScheduler};
pub use slots::{SlotCalculator, SlotStatus};
