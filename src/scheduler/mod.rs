//! Scheduler module facade.
//!
//! Task types live in `task.rs`; the strict-priority round-robin core is
//! implemented in `priority.rs` and re-exported here so
//! `crate::scheduler::*` call sites stay clean.

mod priority;
mod task;

// Re-exported as the scheduler facade API for library consumers/tests.
// The binary target may not reference every symbol directly.
#[allow(unused_imports)]
pub use priority::*;
#[allow(unused_imports)]
pub use task::*;
