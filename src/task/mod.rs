//! Task model
//!
//! - `TaskSpec`: what callers admit (a URL string converts into one)
//! - `Task`: the session-owned unit of work, with id and attempt count
//! - `TaskResult` / `TaskOutcome`: what rule handlers receive on completion
//! - `DedupCache`: membership test over admitted URLs

mod dedup;
#[allow(clippy::module_inception)]
mod task;

pub use dedup::DedupCache;
pub use task::{Properties, Task, TaskOutcome, TaskResult, TaskSpec};
