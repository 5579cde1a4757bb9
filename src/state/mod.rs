//! State module for tracking session progress
//!
//! # Components
//!
//! - `RunState`: the session lifecycle (idle, running, paused, stopped, draining, finished)
//! - `Counters`: admitted / succeeded / failed task counts

mod counters;
mod run_state;

// Re-export main types
pub use counters::Counters;
pub use run_state::RunState;
