//! Output module for session summaries
//!
//! This module handles:
//! - The report returned by `Crawler::start`
//! - The error log of failed tasks
//! - Printing the report for the command-line tool

pub mod stats;

pub use stats::{print_report, FailureRecord, SessionReport};
