//! Final session counts and the accumulated error log

use crate::state::Counters;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One task that ended in failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub task_id: u64,
    pub url: String,

    /// Last error seen for the task
    pub reason: String,

    /// Last HTTP status, if the server answered at all
    pub status: Option<u16>,

    pub attempts: u32,
    pub at: DateTime<Utc>,
}

/// Summary produced when a session finishes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    /// Tasks that were started (received an id)
    pub total: u64,

    /// Tasks that completed with content, a download, or not-found
    pub succeeded: u64,

    /// Tasks that exhausted their retries or hit a fatal error
    pub failed: u64,

    /// Error log, in completion order
    pub failures: Vec<FailureRecord>,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SessionReport {
    pub(crate) fn new(
        counters: Counters,
        failures: Vec<FailureRecord>,
        started_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            total: counters.admitted,
            succeeded: counters.succeeded,
            failed: counters.failed,
            failures,
            started_at,
            finished_at: Some(Utc::now()),
        }
    }

    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed
    }

    /// Wall-clock duration, if the session actually ran
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) => Some(finished - started),
            _ => None,
        }
    }

    /// Share of started tasks that succeeded, in percent
    pub fn success_rate(&self) -> f64 {
        if self.total > 0 {
            (self.succeeded as f64 / self.total as f64) * 100.0
        } else {
            0.0
        }
    }
}

/// Prints a report to stdout in a formatted manner
pub fn print_report(report: &SessionReport) {
    println!("=== Session Report ===\n");

    println!("Overview:");
    println!("  Total tasks: {}", report.total);
    println!("  Succeeded: {}", report.succeeded);
    println!("  Failed: {}", report.failed);
    if let Some(duration) = report.duration() {
        println!(
            "  Duration: {:.1}s",
            duration.num_milliseconds() as f64 / 1000.0
        );
    }
    println!();

    if !report.failures.is_empty() {
        println!("Failures ({}):", report.failures.len());
        for failure in &report.failures {
            let status = failure
                .status
                .map(|s| format!(" [HTTP {}]", s))
                .unwrap_or_default();
            println!(
                "  - #{} {}{}: {} (after {} attempts)",
                failure.task_id, failure.url, status, failure.reason, failure.attempts
            );
        }
        println!();
    }

    println!(
        "Success Rate: {:.1}% ({} / {} tasks)",
        report.success_rate(),
        report.succeeded,
        report.total
    );
}
