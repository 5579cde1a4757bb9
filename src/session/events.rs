//! Notifications surfaced to the outside world
//!
//! Every event is logged through `tracing` before it reaches the registered
//! sinks, so a session with no sinks still leaves a full trail in the logs.

use super::Crawler;
use crate::output::{FailureRecord, SessionReport};
use crate::state::Counters;

/// Structured session notification
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// `start()` began running with this many tasks queued
    Started { tasks: usize },

    /// A task was assigned its id and is about to be fetched
    TaskStarting { id: u64, url: String },

    /// A transient failure; the task will be fetched again
    TaskRetried {
        id: u64,
        url: String,
        attempt: u32,
        reason: String,
    },

    /// Every attempt failed; the task counts as failed
    TaskRetryExhausted(FailureRecord),

    /// A non-retryable failure, such as an unwritable download directory or a
    /// panicking fetch
    TaskFailed(FailureRecord),

    /// The server reported the resource missing; not a failure
    TaskNotFound { id: u64, url: String },

    /// No registered rule matched a completed task
    NoRuleMatched { url: String },

    /// A handler returned an error or panicked
    HandlerFailed { id: u64, url: String, reason: String },

    Paused { frozen: usize, in_flight: usize },

    Resumed { restored: usize },

    /// Pending tasks were dropped; started ones keep running
    Stopped { dropped: usize },

    /// All admitted work is done; the grace window starts now
    Drained { counters: Counters },

    Finished(SessionReport),

    /// A scheduling-loop error that did not halt the session
    Error { message: String },
}

impl SessionEvent {
    pub(crate) fn log(&self) {
        match self {
            Self::Started { tasks } => tracing::info!("Session started with {} tasks", tasks),
            Self::TaskStarting { id, url } => tracing::debug!("Task #{} starting: {}", id, url),
            Self::TaskRetried {
                id,
                url,
                attempt,
                reason,
            } => tracing::warn!("Task #{} {} failed (attempt {}): {}, retrying", id, url, attempt, reason),
            Self::TaskRetryExhausted(record) => tracing::error!(
                "Task #{} {} gave up after {} attempts: {}",
                record.task_id,
                record.url,
                record.attempts,
                record.reason
            ),
            Self::TaskFailed(record) => {
                tracing::error!("Task #{} {} failed: {}", record.task_id, record.url, record.reason)
            }
            Self::TaskNotFound { id, url } => tracing::info!("Task #{} not found: {}", id, url),
            Self::NoRuleMatched { url } => tracing::warn!("No rule matched {}", url),
            Self::HandlerFailed { id, url, reason } => {
                tracing::error!("Handler for task #{} {} failed: {}", id, url, reason)
            }
            Self::Paused { frozen, in_flight } => tracing::info!(
                "Session paused ({} tasks frozen, {} still in flight)",
                frozen,
                in_flight
            ),
            Self::Resumed { restored } => {
                tracing::info!("Session resumed ({} tasks restored)", restored)
            }
            Self::Stopped { dropped } => {
                tracing::info!("Session stopped ({} pending tasks dropped)", dropped)
            }
            Self::Drained { counters } => tracing::info!(
                "Pool drained: {} admitted, {} completed",
                counters.admitted,
                counters.completed()
            ),
            Self::Finished(report) => tracing::info!(
                "Session finished: {} total, {} succeeded, {} failed",
                report.total,
                report.succeeded,
                report.failed
            ),
            Self::Error { message } => tracing::error!("Session error: {}", message),
        }
    }
}

/// Receives session events
///
/// Sinks are called synchronously from the scheduling loop (or from the
/// thread calling `pause`, `resume` or `stop`) and must not block. They may
/// call back into the crawler, for example to admit tasks on `Drained`.
pub trait EventSink: Send + Sync {
    fn on_event(&self, crawler: &Crawler, event: &SessionEvent);
}

impl<F> EventSink for F
where
    F: Fn(&Crawler, &SessionEvent) + Send + Sync,
{
    fn on_event(&self, crawler: &Crawler, event: &SessionEvent) {
        self(crawler, event)
    }
}
