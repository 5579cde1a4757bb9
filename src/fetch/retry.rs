//! Per-task retry policy
//!
//! | Outcome of an attempt          | Action                              |
//! |--------------------------------|-------------------------------------|
//! | 2xx                            | Done: content (or downloaded file)  |
//! | 404                            | Done: not found, no retry, no failure |
//! | Any other status               | Retry after `interval`              |
//! | Timeout / connect / network    | Retry after `interval`              |
//! | Filesystem error               | Fatal, no retry                     |
//! | Cancelled                      | Handed back to the session          |
//!
//! A task is given up once its attempt count reaches the retry limit.

use super::{FetchError, FetchRequest, FetchResponse, Fetcher};
use crate::config::{Interval, Settings};
use crate::task::Task;
use std::path::PathBuf;

/// Terminal result of running a task through the retry loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Page fetched with a 2xx status
    Content { status: u16, body: String },

    /// Download written to its destination
    Downloaded { path: PathBuf },

    /// 404; not retried and not a failure
    NotFound,

    /// Every attempt failed transiently
    Exhausted { reason: String, status: Option<u16> },

    /// Failed in a way retrying cannot fix
    Fatal { reason: String },

    /// The fetcher honoured the cancellation token
    Cancelled,
}

/// Classification of a single attempt
#[derive(Debug, PartialEq, Eq)]
enum Attempt {
    Success { status: u16, body: Option<String> },
    NotFound,
    Transient { reason: String, status: Option<u16> },
    Fatal { reason: String },
    Cancelled,
}

fn classify(result: Result<FetchResponse, FetchError>) -> Attempt {
    match result {
        Ok(response) if (200..300).contains(&response.status) => Attempt::Success {
            status: response.status,
            body: response.body,
        },
        Ok(response) if response.status == 404 => Attempt::NotFound,
        Ok(response) => Attempt::Transient {
            reason: format!("HTTP {}", response.status),
            status: Some(response.status),
        },
        Err(FetchError::Cancelled) => Attempt::Cancelled,
        Err(e @ FetchError::Filesystem { .. }) => Attempt::Fatal {
            reason: e.to_string(),
        },
        Err(e) => Attempt::Transient {
            reason: e.to_string(),
            status: None,
        },
    }
}

/// Drives one task's attempts against a Fetcher
#[derive(Debug, Clone, Copy)]
pub struct RetryController {
    retry_limit: u32,
    interval: Interval,
}

impl RetryController {
    /// A limit of 0 is treated as 1: the task is attempted once
    pub fn new(retry_limit: u32, interval: Interval) -> Self {
        Self {
            retry_limit: retry_limit.max(1),
            interval,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.retry_limit, settings.interval)
    }

    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    /// Fetches until a terminal verdict is reached
    ///
    /// Each transient failure increments `task.attempt_count`. `on_retry` is
    /// called with the failure reason before every retry; it is not called for
    /// the final, exhausting failure. Page attempts are bounded by the request
    /// timeout whatever the Fetcher itself does. Downloads are not: a transfer
    /// may outlast the timeout as long as data keeps arriving, and bounding each
    /// wait is left to the Fetcher.
    pub async fn execute<F>(
        &self,
        fetcher: &dyn Fetcher,
        request: &FetchRequest,
        task: &mut Task,
        mut on_retry: F,
    ) -> Verdict
    where
        F: FnMut(&Task, &str),
    {
        loop {
            let attempt = fetcher.fetch(request);
            let result = if request.is_download() {
                attempt.await
            } else {
                match tokio::time::timeout(request.config.timeout(), attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::Timeout),
                }
            };

            match classify(result) {
                Attempt::Success { status, body } => {
                    return match &request.destination {
                        Some(path) => Verdict::Downloaded { path: path.clone() },
                        None => Verdict::Content {
                            status,
                            body: body.unwrap_or_default(),
                        },
                    };
                }
                Attempt::NotFound => return Verdict::NotFound,
                Attempt::Cancelled => return Verdict::Cancelled,
                Attempt::Fatal { reason } => {
                    task.attempt_count += 1;
                    return Verdict::Fatal { reason };
                }
                Attempt::Transient { reason, status } => {
                    task.attempt_count += 1;
                    if task.attempt_count >= self.retry_limit {
                        return Verdict::Exhausted { reason, status };
                    }
                    on_retry(task, &reason);
                    tokio::time::sleep(self.interval.sample()).await;
                }
            }
        }
    }
}
