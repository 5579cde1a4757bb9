//! The scheduling loop
//!
//! One task multiplexes every outstanding job: jobs are polled from a
//! `FuturesUnordered`, never spawned, so `concurrency` bounds outstanding
//! Fetcher calls rather than threads. Each pass of the loop:
//! 1. Starts a new cycle (pulls up to `tasks_size` from the backlog) when the
//!    previous one is fully done
//! 2. Fills free slots from the working set
//! 3. Waits for a job to finish or for a wake-up (admission, pause, resume,
//!    stop, tweak)
//!
//! With nothing left to run the drain protocol takes over: `Drained` is
//! emitted, the grace window starts, and any admission during the window sends
//! the loop back to work instead of finishing.

use super::state::CycleTokens;
use super::{Crawler, SessionEvent};
use crate::fetch::Verdict;
use crate::output::{FailureRecord, SessionReport};
use crate::rules::{ExpandFn, Handler, RuleContext, RuleRegistry};
use crate::state::RunState;
use crate::task::{Task, TaskOutcome, TaskResult};
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use tokio::sync::futures::Notified;

enum Step {
    /// Jobs are outstanding
    Poll,
    /// Paused with nothing running
    Wait,
    /// Nothing left to run
    Drain,
}

enum JobOutcome {
    /// Cancelled before it started fetching
    Frozen(Task),
    Done { task: Task, verdict: Verdict },
}

struct JobDone {
    seq: u64,
    url: String,
    outcome: std::thread::Result<JobOutcome>,
}

/// Where a completed task's result goes
enum Route {
    Handler {
        handler: Handler,
        rule: Option<String>,
        expand: Option<ExpandFn>,
    },
    /// No rule matched a non-empty registry
    Unmatched,
    /// Nothing registered at all
    Discard,
}

impl Route {
    fn resolve(rules: &RuleRegistry, task: &Task) -> Self {
        if let Some(handler) = &task.handler {
            return Self::Handler {
                handler: handler.clone(),
                rule: None,
                expand: None,
            };
        }

        match rules.resolve(task) {
            Some(rule) => Self::Handler {
                handler: rule.handler().clone(),
                rule: rule.name().map(str::to_string),
                expand: rule.expand_fn().cloned(),
            },
            None if rules.is_empty() => Self::Discard,
            None => Self::Unmatched,
        }
    }
}

impl Crawler {
    pub(super) async fn drive(&self) -> SessionReport {
        let mut jobs = FuturesUnordered::new();
        let mut announced = false;

        loop {
            let notified = self.shared.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (step, ready, cycle) = self.plan(jobs.len());
            if !ready.is_empty() {
                announced = false;
            }
            for task in ready {
                jobs.push(self.job(task, cycle.clone()));
            }

            match step {
                Step::Poll => {
                    tokio::select! {
                        biased;
                        Some(done) = jobs.next() => self.complete(done),
                        _ = &mut notified => {}
                    }
                }
                Step::Wait => notified.await,
                Step::Drain => {
                    if let Some(report) = self.drain(notified, &mut announced).await {
                        return report;
                    }
                }
            }
        }
    }

    /// Decides the next step and takes the tasks to start, under one lock
    fn plan(&self, running: usize) -> (Step, Vec<Task>, CycleTokens) {
        let mut state = self.state();
        let cycle = state.cycle.clone();
        let mut ready = Vec::new();

        if state.run_state.accepts_starts() {
            if running == 0 && state.active.is_empty() && !state.backlog.is_empty() {
                let pulled = state.refill();
                tracing::debug!(
                    "New cycle with {} tasks ({} left in backlog)",
                    pulled,
                    state.backlog.len()
                );
            }

            if state.run_state == RunState::Draining && !state.active.is_empty() {
                tracing::debug!("Tasks admitted during the grace window, back to running");
                state.run_state = RunState::Running;
            }

            let slots = state.settings.concurrency.saturating_sub(running);
            while ready.len() < slots {
                match state.active.pop_front() {
                    Some(task) => ready.push(task),
                    None => break,
                }
            }
        }

        let step = if running > 0 || !ready.is_empty() {
            Step::Poll
        } else if state.run_state == RunState::Paused {
            Step::Wait
        } else {
            Step::Drain
        };

        (step, ready, cycle)
    }

    /// Runs the grace window; returns the report if the session finished
    async fn drain(
        &self,
        notified: Pin<&mut Notified<'_>>,
        announced: &mut bool,
    ) -> Option<SessionReport> {
        let (counters, grace) = {
            let mut state = self.state();
            if state.run_state == RunState::Running {
                state.run_state = RunState::Draining;
            }
            (state.counters, state.settings.drain_await())
        };

        if !*announced {
            *announced = true;
            self.emit(SessionEvent::Drained { counters });
        }

        tokio::select! {
            biased;
            _ = notified => return None,
            _ = tokio::time::sleep(grace) => {}
        }

        let report = {
            let mut state = self.state();
            let idle = state.pending() == 0
                && matches!(state.run_state, RunState::Draining | RunState::Stopped);
            if !idle {
                return None;
            }
            state.run_state = RunState::Finished;
            SessionReport::new(state.counters, state.failures.clone(), state.started_at)
        };

        for failure in &report.failures {
            tracing::error!(
                "Failed: #{} {} after {} attempts: {}",
                failure.task_id,
                failure.url,
                failure.attempts,
                failure.reason
            );
        }
        self.emit(SessionEvent::Finished(report.clone()));
        Some(report)
    }

    fn job(&self, task: Task, cycle: CycleTokens) -> impl Future<Output = JobDone> + '_ {
        let seq = task.seq;
        let url = task.url.clone();
        async move {
            let outcome = AssertUnwindSafe(self.run_job(task, cycle))
                .catch_unwind()
                .await;
            JobDone { seq, url, outcome }
        }
    }

    /// Interval delay, then fetch with retries
    async fn run_job(&self, mut task: Task, cycle: CycleTokens) -> JobOutcome {
        let delay = self.state().settings.interval.sample();
        if !delay.is_zero() {
            tokio::select! {
                _ = cycle.gate.cancelled() => return JobOutcome::Frozen(task),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let started = self.state().begin(&mut task, &cycle);
        let Some((request, retry)) = started else {
            return JobOutcome::Frozen(task);
        };

        self.emit(SessionEvent::TaskStarting {
            id: task.id,
            url: task.url.clone(),
        });

        let verdict = retry
            .execute(
                self.shared.fetcher.as_ref(),
                &request,
                &mut task,
                |task, reason| {
                    self.state().record_attempt(task.seq, task.attempt_count);
                    self.emit(SessionEvent::TaskRetried {
                        id: task.id,
                        url: task.url.clone(),
                        attempt: task.attempt_count,
                        reason: reason.to_string(),
                    })
                },
            )
            .await;

        JobOutcome::Done { task, verdict }
    }

    fn complete(&self, done: JobDone) {
        match done.outcome {
            Ok(JobOutcome::Done { task, verdict }) => self.finish_task(task, verdict),
            Ok(JobOutcome::Frozen(task)) => {
                if !self.state().restore(task) {
                    tracing::debug!("Dropped {} after stop", done.url);
                }
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                let record = {
                    let mut state = self.state();
                    let record = state.in_flight.get(&done.seq).map(|entry| FailureRecord {
                        task_id: entry.id,
                        url: entry.url.clone(),
                        reason: format!("fetch panicked: {}", message),
                        status: None,
                        // The panicking attempt counts
                        attempts: entry.attempts + 1,
                        at: chrono::Utc::now(),
                    });
                    if let Some(record) = &record {
                        state.settle(done.seq, Some(record.clone()));
                    }
                    record
                };
                self.emit(SessionEvent::Error {
                    message: format!("Task {} panicked: {}", done.url, message),
                });
                if let Some(record) = record {
                    self.emit(SessionEvent::TaskFailed(record));
                }
            }
        }
    }

    fn finish_task(&self, mut task: Task, verdict: Verdict) {
        let (outcome, body, event) = match verdict {
            Verdict::Cancelled => {
                let mut state = self.state();
                state.roll_back(&task);
                if !state.restore(task) {
                    tracing::debug!("Dropped cancelled fetch after stop");
                }
                return;
            }
            Verdict::Content { status, body } => (TaskOutcome::Fetched { status }, Some(body), None),
            Verdict::Downloaded { path } => (TaskOutcome::Downloaded { path }, None, None),
            Verdict::NotFound => (
                TaskOutcome::NotFound,
                None,
                Some(SessionEvent::TaskNotFound {
                    id: task.id,
                    url: task.url.clone(),
                }),
            ),
            Verdict::Exhausted { reason, status } => {
                let record = failure_record(&task, &reason, status);
                (
                    TaskOutcome::Failed { reason },
                    None,
                    Some(SessionEvent::TaskRetryExhausted(record)),
                )
            }
            Verdict::Fatal { reason } => {
                let record = failure_record(&task, &reason, None);
                (
                    TaskOutcome::Failed { reason },
                    None,
                    Some(SessionEvent::TaskFailed(record)),
                )
            }
        };

        task.in_flight = false;
        let failure = match &event {
            Some(SessionEvent::TaskRetryExhausted(record) | SessionEvent::TaskFailed(record)) => {
                Some(record.clone())
            }
            _ => None,
        };

        let route = {
            let mut state = self.state();
            state.settle(task.seq, failure);
            Route::resolve(&state.rules, &task)
        };

        if let Some(event) = event {
            self.emit(event);
        }

        let result = TaskResult {
            task: task.snapshot(),
            body,
            outcome,
        };
        self.dispatch(&result, route);
    }

    /// Hands a result to its handler, isolating errors and panics
    fn dispatch(&self, result: &TaskResult, route: Route) {
        let (handler, rule, expand) = match route {
            Route::Handler {
                handler,
                rule,
                expand,
            } => (handler, rule, expand),
            Route::Unmatched => {
                self.emit(SessionEvent::NoRuleMatched {
                    url: result.task.url.clone(),
                });
                return;
            }
            Route::Discard => return,
        };

        let document = match (&result.body, result.task.is_download) {
            (Some(body), false) => Some(self.shared.parser.parse(&result.task.url, body)),
            _ => None,
        };

        let ctx = RuleContext {
            result,
            document: document.as_ref(),
            crawler: self,
            rule: rule.as_deref(),
            expand: expand.as_ref(),
        };

        let reason = match panic::catch_unwind(AssertUnwindSafe(|| handler(&ctx))) {
            Ok(Ok(())) => return,
            Ok(Err(e)) => format!("{:#}", e),
            Err(payload) => format!("handler panicked: {}", panic_message(payload.as_ref())),
        };

        self.emit(SessionEvent::HandlerFailed {
            id: result.task.id,
            url: result.task.url.clone(),
            reason,
        });
    }

    /// Logs the event, then hands it to every sink
    pub(crate) fn emit(&self, event: SessionEvent) {
        event.log();

        let sinks = self
            .shared
            .sinks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        for sink in sinks {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| sink.on_event(self, &event)));
            if let Err(payload) = delivered {
                tracing::error!("Event sink panicked: {}", panic_message(payload.as_ref()));
            }
        }
    }
}

fn failure_record(task: &Task, reason: &str, status: Option<u16>) -> FailureRecord {
    FailureRecord {
        task_id: task.id,
        url: task.url.clone(),
        reason: reason.to_string(),
        status,
        attempts: task.attempt_count,
        at: chrono::Utc::now(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
