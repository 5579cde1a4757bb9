use crate::config::Settings;
use crate::fetch::{resolve_destination, FetchRequest, RetryController};
use crate::output::FailureRecord;
use crate::rules::RuleRegistry;
use crate::state::{Counters, RunState};
use crate::task::{DedupCache, Task, TaskSpec};
use std::collections::{BTreeMap, HashSet, VecDeque};
use tokio_util::sync::CancellationToken;

/// A task that has been assigned an id and not yet reached a terminal outcome
#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    pub id: u64,
    pub url: String,
    /// Failed attempts reported by the retry loop so far
    pub attempts: u32,
}

/// Cancellation for the current run of the working set
///
/// `gate` holds back tasks that have not started fetching; pause and stop
/// both cancel it. `fetch` is the token handed to the Fetcher and only pause
/// cancels it, so tasks already fetching when the session stops still finish.
#[derive(Debug, Clone)]
pub(crate) struct CycleTokens {
    pub gate: CancellationToken,
    pub fetch: CancellationToken,
}

impl CycleTokens {
    pub fn new() -> Self {
        Self {
            gate: CancellationToken::new(),
            fetch: CancellationToken::new(),
        }
    }

    pub fn pause(&self) {
        self.gate.cancel();
        self.fetch.cancel();
    }

    pub fn stop(&self) {
        self.gate.cancel();
    }
}

/// Everything the session mutates, guarded by one lock
///
/// A queued task lives in exactly one of `backlog`, `active` or `frozen`, or
/// is owned by a running job. Started jobs are tracked in `in_flight` by
/// admission sequence.
pub(crate) struct SessionState {
    pub run_state: RunState,
    pub counters: Counters,

    /// Admitted tasks not yet pulled into a cycle
    pub backlog: VecDeque<Task>,

    /// The current cycle's working set, at most `tasks_size` at refill
    pub active: VecDeque<Task>,

    /// Tasks set aside by `pause()`
    pub frozen: Vec<Task>,

    pub in_flight: BTreeMap<u64, InFlight>,
    pub dedup: Option<DedupCache>,
    pub rules: RuleRegistry,
    pub settings: Settings,
    pub failures: Vec<FailureRecord>,
    pub next_id: u64,
    pub next_seq: u64,

    /// Replaced on start and resume
    pub cycle: CycleTokens,

    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl SessionState {
    pub fn new(settings: Settings) -> Self {
        Self {
            run_state: RunState::Idle,
            counters: Counters::default(),
            backlog: VecDeque::new(),
            active: VecDeque::new(),
            frozen: Vec::new(),
            in_flight: BTreeMap::new(),
            dedup: settings.dedup.then(DedupCache::new),
            rules: RuleRegistry::new(),
            settings,
            failures: Vec::new(),
            next_id: 0,
            next_seq: 0,
            cycle: CycleTokens::new(),
            started_at: None,
        }
    }

    /// Queued tasks that have not started
    pub fn pending(&self) -> usize {
        self.backlog.len() + self.active.len() + self.frozen.len()
    }

    /// Queues one task; returns false if dedup rejected it
    pub fn enqueue(&mut self, spec: TaskSpec) -> bool {
        if let Some(dedup) = self.dedup.as_mut() {
            if !dedup.admit(&spec.url) {
                tracing::trace!("Skipping duplicate task {}", spec.url);
                return false;
            }
        }

        self.next_seq += 1;
        self.backlog.push_back(Task::from_spec(spec, self.next_seq));
        true
    }

    /// Starts a new cycle by pulling up to `tasks_size` tasks from the backlog
    pub fn refill(&mut self) -> usize {
        let count = self.settings.tasks_size.min(self.backlog.len());
        let batch: Vec<Task> = self.backlog.drain(..count).collect();
        self.active.extend(batch);
        count
    }

    /// Moves the not-yet-started working set aside
    pub fn freeze_active(&mut self) -> usize {
        let count = self.active.len();
        self.frozen.extend(self.active.drain(..));
        count
    }

    /// Puts frozen tasks back at the head of the working set, in admission order
    pub fn thaw(&mut self) -> usize {
        let mut frozen = std::mem::take(&mut self.frozen);
        let count = frozen.len();
        frozen.sort_by_key(|task| task.seq);
        for task in frozen.into_iter().rev() {
            self.active.push_front(task);
        }
        count
    }

    /// Takes back a task whose job ended before it started fetching
    ///
    /// Returns false if the task was dropped because the session stopped.
    pub fn restore(&mut self, mut task: Task) -> bool {
        task.reset();
        match self.run_state {
            RunState::Stopped | RunState::Finished => false,
            RunState::Paused => {
                self.frozen.push(task);
                true
            }
            _ => {
                let position = self
                    .active
                    .iter()
                    .position(|queued| queued.seq > task.seq)
                    .unwrap_or(self.active.len());
                self.active.insert(position, task);
                true
            }
        }
    }

    /// Drops every task that has not started
    pub fn drop_pending(&mut self) -> usize {
        let dropped = self.pending();
        self.backlog.clear();
        self.active.clear();
        self.frozen.clear();
        dropped
    }

    /// Collapses queued tasks with identical URLs, keeping the earliest admission
    pub fn uniq(&mut self) -> usize {
        let before = self.pending();
        let mut seen = HashSet::new();

        let mut frozen = std::mem::take(&mut self.frozen);
        frozen.sort_by_key(|task| task.seq);
        frozen.retain(|task| seen.insert(task.url.clone()));
        self.active.retain(|task| seen.insert(task.url.clone()));
        self.backlog.retain(|task| seen.insert(task.url.clone()));
        self.frozen = frozen;

        before - self.pending()
    }

    /// Assigns an id and builds the fetch request, if the session still accepts starts
    pub fn begin(
        &mut self,
        task: &mut Task,
        cycle: &CycleTokens,
    ) -> Option<(FetchRequest, RetryController)> {
        if !self.run_state.accepts_starts() || cycle.gate.is_cancelled() {
            return None;
        }

        self.next_id += 1;
        task.id = self.next_id;
        task.in_flight = true;
        self.counters.admitted += 1;
        self.in_flight.insert(
            task.seq,
            InFlight {
                id: task.id,
                url: task.url.clone(),
                attempts: 0,
            },
        );

        let config = match &task.request {
            Some(overrides) => self.settings.request.merge(overrides),
            None => self.settings.request.clone(),
        };
        let destination = task.is_download.then(|| {
            resolve_destination(
                &self.settings.download_dir,
                &task.url,
                task.download_target.as_deref(),
            )
        });

        let request = FetchRequest {
            url: task.url.clone(),
            config,
            destination,
            cancel: cycle.fetch.clone(),
        };
        Some((request, RetryController::from_settings(&self.settings)))
    }

    /// Notes a failed attempt of a started task
    pub fn record_attempt(&mut self, seq: u64, attempts: u32) {
        if let Some(entry) = self.in_flight.get_mut(&seq) {
            entry.attempts = attempts;
        }
    }

    /// Undoes `begin` for a task whose fetch was cancelled
    pub fn roll_back(&mut self, task: &Task) {
        if self.in_flight.remove(&task.seq).is_some() {
            self.counters.admitted -= 1;
        }
    }

    /// Records a terminal outcome for a started task
    pub fn settle(&mut self, seq: u64, failure: Option<FailureRecord>) {
        if self.in_flight.remove(&seq).is_none() {
            return;
        }
        match failure {
            Some(record) => {
                self.counters.failed += 1;
                self.failures.push(record);
            }
            None => self.counters.succeeded += 1,
        }
    }
}
