//! Crawling session: admission, rule registration and lifecycle control
//!
//! A `Crawler` is a cheap handle (clone it freely) over one session. The
//! scheduling loop runs inside `start()`; every other operation only touches
//! the shared state and wakes the loop.
//!
//! # Example
//!
//! ```no_run
//! use tidepool::{Crawler, Settings};
//!
//! # async fn run() -> tidepool::Result<()> {
//! let crawler = Crawler::new(Settings::default())?;
//! crawler
//!     .add_rule("example.com/**", |ctx| {
//!         if let Some(doc) = ctx.document {
//!             ctx.expand(doc.links());
//!         }
//!         Ok(())
//!     })?
//!     .add_task("https://example.com/");
//!
//! let report = crawler.start().await?;
//! println!("{} tasks, {} failed", report.total, report.failed);
//! # Ok(())
//! # }
//! ```

mod dispatcher;
pub mod events;
mod state;

pub use events::{EventSink, SessionEvent};

use crate::config::{validate_settings, Settings};
use crate::document::{DocumentParser, HtmlParser};
use crate::fetch::{Fetcher, HttpFetcher};
use crate::output::{FailureRecord, SessionReport};
use crate::rules::{ExpandFn, Rule, RuleContext};
use crate::state::{Counters, RunState};
use crate::task::{DedupCache, Properties, TaskSpec};
use crate::{CrawlError, Result};
use state::{CycleTokens, SessionState};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::Instrument;

struct Shared {
    state: Mutex<SessionState>,
    /// Wakes the scheduling loop after admissions and lifecycle changes
    wakeup: Notify,
    fetcher: Arc<dyn Fetcher>,
    parser: Arc<dyn DocumentParser>,
    sinks: Mutex<Vec<Arc<dyn EventSink>>>,
}

/// Handle to a crawling session
#[derive(Clone)]
pub struct Crawler {
    shared: Arc<Shared>,
}

/// Builds a `Crawler` with custom collaborators
pub struct CrawlerBuilder {
    settings: Settings,
    fetcher: Option<Arc<dyn Fetcher>>,
    parser: Option<Arc<dyn DocumentParser>>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl CrawlerBuilder {
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Replaces the bundled HTTP fetcher
    pub fn fetcher(mut self, fetcher: impl Fetcher + 'static) -> Self {
        self.fetcher = Some(Arc::new(fetcher));
        self
    }

    /// Replaces the bundled HTML parser
    pub fn parser(mut self, parser: impl DocumentParser + 'static) -> Self {
        self.parser = Some(Arc::new(parser));
        self
    }

    pub fn event_sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    /// Validates the settings and creates the session
    pub fn build(self) -> Result<Crawler> {
        validate_settings(&self.settings)?;

        let fetcher: Arc<dyn Fetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new()?),
        };
        let parser = self.parser.unwrap_or_else(|| Arc::new(HtmlParser));

        Ok(Crawler {
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::new(self.settings)),
                wakeup: Notify::new(),
                fetcher,
                parser,
                sinks: Mutex::new(self.sinks),
            }),
        })
    }
}

impl Crawler {
    /// Creates a session that fetches over HTTP
    pub fn new(settings: Settings) -> Result<Self> {
        Self::builder().settings(settings).build()
    }

    pub fn builder() -> CrawlerBuilder {
        CrawlerBuilder {
            settings: Settings::default(),
            fetcher: None,
            parser: None,
            sinks: Vec::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self) {
        self.shared.wakeup.notify_waiters();
    }

    // ===== Admission =====

    /// Admits one task; a URL string is a page task
    pub fn add_task(&self, spec: impl Into<TaskSpec>) -> &Self {
        self.admit(vec![spec.into()], None);
        self
    }

    /// Admits a batch of tasks in order
    pub fn add_tasks<I, T>(&self, specs: I) -> &Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskSpec>,
    {
        self.admit(specs.into_iter().map(Into::into).collect(), None);
        self
    }

    /// Admits a batch of tasks, filling in `shared` properties each spec lacks
    pub fn add_tasks_with<I, T>(&self, specs: I, shared: &Properties) -> &Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskSpec>,
    {
        self.admit(specs.into_iter().map(Into::into).collect(), Some(shared));
        self
    }

    fn admit(&self, specs: Vec<TaskSpec>, shared: Option<&Properties>) -> usize {
        let offered = specs.len();
        let admitted = {
            let mut state = self.state();
            if !state.run_state.accepts_admissions() {
                tracing::debug!(
                    "Ignoring {} tasks admitted while {}",
                    offered,
                    state.run_state
                );
                return 0;
            }

            let mut admitted = 0;
            for mut spec in specs {
                if let Some(shared) = shared {
                    spec.merge_properties(shared);
                }
                if state.enqueue(spec) {
                    admitted += 1;
                }
            }
            admitted
        };

        if admitted > 0 {
            tracing::trace!("Admitted {} of {} tasks", admitted, offered);
            self.wake();
        }
        admitted
    }

    /// Collapses queued tasks with identical URLs; returns how many were removed
    pub fn uniq_tasks(&self) -> usize {
        let removed = self.state().uniq();
        if removed > 0 {
            tracing::debug!("Removed {} duplicate queued tasks", removed);
        }
        removed
    }

    // ===== Rules =====

    /// Registers a handler for URLs matching `pattern`
    ///
    /// An invalid pattern fails here, never at dispatch time.
    pub fn add_rule<F>(&self, pattern: &str, handler: F) -> Result<&Self>
    where
        F: Fn(&RuleContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let rule = Rule::new(pattern, handler)?;
        Ok(self.register(rule))
    }

    /// Registers a handler for every URL
    pub fn add_rule_fn<F>(&self, handler: F) -> &Self
    where
        F: Fn(&RuleContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(Rule::match_all(handler))
    }

    /// Registers a prepared rule
    pub fn register(&self, rule: Rule) -> &Self {
        self.state().rules.add(rule);
        self
    }

    /// Registers a rule whose `RuleContext::expand` calls go through `expand`
    pub fn load_rule(&self, rule: Rule, expand: Option<ExpandFn>) -> &Self {
        let rule = match expand {
            Some(expand) => rule.with_expand(expand),
            None => rule,
        };
        self.register(rule)
    }

    /// Removes the first rule named `name`; returns false if there is none
    pub fn remove_rule(&self, name: &str) -> bool {
        self.state().rules.remove(name)
    }

    pub fn rule_count(&self) -> usize {
        self.state().rules.len()
    }

    // ===== Lifecycle =====

    /// Runs the session until it finishes
    ///
    /// With nothing queued this returns an empty report at once and the
    /// session stays idle.
    pub async fn start(&self) -> Result<SessionReport> {
        let span = {
            let state = self.state();
            let id = state.settings.id.clone().unwrap_or_else(|| "-".to_string());
            tracing::info_span!("session", id = %id)
        };
        self.run().instrument(span).await
    }

    async fn run(&self) -> Result<SessionReport> {
        let tasks = {
            let mut state = self.state();
            if state.run_state != RunState::Idle {
                return Err(CrawlError::InvalidTransition {
                    from: state.run_state,
                    to: RunState::Running,
                });
            }
            if state.backlog.is_empty() {
                tracing::info!("No tasks admitted, nothing to crawl");
                return Ok(SessionReport::default());
            }
            if state.rules.ensure_fallback() {
                tracing::debug!("No rules registered, installed a match-all no-op rule");
            }

            state.run_state = RunState::Running;
            state.started_at = Some(chrono::Utc::now());
            state.cycle = CycleTokens::new();
            state.backlog.len()
        };

        self.emit(SessionEvent::Started { tasks });
        Ok(self.drive().await)
    }

    /// Stops starting new tasks; tasks already fetching run to completion
    pub fn pause(&self) -> Result<()> {
        let (frozen, in_flight) = {
            let mut state = self.state();
            if !state.run_state.can_transition_to(RunState::Paused) {
                return Err(CrawlError::InvalidTransition {
                    from: state.run_state,
                    to: RunState::Paused,
                });
            }
            state.cycle.pause();
            let frozen = state.freeze_active();
            state.run_state = RunState::Paused;
            (frozen, state.in_flight.len())
        };

        self.emit(SessionEvent::Paused { frozen, in_flight });
        self.wake();
        Ok(())
    }

    /// Puts frozen tasks back in front of the queue and continues
    pub fn resume(&self) -> Result<()> {
        let restored = {
            let mut state = self.state();
            if state.run_state != RunState::Paused {
                return Err(CrawlError::InvalidTransition {
                    from: state.run_state,
                    to: RunState::Running,
                });
            }
            let restored = state.thaw();
            state.cycle = CycleTokens::new();
            state.run_state = RunState::Running;
            restored
        };

        self.emit(SessionEvent::Resumed { restored });
        self.wake();
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        self.state().run_state == RunState::Paused
    }

    /// Drops every queued task and finishes once started tasks complete
    ///
    /// Tasks admitted after this call are ignored and the grace window is
    /// skipped.
    pub fn stop(&self) -> Result<()> {
        let dropped = {
            let mut state = self.state();
            if !state.run_state.can_transition_to(RunState::Stopped) {
                return Err(CrawlError::InvalidTransition {
                    from: state.run_state,
                    to: RunState::Stopped,
                });
            }
            state.cycle.stop();
            let dropped = state.drop_pending();
            state.settings.drain_await = 0;
            state.run_state = RunState::Stopped;
            dropped
        };

        self.emit(SessionEvent::Stopped { dropped });
        self.wake();
        Ok(())
    }

    /// Adjusts the settings of a live session
    ///
    /// The adjusted settings are validated as a whole; on error nothing changes.
    pub fn tweak<F>(&self, adjust: F) -> Result<()>
    where
        F: FnOnce(&mut Settings),
    {
        let mut settings = self.state().settings.clone();
        adjust(&mut settings);
        validate_settings(&settings)?;

        {
            let mut state = self.state();
            match (settings.dedup, state.dedup.is_some()) {
                (true, false) => state.dedup = Some(DedupCache::new()),
                (false, true) => state.dedup = None,
                _ => {}
            }
            state.settings = settings;
        }

        self.wake();
        Ok(())
    }

    // ===== Events =====

    /// Registers an event sink on a live session
    pub fn on_event(&self, sink: impl EventSink + 'static) -> &Self {
        self.shared
            .sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(sink));
        self
    }

    // ===== Inspection =====

    pub fn run_state(&self) -> RunState {
        self.state().run_state
    }

    pub fn counters(&self) -> Counters {
        self.state().counters
    }

    pub fn settings(&self) -> Settings {
        self.state().settings.clone()
    }

    /// Error log accumulated so far
    pub fn failures(&self) -> Vec<FailureRecord> {
        self.state().failures.clone()
    }

    /// Queued tasks that have not started
    pub fn pending(&self) -> usize {
        self.state().pending()
    }

    /// Tasks currently fetching
    pub fn in_flight(&self) -> usize {
        self.state().in_flight.len()
    }
}
