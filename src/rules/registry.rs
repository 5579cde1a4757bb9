use crate::document::Document;
use crate::rules::pattern::Pattern;
use crate::session::Crawler;
use crate::task::{Properties, Task, TaskResult, TaskSpec};
use crate::ConfigError;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Result handler bound to a rule (or to a single task)
pub type Handler = Arc<dyn Fn(&RuleContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Extra match condition evaluated against the completed task
pub type Predicate = Arc<dyn Fn(&Task) -> bool + Send + Sync>;

/// Expansion callback bound to a rule by `Crawler::load_rule`
pub type ExpandFn = Arc<dyn Fn(&Crawler, Vec<TaskSpec>) + Send + Sync>;

/// Everything a handler sees for one completed task
pub struct RuleContext<'a> {
    pub result: &'a TaskResult,

    /// Parsed page; `None` for downloads and for tasks without a body
    pub document: Option<&'a Document>,

    /// The session, for admitting follow-up tasks
    pub crawler: &'a Crawler,

    /// Name of the rule that matched, if it has one
    pub rule: Option<&'a str>,

    pub(crate) expand: Option<&'a ExpandFn>,
}

impl RuleContext<'_> {
    pub fn task(&self) -> &Task {
        &self.result.task
    }

    pub fn body(&self) -> Option<&str> {
        self.result.body.as_deref()
    }

    /// Hands discovered tasks to the rule's expansion callback
    ///
    /// Without a callback the tasks are admitted to the session directly.
    pub fn expand<I, T>(&self, specs: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskSpec>,
    {
        let specs: Vec<TaskSpec> = specs.into_iter().map(Into::into).collect();
        match self.expand {
            Some(expand) => expand(self.crawler, specs),
            None => {
                self.crawler.add_tasks(specs);
            }
        }
    }
}

/// A pattern plus optional attribute filter and predicate, bound to a handler
#[derive(Clone)]
pub struct Rule {
    name: Option<String>,
    pattern: Pattern,
    filter: Properties,
    predicate: Option<Predicate>,
    handler: Handler,
    expand: Option<ExpandFn>,
}

impl Rule {
    /// Creates a rule for URLs matching `pattern`
    pub fn new<F>(pattern: &str, handler: F) -> Result<Self, ConfigError>
    where
        F: Fn(&RuleContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::from_parts(Some(pattern), Arc::new(handler))
    }

    /// Creates a rule matching every URL
    pub fn match_all<F>(handler: F) -> Self
    where
        F: Fn(&RuleContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::with_pattern(Pattern::match_all(), Arc::new(handler))
    }

    /// Creates a rule from an optional pattern, as read from configuration
    ///
    /// A missing pattern is a configuration error rather than an implicit
    /// match-all: only a bare handler means "match everything".
    pub fn from_parts(pattern: Option<&str>, handler: Handler) -> Result<Self, ConfigError> {
        let pattern = pattern.ok_or(ConfigError::MissingPattern)?;
        Ok(Self::with_pattern(Pattern::compile(pattern)?, handler))
    }

    fn with_pattern(pattern: Pattern, handler: Handler) -> Self {
        Self {
            name: None,
            pattern,
            filter: Properties::new(),
            predicate: None,
            handler,
            expand: None,
        }
    }

    /// Names the rule so it can be removed later
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Requires a task property to be present and equal to `value`
    pub fn filter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.insert(key.into(), value.into());
        self
    }

    /// Replaces the whole attribute filter
    pub fn filters(mut self, filter: Properties) -> Self {
        self.filter = filter;
        self
    }

    /// Adds a predicate the task must satisfy
    pub fn predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&Task) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub(crate) fn with_expand(mut self, expand: ExpandFn) -> Self {
        self.expand = Some(expand);
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub(crate) fn handler(&self) -> &Handler {
        &self.handler
    }

    pub(crate) fn expand_fn(&self) -> Option<&ExpandFn> {
        self.expand.as_ref()
    }

    /// Checks the pattern, then the attribute filter, then the predicate
    pub fn matches(&self, task: &Task) -> bool {
        if !self.pattern.is_match(task.url()) {
            return false;
        }

        let filter_ok = self
            .filter
            .iter()
            .all(|(key, expected)| task.property(key) == Some(expected));
        if !filter_ok {
            return false;
        }

        self.predicate
            .as_ref()
            .map_or(true, |predicate| predicate(task))
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("pattern", &self.pattern)
            .field("filter", &self.filter)
            .field("has_predicate", &self.predicate.is_some())
            .field("has_expand", &self.expand.is_some())
            .finish()
    }
}

/// Ordered list of rules; first match wins
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    rules: Vec<Rule>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, rule: Rule) {
        tracing::debug!(
            "Registered rule {} for pattern '{}'",
            rule.name().unwrap_or("<unnamed>"),
            rule.pattern().source()
        );
        self.rules.push(rule);
    }

    /// Removes the first rule named `name`; returns false if there is none
    pub fn remove(&mut self, name: &str) -> bool {
        match self.rules.iter().position(|r| r.name() == Some(name)) {
            Some(index) => {
                self.rules.remove(index);
                true
            }
            None => false,
        }
    }

    /// Returns the first rule, in registration order, that matches `task`
    pub fn resolve(&self, task: &Task) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.matches(task))
    }

    /// Installs a match-all no-op rule if no rule is registered
    ///
    /// Returns true if the fallback was installed.
    pub fn ensure_fallback(&mut self) -> bool {
        if !self.rules.is_empty() {
            return false;
        }
        self.rules.push(Rule::match_all(|_| Ok(())));
        true
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
