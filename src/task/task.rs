use crate::config::RequestConfig;
use crate::rules::{Handler, RuleContext};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Open key/value side-map carried from admission through to rule handlers
pub type Properties = Map<String, Value>;

/// Caller-facing description of a task to admit
///
/// Anything that converts into a `TaskSpec` can be passed to
/// `Crawler::add_task`, so plain URL strings work directly.
#[derive(Clone)]
pub struct TaskSpec {
    pub url: String,
    pub download: bool,
    pub download_target: Option<String>,
    pub request: Option<RequestConfig>,
    pub properties: Properties,
    handler: Option<Handler>,
}

impl TaskSpec {
    /// A page task: fetched, parsed and dispatched to the matching rule
    pub fn page(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            download: false,
            download_target: None,
            request: None,
            properties: Properties::new(),
            handler: None,
        }
    }

    /// A download task: the response is streamed into the download directory
    pub fn download(url: impl Into<String>) -> Self {
        Self {
            download: true,
            ..Self::page(url)
        }
    }

    /// Sets the destination file of a download task
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.download_target = Some(target.into());
        self
    }

    /// Sets one custom property
    pub fn property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Sets request overrides merged on top of the session's request defaults
    pub fn request(mut self, request: RequestConfig) -> Self {
        self.request = Some(request);
        self
    }

    /// Attaches a handler that receives this task's result instead of the rule registry
    pub fn handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&RuleContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Fills in shared properties this task does not already set
    pub(crate) fn merge_properties(&mut self, shared: &Properties) {
        for (key, value) in shared {
            self.properties
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
}

impl From<&str> for TaskSpec {
    fn from(url: &str) -> Self {
        Self::page(url)
    }
}

impl From<String> for TaskSpec {
    fn from(url: String) -> Self {
        Self::page(url)
    }
}

impl From<&String> for TaskSpec {
    fn from(url: &String) -> Self {
        Self::page(url.as_str())
    }
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("url", &self.url)
            .field("download", &self.download)
            .field("download_target", &self.download_target)
            .field("properties", &self.properties)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

/// One unit of fetch-or-download work owned by the session
#[derive(Clone)]
pub struct Task {
    pub(crate) id: u64,
    pub(crate) url: String,
    pub(crate) is_download: bool,
    pub(crate) download_target: Option<String>,
    pub(crate) request: Option<RequestConfig>,
    pub(crate) properties: Properties,
    pub(crate) attempt_count: u32,
    pub(crate) in_flight: bool,
    /// Admission order, used to keep the pool FIFO across pause and resume
    pub(crate) seq: u64,
    pub(crate) handler: Option<Handler>,
}

impl Task {
    pub(crate) fn from_spec(spec: TaskSpec, seq: u64) -> Self {
        Self {
            id: 0,
            url: spec.url,
            is_download: spec.download,
            download_target: spec.download_target,
            request: spec.request,
            properties: spec.properties,
            attempt_count: 0,
            in_flight: false,
            seq,
            handler: spec.handler,
        }
    }

    /// Execution id, assigned when the task begins fetching
    pub fn id(&self) -> Option<u64> {
        (self.id > 0).then_some(self.id)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_download(&self) -> bool {
        self.is_download
    }

    pub fn download_target(&self) -> Option<&str> {
        self.download_target.as_deref()
    }

    /// Task-level request overrides
    pub fn request(&self) -> Option<&RequestConfig> {
        self.request.as_ref()
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Number of failed fetch attempts so far
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Copy of the task handed to handlers, without its own handler
    pub fn snapshot(&self) -> Task {
        Task {
            handler: None,
            ..self.clone()
        }
    }

    /// Returns the task to its never-started shape
    pub(crate) fn reset(&mut self) {
        self.id = 0;
        self.attempt_count = 0;
        self.in_flight = false;
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("is_download", &self.is_download)
            .field("download_target", &self.download_target)
            .field("properties", &self.properties)
            .field("attempt_count", &self.attempt_count)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

/// Terminal outcome of a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Page fetched with a success status
    Fetched { status: u16 },

    /// Download written to disk
    Downloaded { path: PathBuf },

    /// The resource does not exist; not retried and not a failure
    NotFound,

    /// Retries exhausted or a fatal error; counted as a failure
    Failed { reason: String },
}

impl TaskOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// What a rule handler receives when a task completes
#[derive(Debug, Clone)]
pub struct TaskResult {
    /// Snapshot of the task, handlers excluded
    pub task: Task,

    /// Page body; `None` for downloads, not-found and failed tasks
    pub body: Option<String>,

    pub outcome: TaskOutcome,
}
