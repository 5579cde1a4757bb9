use rand::Rng;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Request timeout used when neither the session nor the task sets one
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Delay inserted before each task's fetch
///
/// In TOML this is either a single number of milliseconds (`interval = 1500`)
/// or a two-element range (`interval = [500, 2000]`), in which case a uniformly
/// distributed delay is drawn per task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Interval {
    /// Fixed delay in milliseconds
    Fixed(u64),
    /// Inclusive `[min, max]` range in milliseconds
    Range(u64, u64),
}

impl Interval {
    /// Creates a fixed interval
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed(millis(delay))
    }

    /// Creates a jittered interval
    pub fn range(min: Duration, max: Duration) -> Self {
        Self::Range(millis(min), millis(max))
    }

    /// Returns the `(min, max)` bounds in milliseconds
    pub fn bounds(&self) -> (u64, u64) {
        match *self {
            Self::Fixed(ms) => (ms, ms),
            Self::Range(min, max) => (min, max),
        }
    }

    /// Draws the delay to apply before the next fetch
    pub fn sample(&self) -> Duration {
        match *self {
            Self::Fixed(ms) => Duration::from_millis(ms),
            Self::Range(min, max) if min >= max => Duration::from_millis(min),
            Self::Range(min, max) => Duration::from_millis(rand::thread_rng().gen_range(min..=max)),
        }
    }
}

/// Whole milliseconds, saturating at `u64::MAX`
fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

impl Default for Interval {
    fn default() -> Self {
        Self::Fixed(0)
    }
}

/// Per-request options, layered session defaults first and task overrides second
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Longest wait for the response, a page body, or one download chunk (milliseconds)
    pub timeout: Option<u64>,

    /// User agent header
    #[serde(rename = "user-agent")]
    pub user_agent: Option<String>,

    /// Proxy URL applied to every request of this config
    pub proxy: Option<String>,

    /// Extra request headers
    pub headers: BTreeMap<String, String>,

    /// File with one `Name: value` header per line, merged into `headers` on load
    #[serde(rename = "headers-file")]
    pub headers_file: Option<PathBuf>,
}

impl RequestConfig {
    /// Effective request timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout.unwrap_or(DEFAULT_TIMEOUT_MS))
    }

    /// Layers `overrides` on top of `self`
    ///
    /// Scalar fields set in `overrides` win; header maps are unioned with the
    /// override's values taking precedence.
    pub fn merge(&self, overrides: &RequestConfig) -> RequestConfig {
        let mut headers = self.headers.clone();
        headers.extend(
            overrides
                .headers
                .iter()
                .map(|(name, value)| (name.clone(), value.clone())),
        );

        RequestConfig {
            timeout: overrides.timeout.or(self.timeout),
            user_agent: overrides
                .user_agent
                .clone()
                .or_else(|| self.user_agent.clone()),
            proxy: overrides.proxy.clone().or_else(|| self.proxy.clone()),
            headers,
            headers_file: None,
        }
    }
}

/// Session settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Session identifier, attached to every log line of the session
    pub id: Option<String>,

    /// Delay before each task's fetch and before each retry
    pub interval: Interval,

    /// Number of failed attempts after which a task is given up
    #[serde(rename = "retry-limit")]
    pub retry_limit: u32,

    /// Maximum number of simultaneously outstanding fetches
    pub concurrency: usize,

    /// Reject URLs that were already admitted
    pub dedup: bool,

    /// Maximum number of tasks pulled from the backlog per dispatcher cycle
    #[serde(rename = "tasks-size")]
    pub tasks_size: usize,

    /// Grace window after drain before the session finishes (milliseconds)
    #[serde(rename = "drain-await")]
    pub drain_await: u64,

    /// Base directory for download tasks
    #[serde(rename = "download-dir")]
    pub download_dir: PathBuf,

    /// Request defaults merged into every task's request
    pub request: RequestConfig,
}

impl Settings {
    /// Grace window as a duration
    pub fn drain_await(&self) -> Duration {
        Duration::from_millis(self.drain_await)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            id: None,
            interval: Interval::default(),
            retry_limit: 3,
            concurrency: 1,
            dedup: false,
            tasks_size: 50,
            drain_await: 0,
            download_dir: PathBuf::from("."),
            request: RequestConfig::default(),
        }
    }
}

/// Configuration file consumed by the `tidepool` binary
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: Settings,

    #[serde(rename = "seed", default)]
    pub seeds: Vec<SeedEntry>,

    #[serde(rename = "rule", default)]
    pub rules: Vec<RuleEntry>,
}

/// A task admitted before the session starts
#[derive(Debug, Clone, Deserialize)]
pub struct SeedEntry {
    pub url: String,

    /// Stream the response to disk instead of parsing it
    #[serde(default)]
    pub download: bool,

    /// Destination file, relative to the download directory
    #[serde(default)]
    pub target: Option<String>,

    /// Custom properties carried through to rule handlers
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// Built-in handlers available to rules declared in the config file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleAction {
    /// Queue every link on the page (optionally only those matching `follow`)
    FollowLinks,
    /// Log the page title
    LogTitle,
    /// Queue every image on the page as a download task
    DownloadImages,
}

/// A rule declared in the config file
#[derive(Debug, Clone, Deserialize)]
pub struct RuleEntry {
    #[serde(default)]
    pub name: Option<String>,

    /// URL pattern (glob-flavoured regex)
    #[serde(default)]
    pub pattern: Option<String>,

    pub action: RuleAction,

    /// Only links matching this pattern are followed (`follow-links` only)
    #[serde(default)]
    pub follow: Option<String>,

    /// Attribute filter matched against task properties
    #[serde(default)]
    pub filter: Map<String, Value>,
}
