//! Tidepool: a crawling-session engine
//!
//! This crate drives a growing pool of fetch and download tasks through a
//! concurrency-bounded, interval-throttled pipeline. Failed fetches are retried
//! a bounded number of times, completed results are dispatched to
//! pattern-matched rule handlers, and the session exposes pause, resume and
//! stop controls with drain detection that tolerates late task injection.

pub mod config;
pub mod document;
pub mod fetch;
pub mod output;
pub mod rules;
pub mod session;
pub mod state;
pub mod task;

use thiserror::Error;

/// Main error type for Tidepool operations
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: state::RunState,
        to: state::RunState,
    },
}

/// Configuration-specific errors
///
/// These surface synchronously: at settings validation, config loading, or
/// rule registration. Nothing in this enum is ever deferred to dispatch time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Invalid rule pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("Rule must have a pattern")]
    MissingPattern,

    #[error("Invalid headers file: {0}")]
    Headers(String),
}

/// Result type alias for Tidepool operations
pub type Result<T> = std::result::Result<T, CrawlError>;

// Re-export commonly used types
pub use config::{Interval, RequestConfig, Settings};
pub use document::{Document, DocumentParser, HtmlParser};
pub use fetch::{FetchError, FetchRequest, FetchResponse, Fetcher, HttpFetcher};
pub use output::{FailureRecord, SessionReport};
pub use rules::{Rule, RuleContext};
pub use session::{Crawler, CrawlerBuilder, EventSink, SessionEvent};
pub use state::{Counters, RunState};
pub use task::{Task, TaskOutcome, TaskResult, TaskSpec};
