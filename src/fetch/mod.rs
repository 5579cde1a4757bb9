//! Fetcher collaborator and retry policy
//!
//! The session never talks to the network directly. It hands a `FetchRequest`
//! to a `Fetcher` and lets the `RetryController` decide, per attempt, whether
//! the outcome is content, a terminal not-found, a retryable failure, or a
//! fatal one.

mod http;
pub mod retry;

pub use http::{build_http_client, HttpFetcher, DEFAULT_USER_AGENT};
pub use retry::{RetryController, Verdict};

use crate::config::RequestConfig;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// File name used when a download URL has no usable last path segment
const FALLBACK_FILE_NAME: &str = "index.html";

/// Failures a Fetcher reports, kept apart from HTTP status failures
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Request timed out")]
    Timeout,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Filesystem error at {}: {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The fetcher observed the pause token and gave up
    #[error("Fetch cancelled")]
    Cancelled,
}

/// One fetch attempt as seen by the Fetcher
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,

    /// Session request defaults with the task's overrides applied
    pub config: RequestConfig,

    /// Where to stream the response; `Some` marks a download task
    pub destination: Option<PathBuf>,

    /// Cancelled when the session pauses; stopping leaves started fetches alone
    pub cancel: CancellationToken,
}

impl FetchRequest {
    pub fn is_download(&self) -> bool {
        self.destination.is_some()
    }
}

/// What a Fetcher returns when the server answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,

    /// Page body; always `None` for downloads
    pub body: Option<String>,
}

impl FetchResponse {
    pub fn page(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: Some(body.into()),
        }
    }

    pub fn status(status: u16) -> Self {
        Self { status, body: None }
    }
}

/// Network transport used by the session
///
/// Implementations must report network and timeout failures as `FetchError`
/// rather than as a status, so retries can be logged with the right kind. For
/// download requests the response must be written to `destination`, creating
/// missing parent directories.
///
/// Honouring `FetchRequest::cancel` is optional. A fetcher that does should
/// return `FetchError::Cancelled`; the task is then put back in the pool.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError>;
}

/// Resolves where a download task writes its file
///
/// An explicit target is taken relative to `download_dir` unless it is
/// absolute. Without one, the last path segment of the URL is used.
pub fn resolve_destination(download_dir: &Path, url: &str, target: Option<&str>) -> PathBuf {
    if let Some(target) = target {
        return download_dir.join(target);
    }

    let file_name = url::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|segment| !segment.is_empty())
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string());

    download_dir.join(file_name)
}
