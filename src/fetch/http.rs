//! HTTP fetcher implementation
//!
//! `HttpFetcher` is the bundled `Fetcher`. It handles:
//! - Building HTTP clients with a default user agent string
//! - GET requests for page content
//! - Streaming download responses to disk
//! - Error classification (timeout vs connect vs other network failures)
//!
//! The request timeout bounds each wait rather than the whole transfer: the
//! response headers, the page body, and every chunk of a download. A download
//! is written to `<name>.part` next to its destination and renamed once
//! complete, so a failed transfer never leaves a truncated file behind.
//!
//! It does not observe the cancellation token: a request already sent runs
//! to completion even if the session pauses.

use super::{FetchError, FetchRequest, FetchResponse, Fetcher};
use async_trait::async_trait;
use reqwest::{header::USER_AGENT, Client, Proxy, Response};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// User agent sent when the request config does not set one
pub const DEFAULT_USER_AGENT: &str = concat!("tidepool/", env!("CARGO_PKG_VERSION"));

/// Builds an HTTP client with proper configuration
///
/// Request timeouts are applied by the fetcher on each wait, so only the
/// connect timeout is fixed here.
///
/// # Example
///
/// ```no_run
/// use tidepool::fetch::build_http_client;
///
/// let client = build_http_client(None).unwrap();
/// let proxied = build_http_client(Some("http://127.0.0.1:8080")).unwrap();
/// ```
pub fn build_http_client(proxy: Option<&str>) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder()
        .user_agent(DEFAULT_USER_AGENT)
        .connect_timeout(Duration::from_secs(10))
        .gzip(true)
        .brotli(true);

    if let Some(proxy) = proxy {
        builder = builder.proxy(Proxy::all(proxy)?);
    }

    builder.build()
}

/// `Fetcher` backed by `reqwest`
pub struct HttpFetcher {
    client: Client,
    /// One client per proxy URL, built on first use
    proxied: Mutex<HashMap<String, Client>>,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, reqwest::Error> {
        Ok(Self::with_client(build_http_client(None)?))
    }

    /// Uses `client` for every request that does not name a proxy
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            proxied: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, proxy: Option<&str>) -> Result<Client, FetchError> {
        let Some(proxy) = proxy else {
            return Ok(self.client.clone());
        };

        let mut clients = self.proxied.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(proxy) {
            return Ok(client.clone());
        }

        let client = build_http_client(Some(proxy))
            .map_err(|e| FetchError::Network(format!("invalid proxy {}: {}", proxy, e)))?;
        clients.insert(proxy.to_string(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let client = self.client_for(request.config.proxy.as_deref())?;
        let timeout = request.config.timeout();

        let mut builder = client.get(&request.url);
        if let Some(user_agent) = &request.config.user_agent {
            builder = builder.header(USER_AGENT, user_agent.as_str());
        }
        for (name, value) in &request.config.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = within(timeout, builder.send()).await?;
        let status = response.status();

        match &request.destination {
            Some(path) if status.is_success() => {
                write_to_file(response, path, timeout).await?;
                tracing::debug!("Downloaded {} to {}", request.url, path.display());
                Ok(FetchResponse::status(status.as_u16()))
            }
            Some(_) => Ok(FetchResponse::status(status.as_u16())),
            None => {
                let body = within(timeout, response.text()).await?;
                Ok(FetchResponse::page(status.as_u16(), body))
            }
        }
    }
}

/// Awaits one network step, failing with `Timeout` if it takes longer than `limit`
async fn within<T, F>(limit: Duration, step: F) -> Result<T, FetchError>
where
    F: Future<Output = Result<T, reqwest::Error>>,
{
    match tokio::time::timeout(limit, step).await {
        Ok(result) => result.map_err(classify_error),
        Err(_) => Err(FetchError::Timeout),
    }
}

/// Where a download is written until it completes
fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

/// Streams a response body into `path`, creating parent directories
///
/// `idle` bounds the wait for each chunk. On any error the partial file is
/// removed and `path` is left untouched.
async fn write_to_file(response: Response, path: &Path, idle: Duration) -> Result<(), FetchError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|source| FetchError::Filesystem {
                path: parent.to_path_buf(),
                source,
            })?;
    }

    let partial = partial_path(path);
    let written = match stream_body(response, &partial, idle).await {
        Ok(()) => fs::rename(&partial, path)
            .await
            .map_err(|source| FetchError::Filesystem {
                path: path.to_path_buf(),
                source,
            }),
        Err(e) => Err(e),
    };

    if written.is_err() {
        if let Err(e) = fs::remove_file(&partial).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Could not remove {}: {}", partial.display(), e);
            }
        }
    }
    written
}

async fn stream_body(mut response: Response, path: &Path, idle: Duration) -> Result<(), FetchError> {
    let fs_error = |source: std::io::Error| FetchError::Filesystem {
        path: path.to_path_buf(),
        source,
    };

    let mut file = fs::File::create(path).await.map_err(fs_error)?;
    while let Some(chunk) = within(idle, response.chunk()).await? {
        file.write_all(&chunk).await.map_err(fs_error)?;
    }
    file.flush().await.map_err(fs_error)?;

    Ok(())
}

fn classify_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else if e.is_connect() {
        FetchError::Connect(e.to_string())
    } else {
        FetchError::Network(e.to_string())
    }
}
