//! The upstream API client seam.
//!
//! All traffic to the real API goes through [`UpstreamClient`], which keeps
//! the proxy testable: production uses [`HttpUpstream`] over a process-wide
//! `reqwest` pool, tests substitute a scripted client.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use thiserror::Error;

/// Ceiling for background checkpoint calls.
pub const CHECKPOINT_TIMEOUT: Duration = Duration::from_secs(120);

/// Safety net for user-path forwards; the client's own timeout governs.
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(600);

/// Transport-level failure talking to the upstream host.
#[derive(Debug, Error)]
#[error("upstream connection failed: {0}")]
pub struct UpstreamError(pub String);

/// A request bound for the upstream API.
#[derive(Clone, Debug)]
pub struct UpstreamRequest {
    pub method: String,
    /// Path plus optional query string, e.g. `/v1/messages?beta=true`.
    pub path_and_query: String,
    /// Header names are lowercase.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub timeout: Duration,
}

impl UpstreamRequest {
    /// A `POST` with the standard forward timeout.
    #[must_use]
    pub fn post(path_and_query: impl Into<String>, body: Bytes) -> Self {
        Self {
            method: "POST".to_string(),
            path_and_query: path_and_query.into(),
            headers: Vec::new(),
            body,
            timeout: FORWARD_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Body bytes as they arrive from upstream.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>>;

/// A response from the upstream API. The body is lazy; callers either pipe
/// it through to the client or collect it.
pub struct UpstreamResponse {
    pub status: u16,
    /// Header names are lowercase.
    pub headers: Vec<(String, String)>,
    pub body: ByteStream,
}

impl UpstreamResponse {
    /// Drain the body into one buffer.
    ///
    /// # Errors
    /// Returns an error if the connection drops mid-body.
    pub async fn collect_body(self) -> Result<Bytes, UpstreamError> {
        let chunks: Vec<Bytes> = self.body.try_collect().await?;
        Ok(chunks.concat().into())
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Client seam over the upstream API.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Send a request; transport failures (connect, timeout) are errors,
    /// HTTP error statuses are ordinary responses.
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError>;
}

/// Production implementation over a shared `reqwest` connection pool.
pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUpstream {
    /// Build a client for the given base URL.
    ///
    /// # Errors
    /// Returns an error if the underlying client cannot be constructed.
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstream {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        let url = format!("{}{}", self.base_url, request.path_and_query);
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|err| UpstreamError(err.to_string()))?;

        let mut builder = self
            .client
            .request(method, url)
            .timeout(request.timeout)
            .body(request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| UpstreamError(err.to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| UpstreamError(err.to_string())))
            .boxed();

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}
