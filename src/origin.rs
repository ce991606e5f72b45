//! Origin fetch: where a cache miss goes.

use std::future::Future;
use std::time::Duration;

use reqwest::Method;
use tracing::debug;

/// A request to the origin. Its URL doubles as the cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginRequest {
    pub url: String,
    /// Request body. Its presence turns the default method into POST.
    pub data: Option<Vec<u8>>,
    pub headers: Vec<(String, String)>,
    /// Explicit method; defaults to GET, or POST when `data` is set.
    pub method: Option<String>,
}

impl OriginRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Method this request is sent with.
    pub fn effective_method(&self) -> String {
        match (&self.method, &self.data) {
            (Some(method), _) => method.to_ascii_uppercase(),
            (None, Some(_)) => "POST".to_string(),
            (None, None) => "GET".to_string(),
        }
    }
}

/// Origin fetch failures. These reach the caller unchanged.
#[derive(Debug, thiserror::Error)]
pub enum OriginError {
    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),
    #[error("Origin request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Origin unavailable: {0}")]
    Unavailable(String),
}

/// Fetches the raw response body for a request.
pub trait OriginFetcher: Send + Sync + 'static {
    fn fetch(
        &self,
        request: &OriginRequest,
    ) -> impl Future<Output = Result<Vec<u8>, OriginError>> + Send;
}

/// [`OriginFetcher`] over HTTP(S). Non-success statuses are errors.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Bound connection set-up to `timeout`. Fails if the HTTP backend
    /// cannot be initialized.
    pub fn with_connect_timeout(timeout: Duration) -> Result<Self, OriginError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Use a preconfigured client (timeouts, proxies, TLS roots).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl OriginFetcher for HttpFetcher {
    async fn fetch(&self, request: &OriginRequest) -> Result<Vec<u8>, OriginError> {
        let method_name = request.effective_method();
        let method = Method::from_bytes(method_name.as_bytes())
            .map_err(|_| OriginError::InvalidMethod(method_name.clone()))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(ref data) = request.data {
            builder = builder.body(data.clone());
        }

        let response = builder.send().await?.error_for_status()?;
        let body = response.bytes().await?;
        debug!(url = %request.url, method = %method_name, bytes = body.len(), "Fetched from origin");
        Ok(body.to_vec())
    }
}
