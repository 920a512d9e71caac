//! # HTTP Retrieval Utilities
//!
//! An asynchronous API client around `reqwest` with:
//! - separate connect and read timeouts,
//! - a bounded idle-connection pool shared by every caller,
//! - retries with exponential backoff on 500/502/503/504 and transport errors,
//! - typed classification of every failure into [`SyncError`].

use std::time::Duration;

use reqwest::{header::HeaderMap, Method, StatusCode, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{
    default_on_request_failure, policies::ExponentialBackoff, Retryable, RetryableStrategy,
    RetryTransientMiddleware,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::configs::config_sync::VendorConfig;
use crate::errors::{SyncError, SyncResult};

/// Status codes that the retry middleware treats as transient.
pub const RETRY_STATUSES: [StatusCode; 4] = [
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// Network budgets for an [`ApiClient`].
#[derive(Debug, Clone)]
pub struct HttpPolicy {
    /// Time allowed to establish a connection.
    pub connect_timeout: Duration,
    /// Time allowed between reads of the response.
    pub read_timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Lower bound of the retry backoff.
    pub min_backoff: Duration,
    /// Upper bound of the retry backoff.
    pub max_backoff: Duration,
    /// Idle connections kept per host.
    pub pool_max_idle_per_host: usize,
    /// Disables TLS certificate validation.
    pub accept_invalid_certs: bool,
}

impl From<&VendorConfig> for HttpPolicy {
    fn from(config: &VendorConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            max_retries: config.max_http_retries,
            min_backoff: Duration::from_millis(config.retry_min_backoff_ms),
            max_backoff: Duration::from_millis(config.retry_max_backoff_ms.max(config.retry_min_backoff_ms)),
            pool_max_idle_per_host: config.pool_max_idle_per_host,
            accept_invalid_certs: config.accept_invalid_certs,
        }
    }
}

/// A standardized container for API responses.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The deserialized response body on a 2xx status.
    pub data: Option<T>,
    /// The raw body returned with a non-2xx status.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Whether the status code was in the 2xx range.
    pub success: bool,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

impl<T> ApiResponse<T> {
    /// Returns the body of a successful response, or the classified failure.
    pub fn into_result(self) -> SyncResult<T> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            (true, None) => Err(SyncError::VendorBusiness(format!("HTTP {} without body", self.status))),
            (false, _) => Err(classify_status(self.status, self.error_body.as_deref())),
        }
    }
}

/// Retries the fixed status list and whatever `reqwest-retry` deems a transient transport error.
struct StatusListStrategy;

impl RetryableStrategy for StatusListStrategy {
    fn handle(&self, res: &Result<reqwest::Response, reqwest_middleware::Error>) -> Option<Retryable> {
        match res {
            Ok(response) if RETRY_STATUSES.contains(&response.status()) => Some(Retryable::Transient),
            Ok(_) => None,
            Err(error) => default_on_request_failure(error),
        }
    }
}

/// A pooled, retrying asynchronous HTTP client.
#[derive(Clone)]
pub struct ApiClient {
    /// The underlying middleware-enabled client.
    inner: ClientWithMiddleware,
    /// The base URL to which request paths are joined.
    base_url: Url,
}

impl ApiClient {
    /// Creates a client for `base_url` under the given policy.
    ///
    /// # Errors
    /// `SyncError::Config` if the URL is not absolute or the TLS backend cannot be built.
    pub fn new(base_url: &str, policy: &HttpPolicy) -> SyncResult<Self> {
        let url = Url::parse(base_url)
            .map_err(|e| SyncError::Config(format!("invalid base url {base_url}: {e}")))?;

        if policy.accept_invalid_certs {
            tracing::warn!(host = url.host_str().unwrap_or_default(), "TLS certificate validation disabled");
        }

        let http = reqwest::Client::builder()
            .connect_timeout(policy.connect_timeout)
            .read_timeout(policy.read_timeout)
            .pool_max_idle_per_host(policy.pool_max_idle_per_host)
            .danger_accept_invalid_certs(policy.accept_invalid_certs)
            .build()
            .map_err(|e| SyncError::Config(format!("cannot build http client: {e}")))?;

        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(policy.min_backoff, policy.max_backoff)
            .build_with_max_retries(policy.max_retries);

        let client = ClientBuilder::new(http)
            .with(RetryTransientMiddleware::new_with_policy_and_strategy(
                retry_policy,
                StatusListStrategy,
            ))
            .build();

        Ok(Self {
            inner: client,
            base_url: url,
        })
    }

    /// The absolute URL requests are resolved against.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Performs an HTTP request and decodes a JSON body on success.
    ///
    /// An empty `path` targets the base URL itself. A non-2xx status is not an
    /// error here; it comes back as an unsuccessful [`ApiResponse`].
    ///
    /// # Errors
    /// - `TransientNetwork` for timeouts, connect failures and interrupted bodies.
    /// - `VendorBusiness` when a 2xx body is not valid JSON for `T`.
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        headers: Option<HeaderMap>,
        body: Option<&B>,
    ) -> SyncResult<ApiResponse<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        // 1. Construct the full absolute URL
        let full_url = self
            .base_url
            .join(path)
            .map_err(|e| SyncError::Config(format!("cannot join {path} onto {}: {e}", self.base_url)))?;
        let mut req = self.inner.request(method, full_url);

        // 2. Query and headers
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(h) = headers {
            req = req.headers(h);
        }

        // 3. JSON body
        if let Some(b) = body {
            use reqwest::header::CONTENT_TYPE;
            let json_body = serde_json::to_string(b)?;
            req = req.header(CONTENT_TYPE, "application/json").body(json_body);
        }

        // 4. Execute
        let response = req.send().await.map_err(classify_transport)?;
        let status = response.status();
        let resp_headers = response.headers().clone();

        // 5. Decode by status
        let bytes = response.bytes().await.map_err(|e| {
            SyncError::TransientNetwork(format!("failed reading response body: {e}"))
        })?;

        if status.is_success() {
            let data = serde_json::from_slice::<T>(&bytes)
                .map_err(|e| SyncError::VendorBusiness(format!("malformed JSON response: {e}")))?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers: resp_headers,
            })
        } else {
            Ok(ApiResponse {
                data: None,
                error_body: Some(String::from_utf8_lossy(&bytes).into_owned()),
                status: status.as_u16(),
                success: false,
                headers: resp_headers,
            })
        }
    }
}

/// Maps a non-2xx status onto a failure class. 5xx, 429 and 408 are transient.
pub fn classify_status(status: u16, body: Option<&str>) -> SyncError {
    let detail = match body {
        Some(b) if !b.is_empty() => format!("HTTP {status}: {}", truncate(b, 200)),
        _ => format!("HTTP {status}"),
    };
    if status >= 500 || status == 429 || status == 408 {
        SyncError::TransientNetwork(detail)
    } else {
        SyncError::VendorBusiness(detail)
    }
}

fn classify_transport(error: reqwest_middleware::Error) -> SyncError {
    match error {
        reqwest_middleware::Error::Reqwest(e) if e.is_builder() => {
            SyncError::Config(format!("invalid request: {e}"))
        }
        reqwest_middleware::Error::Reqwest(e) if e.is_timeout() => {
            SyncError::TransientNetwork(format!("timed out: {e}"))
        }
        reqwest_middleware::Error::Reqwest(e) => SyncError::TransientNetwork(e.to_string()),
        reqwest_middleware::Error::Middleware(e) => SyncError::TransientNetwork(e.to_string()),
    }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
