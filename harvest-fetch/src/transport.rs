//! HTTP transport with retries and redirect policy.
//!
//! The transport issues one logical request. It knows nothing about
//! credentials, quota or archives; those belong to the session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use harvest_core::{Headers, HttpRequest, HttpResponse, Method};
use reqwest::{Client, header::HeaderMap, redirect};
use tracing::{debug, instrument, warn};

use crate::error::TransportError;
use crate::retry::{FailureClassifier, RetryPolicy, Verdict};

/// Default request timeout.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default redirect limit.
const DEFAULT_MAX_REDIRECTS: usize = 5;

/// User agent string for Harvest.
const USER_AGENT: &str = concat!("Harvest/", env!("CARGO_PKG_VERSION"));

// ============================================================================
// Transport Trait
// ============================================================================

/// Sends one logical HTTP request.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends the request, applying whatever retry policy the transport has.
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

// ============================================================================
// HTTP Transport
// ============================================================================

/// reqwest-backed transport with retry, backoff and `Retry-After` support.
#[derive(Clone)]
pub struct HttpTransport {
    inner: Client,
    policy: RetryPolicy,
    classifier: Arc<dyn FailureClassifier>,
}

impl HttpTransport {
    /// Creates a transport with default timeout and retry policy.
    pub fn new() -> Result<Self, TransportError> {
        Self::builder().build()
    }

    /// Creates a builder.
    pub fn builder() -> HttpTransportBuilder {
        HttpTransportBuilder::default()
    }

    /// Returns the retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn send_once(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
        };

        let mut builder = self.inner.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = response.bytes().await?.to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut retries = 0u32;

        loop {
            debug!(attempt = retries + 1, "Sending request");

            let response = match self.send_once(request).await {
                Ok(response) => response,
                Err(error) if error.is_connection_failure() => {
                    if retries >= self.policy.max_retries {
                        warn!(error = %error, attempts = retries + 1, "Retry limit reached");
                        return Err(TransportError::RetryLimit {
                            attempts: retries + 1,
                            last: Box::new(error),
                        });
                    }
                    retries += 1;
                    let delay = self.policy.backoff(retries);
                    warn!(
                        error = %error,
                        delay_ms = delay.as_millis(),
                        "Request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(error) => return Err(error),
            };

            debug!(status = response.status, "Response received");

            let delay = match self.classifier.classify(response.status) {
                Verdict::Accept => return Ok(response),
                Verdict::Fail => return Err(status_error(response)),
                Verdict::Backoff => self.policy.backoff(retries + 1),
                Verdict::ServerWait => self.policy.server_wait(
                    response.header("retry-after"),
                    retries + 1,
                    Utc::now(),
                ),
            };

            if retries >= self.policy.max_retries {
                warn!(status = response.status, "Status retries exhausted");
                return Err(status_error(response));
            }

            retries += 1;
            warn!(
                status = response.status,
                delay_ms = delay.as_millis(),
                "Retryable status, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn status_error(response: HttpResponse) -> TransportError {
    TransportError::HttpStatus {
        status: response.status,
        body: response.text(),
        headers: response.headers,
    }
}

fn collect_headers(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in map {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        headers
            .entry(name.as_str().to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    headers
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`HttpTransport`].
pub struct HttpTransportBuilder {
    timeout: Duration,
    max_redirects: usize,
    policy: RetryPolicy,
    classifier: Option<Arc<dyn FailureClassifier>>,
    ssl_verify: bool,
}

impl Default for HttpTransportBuilder {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            policy: RetryPolicy::default(),
            classifier: None,
            ssl_verify: true,
        }
    }
}

impl HttpTransportBuilder {
    /// Sets the per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the redirect limit.
    pub fn max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = max;
        self
    }

    /// Sets the retry policy.
    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Overrides how statuses are classified.
    ///
    /// Defaults to the retry policy's own status lists.
    pub fn classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Enables or disables TLS certificate verification.
    pub fn ssl_verify(mut self, verify: bool) -> Self {
        self.ssl_verify = verify;
        self
    }

    /// Builds the transport.
    pub fn build(self) -> Result<HttpTransport, TransportError> {
        let inner = Client::builder()
            .timeout(self.timeout)
            .user_agent(USER_AGENT)
            .redirect(redirect::Policy::limited(self.max_redirects))
            .danger_accept_invalid_certs(!self.ssl_verify)
            .build()
            .map_err(|e| TransportError::InvalidRequest {
                message: format!("Failed to create HTTP client: {e}"),
            })?;

        let classifier = self
            .classifier
            .unwrap_or_else(|| Arc::new(self.policy.clone()));

        Ok(HttpTransport {
            inner,
            policy: self.policy,
            classifier,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
