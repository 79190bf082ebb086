//! Session configuration.
//!
//! The CLI or scheduler embedding this crate fills a [`SessionConfig`];
//! every field has a default so partial config files deserialize.

use std::path::PathBuf;
use std::time::Duration;

use harvest_core::Secret;
use serde::{Deserialize, Serialize};

use crate::error::FetchError;
use crate::ratelimit::{DEFAULT_MIN_RATE_TO_SLEEP, HeaderProfile};
use crate::retry::{RetryPolicy, duration_millis};

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default redirect limit.
pub const DEFAULT_MAX_REDIRECTS: usize = 5;

/// How the active credential is attached to live requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthScheme {
    /// A header such as `Authorization: Bearer <token>`.
    Header {
        /// Header name.
        name: String,
        /// Text placed before the token, e.g. `"Bearer "`.
        prefix: String,
    },
    /// A query parameter such as `?access_token=<token>`.
    QueryParam {
        /// Parameter name.
        name: String,
    },
}

impl AuthScheme {
    /// `Authorization: Bearer <token>`.
    pub fn bearer() -> Self {
        Self::Header {
            name: "Authorization".to_string(),
            prefix: "Bearer ".to_string(),
        }
    }

    /// A custom header carrying the bare token.
    pub fn header(name: impl Into<String>) -> Self {
        Self::Header {
            name: name.into(),
            prefix: String::new(),
        }
    }
}

impl Default for AuthScheme {
    fn default() -> Self {
        Self::bearer()
    }
}

/// An application that mints installation tokens from a private key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppCredentials {
    /// Application id, used as the assertion issuer.
    pub app_id: String,
    /// PEM file holding the application's RSA private key.
    pub private_key_path: PathBuf,
    /// Installation id; looked up from `account` when absent.
    #[serde(default)]
    pub installation_id: Option<u64>,
    /// Account login whose installation is used.
    #[serde(default)]
    pub account: Option<String>,
    /// Identity endpoint; defaults to the session's `base_url`.
    #[serde(default)]
    pub api_url: Option<String>,
}

/// Everything one fetch session needs from the outside.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Base URL of the origin API.
    pub base_url: String,
    /// Static credentials; may be empty for anonymous access.
    pub tokens: Vec<Secret>,
    /// Minted application credential, used alongside any tokens.
    pub app: Option<AppCredentials>,
    /// Retry and backoff parameters.
    pub retry: RetryPolicy,
    /// Per-attempt timeout.
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    /// Redirect limit.
    pub max_redirects: usize,
    /// Verify TLS certificates.
    pub ssl_verify: bool,
    /// Rate-limit header names and reset encoding.
    pub rate_limit: HeaderProfile,
    /// Sleep until reset instead of failing when quota runs out.
    pub sleep_for_quota: bool,
    /// Floor at or below which requests are gated.
    pub min_rate_to_sleep: u64,
    /// Fraction of quota lost before credentials are re-evaluated.
    pub usage_margin: f64,
    /// Path (relative to `base_url`) of a non-consuming quota endpoint.
    pub status_path: Option<String>,
    /// How credentials are attached.
    pub auth: AuthScheme,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            tokens: Vec::new(),
            app: None,
            retry: RetryPolicy::default(),
            timeout: DEFAULT_TIMEOUT,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            ssl_verify: true,
            rate_limit: HeaderProfile::default(),
            sleep_for_quota: false,
            min_rate_to_sleep: DEFAULT_MIN_RATE_TO_SLEEP,
            usage_margin: crate::credentials::DEFAULT_USAGE_MARGIN,
            status_path: None,
            auth: AuthScheme::default(),
        }
    }
}

impl SessionConfig {
    /// Creates a config for an origin with all defaults.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Adds a static token.
    pub fn with_token(mut self, token: impl Into<Secret>) -> Self {
        self.tokens.push(token.into());
        self
    }

    /// Enables sleeping for quota.
    pub fn with_sleep_for_quota(mut self, sleep: bool) -> Self {
        self.sleep_for_quota = sleep;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Checks values the type system cannot.
    pub fn validate(&self) -> Result<(), FetchError> {
        url::Url::parse(&self.base_url).map_err(|e| {
            FetchError::InvalidConfig(format!("invalid base_url {:?}: {e}", self.base_url))
        })?;

        if !(0.0..1.0).contains(&self.usage_margin) {
            return Err(FetchError::InvalidConfig(format!(
                "usage_margin must be in [0, 1), got {}",
                self.usage_margin
            )));
        }

        if self.tokens.iter().any(Secret::is_empty) {
            return Err(FetchError::InvalidConfig("empty token".to_string()));
        }

        if let Some(app) = &self.app {
            if app.installation_id.is_none() && app.account.is_none() {
                return Err(FetchError::InvalidConfig(
                    "app credentials need installation_id or account".to_string(),
                ));
            }
        }

        Ok(())
    }
}
