//! Retry policy for HTTP requests.
//!
//! Two families of statuses are retried: transient ones (backoff) and ones
//! where the server asks the client to wait (`Retry-After`, falling back to
//! backoff). Connection, read and redirect failures always back off.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default number of retries.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default base sleep time between retries.
pub const DEFAULT_SLEEP_TIME: Duration = Duration::from_secs(1);

/// Default upper bound for a single backoff.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(120);

/// Statuses retried with exponential backoff.
pub const DEFAULT_STATUS_FORCELIST: [u16; 3] = [408, 423, 504];

/// Statuses retried after honoring `Retry-After`.
pub const DEFAULT_RETRY_AFTER_STATUS: [u16; 3] = [413, 429, 503];

// ============================================================================
// Verdict
// ============================================================================

/// What the transport should do with a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Return the response to the caller.
    Accept,
    /// Retry after exponential backoff.
    Backoff,
    /// Retry after the server-requested wait.
    ServerWait,
    /// Fail immediately with the status.
    Fail,
}

/// Decides how a response status is handled.
///
/// The default implementation is [`RetryPolicy`] itself; origins with odd
/// status semantics plug in their own.
pub trait FailureClassifier: Send + Sync {
    /// Classifies a status code.
    fn classify(&self, status: u16) -> Verdict;
}

// ============================================================================
// Retry Policy
// ============================================================================

/// Retry and backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries (not counting the first attempt).
    pub max_retries: u32,
    /// Base sleep time; backoff for retry `n` is `sleep_time * 2^(n-1)`.
    #[serde(with = "duration_millis")]
    pub sleep_time: Duration,
    /// Upper bound for a single backoff.
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,
    /// Statuses retried with backoff.
    pub status_forcelist: Vec<u16>,
    /// Statuses retried honoring `Retry-After`.
    pub retry_after_status: Vec<u16>,
}

impl RetryPolicy {
    /// Creates a policy with the given number of retries.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Disables retries.
    pub fn no_retry() -> Self {
        Self::new(0)
    }

    /// Sets the base sleep time.
    pub fn with_sleep_time(mut self, sleep_time: Duration) -> Self {
        self.sleep_time = sleep_time;
        self
    }

    /// Replaces the backoff status list.
    pub fn with_status_forcelist(mut self, statuses: impl Into<Vec<u16>>) -> Self {
        self.status_forcelist = statuses.into();
        self
    }

    /// Replaces the `Retry-After` status list.
    pub fn with_retry_after_status(mut self, statuses: impl Into<Vec<u16>>) -> Self {
        self.retry_after_status = statuses.into();
        self
    }

    /// Adds statuses to the backoff list.
    pub fn extend_status_forcelist(mut self, statuses: &[u16]) -> Self {
        for status in statuses {
            if !self.status_forcelist.contains(status) {
                self.status_forcelist.push(*status);
            }
        }
        self
    }

    /// Calculates the backoff for a retry number (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.sleep_time
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Wait for a server-requested retry, falling back to backoff.
    pub fn server_wait(&self, retry_after: Option<&str>, retry: u32, now: DateTime<Utc>) -> Duration {
        retry_after
            .and_then(|value| parse_retry_after(value, now))
            .unwrap_or_else(|| self.backoff(retry))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            sleep_time: DEFAULT_SLEEP_TIME,
            max_backoff: DEFAULT_MAX_BACKOFF,
            status_forcelist: DEFAULT_STATUS_FORCELIST.to_vec(),
            retry_after_status: DEFAULT_RETRY_AFTER_STATUS.to_vec(),
        }
    }
}

impl FailureClassifier for RetryPolicy {
    fn classify(&self, status: u16) -> Verdict {
        if self.retry_after_status.contains(&status) {
            Verdict::ServerWait
        } else if self.status_forcelist.contains(&status) {
            Verdict::Backoff
        } else if status >= 400 {
            Verdict::Fail
        } else {
            Verdict::Accept
        }
    }
}

/// Parses a `Retry-After` value: delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let date = DateTime::parse_from_rfc2822(value).ok()?;
    let secs = (date.with_timezone(&Utc) - now).num_seconds();
    Some(Duration::from_secs(u64::try_from(secs).unwrap_or(0)))
}

pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
