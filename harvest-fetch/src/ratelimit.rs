//! Rate limit coordination.
//!
//! The [`RateLimiter`] never talks to the network. It reads quota headers
//! from every live response and, before the next request, either lets it
//! through, sleeps until the quota resets, or fails with
//! [`FetchError::RateLimitExhausted`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use harvest_core::{Headers, QuotaState};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::FetchError;

/// Default remaining-quota header.
pub const DEFAULT_REMAINING_HEADER: &str = "X-RateLimit-Remaining";

/// Default reset header.
pub const DEFAULT_RESET_HEADER: &str = "X-RateLimit-Reset";

/// Default floor below which requests are gated.
pub const DEFAULT_MIN_RATE_TO_SLEEP: u64 = 10;

/// Upper bound for the floor; larger values are clamped.
pub const MAX_MIN_RATE_TO_SLEEP: u64 = 500;

// ============================================================================
// Origin Profiles
// ============================================================================

/// How an origin encodes its reset header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetEncoding {
    /// Absolute Unix time in seconds.
    #[default]
    EpochSeconds,
    /// Absolute Unix time in milliseconds.
    EpochMillis,
    /// Seconds to wait from the moment the response arrived.
    RelativeSeconds,
}

/// Per-origin knowledge of rate-limit headers.
pub trait RateLimitProfile: Send + Sync {
    /// Name of the remaining-quota header.
    fn remaining_header(&self) -> &str;

    /// Name of the reset header.
    fn reset_header(&self) -> &str;

    /// Decodes a reset header value into an absolute time.
    fn reset_at(&self, value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>>;

    /// Seconds until the quota is restored.
    fn seconds_until_reset(&self, quota: &QuotaState, now: DateTime<Utc>) -> u64 {
        quota.seconds_until_reset(now)
    }

    /// Reads the quota carried by a response's headers.
    ///
    /// Header names are matched case-insensitively. A missing or unparsable
    /// header yields `None` for that field.
    fn read(&self, headers: &Headers, now: DateTime<Utc>) -> QuotaState {
        let lookup = |name: &str| headers.get(&name.to_ascii_lowercase()).map(|value| value.trim());
        let remaining = lookup(self.remaining_header()).and_then(|value| value.parse::<u64>().ok());
        let reset_at = lookup(self.reset_header()).and_then(|value| self.reset_at(value, now));
        QuotaState::new(remaining, reset_at)
    }
}

/// Header-driven profile covering the common encodings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderProfile {
    /// Remaining-quota header name.
    pub remaining_header: String,
    /// Reset header name.
    pub reset_header: String,
    /// Reset value encoding.
    pub encoding: ResetEncoding,
}

impl HeaderProfile {
    /// Creates a profile with custom header names.
    pub fn new(
        remaining_header: impl Into<String>,
        reset_header: impl Into<String>,
        encoding: ResetEncoding,
    ) -> Self {
        Self {
            remaining_header: remaining_header.into(),
            reset_header: reset_header.into(),
            encoding,
        }
    }
}

impl Default for HeaderProfile {
    fn default() -> Self {
        Self::new(
            DEFAULT_REMAINING_HEADER,
            DEFAULT_RESET_HEADER,
            ResetEncoding::EpochSeconds,
        )
    }
}

impl RateLimitProfile for HeaderProfile {
    fn remaining_header(&self) -> &str {
        &self.remaining_header
    }

    fn reset_header(&self) -> &str {
        &self.reset_header
    }

    fn reset_at(&self, value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let value = value.parse::<i64>().ok()?;
        match self.encoding {
            ResetEncoding::EpochSeconds => Utc.timestamp_opt(value, 0).single(),
            ResetEncoding::EpochMillis => Utc.timestamp_millis_opt(value).single(),
            ResetEncoding::RelativeSeconds => Some(now + chrono::Duration::seconds(value)),
        }
    }
}

// ============================================================================
// Rate Limiter
// ============================================================================

/// Gates live requests on the active credential's quota.
#[derive(Clone)]
pub struct RateLimiter {
    profile: Arc<dyn RateLimitProfile>,
    floor: u64,
    sleep_for_quota: bool,
    quota: QuotaState,
}

impl RateLimiter {
    /// Creates a limiter with the default header profile.
    ///
    /// `min_rate_to_sleep` above [`MAX_MIN_RATE_TO_SLEEP`] is clamped.
    pub fn new(min_rate_to_sleep: u64, sleep_for_quota: bool) -> Self {
        let floor = if min_rate_to_sleep > MAX_MIN_RATE_TO_SLEEP {
            warn!(
                requested = min_rate_to_sleep,
                max = MAX_MIN_RATE_TO_SLEEP,
                "Minimum rate to sleep is too high, clamping"
            );
            MAX_MIN_RATE_TO_SLEEP
        } else {
            min_rate_to_sleep
        };

        Self {
            profile: Arc::new(HeaderProfile::default()),
            floor,
            sleep_for_quota,
            quota: QuotaState::unknown(),
        }
    }

    /// Replaces the origin profile.
    pub fn with_profile(mut self, profile: Arc<dyn RateLimitProfile>) -> Self {
        self.profile = profile;
        self
    }

    /// Returns the floor.
    pub fn floor(&self) -> u64 {
        self.floor
    }

    /// Returns true if the limiter sleeps instead of failing.
    pub fn sleeps_for_quota(&self) -> bool {
        self.sleep_for_quota
    }

    /// Returns the current quota.
    pub fn quota(&self) -> QuotaState {
        self.quota
    }

    /// Returns the origin profile.
    pub fn profile(&self) -> &dyn RateLimitProfile {
        self.profile.as_ref()
    }

    /// Replaces the tracked quota, e.g. after switching credentials.
    pub fn load(&mut self, quota: QuotaState) {
        self.quota = quota;
    }

    /// Decides whether the next live request may proceed.
    ///
    /// Sleeps until reset when sleeping is enabled; otherwise fails with
    /// [`FetchError::RateLimitExhausted`] without blocking.
    pub async fn gate(&mut self) -> Result<(), FetchError> {
        if !self.quota.is_at_or_below(self.floor) {
            return Ok(());
        }

        let seconds_to_reset = self.profile.seconds_until_reset(&self.quota, Utc::now());

        if !self.sleep_for_quota {
            warn!(
                remaining = ?self.quota.remaining,
                seconds_to_reset,
                "Rate limit exhausted"
            );
            return Err(FetchError::RateLimitExhausted { seconds_to_reset });
        }

        info!(
            remaining = ?self.quota.remaining,
            seconds_to_reset,
            "Rate limit reached, sleeping until reset"
        );
        tokio::time::sleep(Duration::from_secs(seconds_to_reset)).await;
        debug!("Done sleeping for quota");

        // The old numbers describe the window that just closed.
        self.quota = QuotaState::unknown();
        Ok(())
    }

    /// Updates the quota from the headers of a live response and returns it.
    ///
    /// Error statuses count too: origins report quota on 403 and 429.
    /// Absent headers clear the corresponding field.
    pub fn observe(&mut self, headers: &Headers) -> QuotaState {
        self.quota = self.profile.read(headers, Utc::now());
        debug!(
            remaining = ?self.quota.remaining,
            reset_at = ?self.quota.reset_at,
            "Quota observed"
        );
        self.quota
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("floor", &self.floor)
            .field("sleep_for_quota", &self.sleep_for_quota)
            .field("quota", &self.quota)
            .finish_non_exhaustive()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_RATE_TO_SLEEP, false)
    }
}

// ============================================================================
// Tests
// ============================================================================
