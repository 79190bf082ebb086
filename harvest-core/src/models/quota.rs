//! Quota state for the active credential.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Remaining calls and reset time as last reported by the origin.
///
/// Both fields are `None` when the most recent live response did not carry
/// the corresponding header. Stale values are never kept past one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QuotaState {
    /// Remaining permitted calls.
    pub remaining: Option<u64>,
    /// When the quota is restored.
    pub reset_at: Option<DateTime<Utc>>,
}

impl QuotaState {
    /// A state with nothing known.
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Creates a state with known values.
    pub fn new(remaining: Option<u64>, reset_at: Option<DateTime<Utc>>) -> Self {
        Self {
            remaining,
            reset_at,
        }
    }

    /// Returns true if the remaining quota is known and at or below `floor`.
    pub fn is_at_or_below(&self, floor: u64) -> bool {
        self.remaining.is_some_and(|remaining| remaining <= floor)
    }

    /// Seconds from `now` until the reset time, rounded up and clamped to
    /// zero, so sleeping that long never wakes before the reset.
    ///
    /// Returns zero when the reset time is unknown.
    pub fn seconds_until_reset(&self, now: DateTime<Utc>) -> u64 {
        self.reset_at
            .map(|reset| (reset - now).num_milliseconds())
            .map_or(0, |millis| u64::try_from(millis).map_or(0, |millis| millis.div_ceil(1000)))
    }
}
