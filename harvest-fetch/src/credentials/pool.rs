//! Credential rotation.

use async_trait::async_trait;
use harvest_core::{QuotaState, Secret};
use tracing::{debug, info, instrument, warn};

use super::Credential;
use crate::error::{CredentialError, FetchError};

/// Fraction of quota a credential may lose before the pool re-evaluates.
pub const DEFAULT_USAGE_MARGIN: f64 = 0.1;

/// Reads a credential's quota without consuming it.
#[async_trait]
pub trait QuotaProber: Send + Sync {
    /// Probes the quota available to `secret`.
    async fn probe(&self, secret: &Secret) -> Result<QuotaState, FetchError>;
}

/// Holds the credentials of one session and picks the active one.
///
/// An empty pool is valid: requests go out unauthenticated and rotation is
/// disabled.
#[derive(Debug)]
pub struct CredentialPool {
    credentials: Vec<Credential>,
    active: usize,
    last_checked: Option<u64>,
    usage_margin: f64,
}

impl CredentialPool {
    /// Creates a pool. The first credential starts active.
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self {
            credentials,
            active: 0,
            last_checked: None,
            usage_margin: DEFAULT_USAGE_MARGIN,
        }
    }

    /// A pool with no credentials.
    pub fn anonymous() -> Self {
        Self::new(Vec::new())
    }

    /// Sets the usage margin.
    pub fn with_usage_margin(mut self, margin: f64) -> Self {
        self.usage_margin = margin;
        self
    }

    /// Number of credentials.
    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    /// Returns true if the pool has no credentials.
    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Index of the active credential.
    pub fn active_index(&self) -> usize {
        self.active
    }

    /// The active credential, if any.
    pub fn active(&self) -> Option<&Credential> {
        self.credentials.get(self.active)
    }

    /// Remaining quota recorded when rotation was last evaluated.
    pub fn last_checked(&self) -> Option<u64> {
        self.last_checked
    }

    /// Records quota reported for the active credential.
    pub fn record_quota(&mut self, quota: QuotaState) {
        if let Some(credential) = self.credentials.get_mut(self.active) {
            credential.set_quota(quota);
        }
    }

    /// Returns the secret of the active credential.
    ///
    /// In a multi-credential pool a credential that fails to mint is
    /// skipped in favor of the next one; with a single credential the
    /// failure is fatal.
    pub async fn active_secret(&mut self) -> Result<Option<Secret>, FetchError> {
        if self.credentials.is_empty() {
            return Ok(None);
        }

        let count = self.credentials.len();
        let mut last_error = None;

        for offset in 0..count {
            let index = (self.active + offset) % count;
            match self.credentials[index].secret().await {
                Ok(secret) => {
                    if index != self.active {
                        info!(from = self.active, to = index, "Falling back to next credential");
                        self.active = index;
                        self.last_checked = None;
                    }
                    return Ok(Some(secret));
                }
                Err(err) if count == 1 => return Err(FetchError::CredentialRefresh(err)),
                Err(err) => {
                    warn!(index, error = %err, "Credential could not be minted");
                    last_error = Some(err);
                }
            }
        }

        debug!(?last_error, "No credential could be minted");
        Err(FetchError::CredentialRefresh(
            CredentialError::NoUsableCredential,
        ))
    }

    /// Makes the credential with the most remaining quota active.
    ///
    /// With more than one credential every credential is probed; ties keep
    /// pool order. Probe failures count as zero remaining. The chosen
    /// credential is probed once more so the caller gets fresh numbers,
    /// which are returned. Returns `None` for an empty pool.
    #[instrument(skip(self, prober), fields(credentials = self.credentials.len()))]
    pub async fn select_best(
        &mut self,
        prober: &dyn QuotaProber,
    ) -> Result<Option<QuotaState>, FetchError> {
        if self.credentials.is_empty() {
            return Ok(None);
        }

        if self.credentials.len() > 1 {
            let mut best: Option<(usize, u64)> = None;

            for index in 0..self.credentials.len() {
                let secret = match self.credentials[index].secret().await {
                    Ok(secret) => secret,
                    Err(err) => {
                        warn!(index, error = %err, "Skipping credential that could not be minted");
                        continue;
                    }
                };

                let remaining = match prober.probe(&secret).await {
                    Ok(quota) => {
                        self.credentials[index].set_quota(quota);
                        quota.remaining.unwrap_or(0)
                    }
                    Err(err) => {
                        warn!(index, error = %err, "Quota probe failed, assuming none remaining");
                        0
                    }
                };
                debug!(index, remaining, "Probed credential");

                if best.is_none_or(|(_, top)| remaining > top) {
                    best = Some((index, remaining));
                }
            }

            let Some((index, remaining)) = best else {
                return Err(FetchError::CredentialRefresh(
                    CredentialError::NoUsableCredential,
                ));
            };

            if index != self.active {
                info!(from = self.active, to = index, remaining, "Switching credential");
            }
            self.active = index;
        }

        let secret = self.credentials[self.active]
            .secret()
            .await
            .map_err(FetchError::CredentialRefresh)?;

        let quota = match prober.probe(&secret).await {
            Ok(quota) => quota,
            Err(err) => {
                warn!(error = %err, "Quota probe failed for active credential");
                QuotaState::unknown()
            }
        };

        self.credentials[self.active].set_quota(quota);
        self.last_checked = quota.remaining;
        Ok(Some(quota))
    }

    /// Decides, after a live response, whether to re-run [`select_best`].
    ///
    /// Switches when `remaining` is at or below `floor * (1 + margin)`, or
    /// when it dropped below `1 - margin` of the value seen at the last
    /// check. A ratio above one means the quota was reset; the baseline
    /// moves without switching. Single-credential and empty pools never
    /// switch.
    ///
    /// [`select_best`]: Self::select_best
    pub fn should_switch(&mut self, remaining: Option<u64>, floor: u64) -> bool {
        if self.credentials.len() <= 1 {
            return false;
        }
        let Some(remaining) = remaining else {
            return false;
        };

        #[allow(clippy::cast_precision_loss)]
        let (current, threshold) = (
            remaining as f64,
            floor as f64 * (1.0 + self.usage_margin),
        );

        if current <= threshold {
            self.last_checked = Some(remaining);
            return true;
        }

        let Some(last) = self.last_checked else {
            self.last_checked = Some(remaining);
            return false;
        };

        if last == 0 {
            self.last_checked = Some(remaining);
            return false;
        }

        #[allow(clippy::cast_precision_loss)]
        let ratio = current / last as f64;

        if ratio < 1.0 - self.usage_margin {
            self.last_checked = Some(remaining);
            true
        } else if ratio > 1.0 {
            self.last_checked = Some(remaining);
            false
        } else {
            false
        }
    }

    /// True when the only credential is minted and its quota hit the floor.
    ///
    /// There is nothing to rotate to, so a fresh token is the only way on.
    pub fn needs_refresh(&self, remaining: Option<u64>, floor: u64) -> bool {
        self.credentials.len() == 1
            && self.credentials[0].is_minted()
            && remaining.is_some_and(|remaining| remaining <= floor)
    }

    /// Mints a new token for the active credential.
    pub async fn refresh_active(&mut self) -> Result<Option<Secret>, FetchError> {
        let Some(credential) = self.credentials.get_mut(self.active) else {
            return Ok(None);
        };
        info!(index = self.active, "Refreshing active credential");
        let secret = credential
            .refresh()
            .await
            .map_err(FetchError::CredentialRefresh)?;
        self.last_checked = None;
        Ok(Some(secret))
    }
}
