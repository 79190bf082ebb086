//! Credentials and the rotation pool.
//!
//! A credential is either a static token or a short-lived token minted on
//! demand by a [`CredentialMinter`]. Adapters never see raw values; the
//! session asks the [`CredentialPool`] for the active secret right before
//! a request goes onto the wire.

pub mod assertion;
pub mod pool;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use harvest_core::{QuotaState, Secret};
use tracing::debug;

use crate::error::CredentialError;

pub use assertion::{AssertionMinter, Installation};
pub use pool::{CredentialPool, DEFAULT_USAGE_MARGIN, QuotaProber};

/// Minted tokens are renewed this long before they expire.
const EXPIRY_SKEW_SECS: i64 = 60;

// ============================================================================
// Minting
// ============================================================================

/// A freshly minted short-lived token.
#[derive(Debug, Clone)]
pub struct MintedToken {
    /// The token.
    pub secret: Secret,
    /// When the identity endpoint stops honoring it.
    pub expires_at: DateTime<Utc>,
}

impl MintedToken {
    /// Returns true if the token is expired or about to expire.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - Duration::seconds(EXPIRY_SKEW_SECS) <= now
    }
}

/// Mints short-lived tokens, e.g. by exchanging a signed assertion.
#[async_trait]
pub trait CredentialMinter: Send + Sync {
    /// Mints a new token.
    async fn mint(&self) -> Result<MintedToken, CredentialError>;
}

// ============================================================================
// Credential
// ============================================================================

enum Source {
    Static(Secret),
    Minted {
        minter: Arc<dyn CredentialMinter>,
        token: Option<MintedToken>,
    },
}

/// One credential plus the quota it last reported.
pub struct Credential {
    source: Source,
    quota: QuotaState,
}

impl Credential {
    /// A long-lived token.
    pub fn static_token(secret: impl Into<Secret>) -> Self {
        Self {
            source: Source::Static(secret.into()),
            quota: QuotaState::unknown(),
        }
    }

    /// A token minted on demand and renewed when it expires.
    pub fn minted(minter: Arc<dyn CredentialMinter>) -> Self {
        Self {
            source: Source::Minted {
                minter,
                token: None,
            },
            quota: QuotaState::unknown(),
        }
    }

    /// Returns true for minted credentials.
    pub fn is_minted(&self) -> bool {
        matches!(self.source, Source::Minted { .. })
    }

    /// Last quota observed for this credential.
    pub fn quota(&self) -> QuotaState {
        self.quota
    }

    pub(crate) fn set_quota(&mut self, quota: QuotaState) {
        self.quota = quota;
    }

    /// Returns the current secret, minting one if there is none or it is stale.
    pub async fn secret(&mut self) -> Result<Secret, CredentialError> {
        match &mut self.source {
            Source::Static(secret) => Ok(secret.clone()),
            Source::Minted { minter, token } => {
                if let Some(current) = token.as_ref().filter(|t| !t.is_stale(Utc::now())) {
                    return Ok(current.secret.clone());
                }
                debug!("Minting credential");
                let minted = minter.mint().await?;
                let secret = minted.secret.clone();
                *token = Some(minted);
                Ok(secret)
            }
        }
    }

    /// Forces a new token to be minted. Static credentials are returned as-is.
    pub async fn refresh(&mut self) -> Result<Secret, CredentialError> {
        if let Source::Minted { token, .. } = &mut self.source {
            *token = None;
        }
        self.quota = QuotaState::unknown();
        self.secret().await
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_minted() { "minted" } else { "static" };
        f.debug_struct("Credential")
            .field("kind", &kind)
            .field("quota", &self.quota)
            .finish_non_exhaustive()
    }
}
