//! Fetch error types.
//!
//! Every fatal condition surfaced by the fetch substrate is distinguishable
//! by [`ErrorKind`], so callers can pick their own exit code or log level.

use harvest_core::Headers;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Main Fetch Error
// ============================================================================

/// Error type for fetch operations.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The transport failed (connection, timeout, redirects or HTTP status).
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Quota is exhausted and sleeping for it is disabled.
    #[error("Rate limit exhausted, {seconds_to_reset} seconds to reset")]
    RateLimitExhausted {
        /// Seconds until the origin restores the quota.
        seconds_to_reset: u64,
    },

    /// Replay asked for a request the archive never recorded.
    #[error("Request not found in archive: {method} {url}")]
    ArchiveMiss {
        /// Method of the missing request.
        method: String,
        /// URL of the missing request.
        url: String,
        /// Fingerprint hashcode.
        hashcode: String,
    },

    /// The archive ended, or changed shape, before an expected checkpoint.
    #[error("Archive exhausted: {0}")]
    ArchiveExhausted(String),

    /// Archive storage failed.
    #[error("Archive error: {0}")]
    Archive(ArchiveError),

    /// A credential could not be minted or refreshed.
    #[error("Credential refresh failed: {0}")]
    CredentialRefresh(#[from] CredentialError),

    /// Invalid response from the origin.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid session configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Coarse classification of a [`FetchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport failure.
    Transport,
    /// Quota exhausted.
    RateLimit,
    /// Archive lookup miss.
    ArchiveMiss,
    /// Archive ended early.
    ArchiveExhausted,
    /// Archive storage failure.
    Archive,
    /// Credential minting or refresh failure.
    Credential,
    /// Malformed origin data.
    InvalidResponse,
    /// Invalid configuration.
    Config,
}

impl FetchError {
    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Transport,
            Self::RateLimitExhausted { .. } => ErrorKind::RateLimit,
            Self::ArchiveMiss { .. } => ErrorKind::ArchiveMiss,
            Self::ArchiveExhausted(_) => ErrorKind::ArchiveExhausted,
            Self::Archive(_) => ErrorKind::Archive,
            Self::CredentialRefresh(_) => ErrorKind::Credential,
            Self::InvalidResponse(_) | Self::Json(_) => ErrorKind::InvalidResponse,
            Self::InvalidConfig(_) => ErrorKind::Config,
        }
    }

    /// Returns true if the caller cannot recover by retrying later.
    ///
    /// Archive misses and exhaustion mean the archive cannot reproduce the
    /// run it recorded. A rate limit is recoverable by waiting.
    ///
    /// A multi-credential pool absorbs a credential that fails to mint by
    /// moving to the next one, so [`FetchError::CredentialRefresh`] only
    /// reaches the caller when the pool has nothing left to use: its single
    /// credential failed, or every credential did (`NoUsableCredential`).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::RateLimitExhausted { .. } | Self::Transport(_))
    }

    /// Returns the HTTP status if this is an unretried or exhausted status error.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport(TransportError::HttpStatus { status, .. }) => Some(*status),
            _ => None,
        }
    }
}

impl From<ArchiveError> for FetchError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Miss {
                method,
                url,
                hashcode,
            } => FetchError::ArchiveMiss {
                method,
                url,
                hashcode,
            },
            other => FetchError::Archive(other),
        }
    }
}

// ============================================================================
// Transport Error
// ============================================================================

/// Error raised by a transport.
///
/// Serializable so that an archived failure replays identically.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportError {
    /// The request timed out.
    #[error("Request timed out")]
    Timeout,

    /// The origin refused the connection.
    #[error("Connection refused: {message}")]
    ConnectionRefused {
        /// Underlying error message.
        message: String,
    },

    /// Any other connection or read failure.
    #[error("Connection failed: {message}")]
    Connection {
        /// Underlying error message.
        message: String,
    },

    /// The redirect limit was exceeded.
    #[error("Too many redirects")]
    TooManyRedirects,

    /// The origin answered with an error status.
    ///
    /// Raised immediately for statuses that are not retried, and after the
    /// last retry for statuses that are.
    #[error("HTTP status {status}")]
    HttpStatus {
        /// Status code.
        status: u16,
        /// Response body, kept for diagnostics.
        body: String,
        /// Response headers, so quota carried by error statuses is still read.
        #[serde(default)]
        headers: Headers,
    },

    /// Connection-level retries were exhausted.
    #[error("Retry limit reached after {attempts} attempts: {last}")]
    RetryLimit {
        /// Number of attempts made.
        attempts: u32,
        /// The last connection-level failure.
        last: Box<TransportError>,
    },

    /// The request could not be built.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// What was wrong.
        message: String,
    },
}

impl TransportError {
    /// Returns true for connection-level failures that are retried.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::ConnectionRefused { .. }
                | Self::Connection { .. }
                | Self::TooManyRedirects
        )
    }

    /// Returns the status code of an HTTP status error.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_redirect() {
            TransportError::TooManyRedirects
        } else if err.is_connect() {
            TransportError::ConnectionRefused {
                message: err.to_string(),
            }
        } else if err.is_builder() {
            TransportError::InvalidRequest {
                message: err.to_string(),
            }
        } else {
            TransportError::Connection {
                message: err.to_string(),
            }
        }
    }
}

// ============================================================================
// Archive Error
// ============================================================================

/// Error type for archive operations.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// No entry for the requested fingerprint.
    #[error("No archived entry for {method} {url}")]
    Miss {
        /// Request method.
        method: String,
        /// Request URL.
        url: String,
        /// Fingerprint hashcode.
        hashcode: String,
    },

    /// The archive metadata is missing or inconsistent.
    #[error("Invalid archive metadata: {0}")]
    Metadata(String),

    /// The storage backend failed.
    #[error("Archive storage failed: {0}")]
    Storage(String),

    /// An entry could not be encoded or decoded.
    #[error("Archive serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Credential Error
// ============================================================================

/// Error type for credential minting and refresh.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The signing key could not be loaded.
    #[error("Invalid signing key: {0}")]
    InvalidKey(String),

    /// Signing the assertion failed.
    #[error("Signing failed")]
    Signing,

    /// The identity endpoint rejected the exchange.
    #[error("Token exchange failed with status {status}: {body}")]
    ExchangeRejected {
        /// Status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The identity endpoint could not be reached.
    #[error("Token exchange request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// No installation matched the configured account.
    #[error("No installation found for account {0}")]
    InstallationNotFound(String),

    /// The identity endpoint answered with something unexpected.
    #[error("Invalid token response: {0}")]
    InvalidResponse(String),

    /// Every credential in the pool failed to mint.
    #[error("No usable credential in pool")]
    NoUsableCredential,
}

// ============================================================================
// Tests
// ============================================================================
