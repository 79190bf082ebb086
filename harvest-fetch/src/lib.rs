// Lint configuration for this crate
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

//! # Harvest Fetch
//!
//! The resilient fetch substrate every Harvest adapter sits on.
//!
//! ## Parts
//!
//! - [`transport`] - HTTP transport with retry, backoff and `Retry-After`
//! - [`ratelimit`] - Quota tracking that sleeps or fails before exhaustion
//! - [`credentials`] - Credential pool with rotation and minted tokens
//! - [`archive`] / [`sanitize`] - Record/replay of sanitized exchanges
//! - [`session`] - Composes the above for one origin
//! - [`fetch_log`] - Checkpointed nested fetches that replay deterministically
//!
//! ## Example
//!
//! ```ignore
//! use harvest_fetch::{MemoryArchive, Session, SessionConfig, SessionMode};
//!
//! let config = SessionConfig::new("https://api.github.com").with_token("ghp_...");
//! let mut session = Session::from_config(&config, SessionMode::Record(Box::new(MemoryArchive::new())))?;
//!
//! let repo = session.get("repos/chaoss/grimoirelab", &[]).await?;
//! ```

pub mod archive;
pub mod config;
pub mod credentials;
pub mod error;
pub mod fetch_log;
pub mod pagination;
pub mod ratelimit;
pub mod retry;
pub mod sanitize;
pub mod session;
pub mod transport;

// Errors
pub use error::{ArchiveError, CredentialError, ErrorKind, FetchError, TransportError};

// Transport
pub use retry::{FailureClassifier, RetryPolicy, Verdict};
pub use transport::{HttpTransport, HttpTransportBuilder, Transport};

// Rate limits & credentials
pub use credentials::{
    AssertionMinter, Credential, CredentialMinter, CredentialPool, Installation, MintedToken,
    QuotaProber,
};
pub use ratelimit::{HeaderProfile, RateLimitProfile, RateLimiter, ResetEncoding};

// Archive
pub use archive::{
    Archive, ArchiveEntry, ArchiveMetadata, ArchivedOutcome, Checkpoint, MemoryArchive,
};
pub use sanitize::{IdentitySanitizer, Sanitizer, StripSecrets};

// Session
pub use config::{AppCredentials, AuthScheme, SessionConfig};
pub use fetch_log::{
    CheckpointReader, CheckpointWriter, Enrichment, EnrichmentCache, NestedFetch, Scope,
};
pub use pagination::{CursorPagination, LinkHeader, OffsetPagination, PageRequest, Paginate};
pub use session::{Pages, Session, SessionBuilder, SessionMode};
