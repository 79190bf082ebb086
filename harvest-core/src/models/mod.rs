//! Domain models for Harvest.
//!
//! ## Submodules
//!
//! - [`http`] - Request/response values (Method, HttpRequest, HttpResponse)
//! - [`fingerprint`] - Sanitized request identity used as an archive key
//! - [`quota`] - Remaining quota and reset time of a credential
//! - [`secret`] - Redacted credential values
//! - [`item`] - Provenance envelope for normalized records

pub mod fingerprint;
pub mod http;
pub mod item;
pub mod quota;
pub mod secret;

// Re-export everything at the models level
pub use fingerprint::Fingerprint;
pub use http::{Headers, HttpRequest, HttpResponse, Method};
pub use item::{HARVEST_VERSION, Item, Provenance, uuid};
pub use quota::QuotaState;
pub use secret::Secret;
