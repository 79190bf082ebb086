// Lint configuration for this crate
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

//! # `Harvest` Core
//!
//! Core types shared by every `Harvest` crate.
//!
//! This crate is deliberately free of I/O. It provides:
//!
//! - HTTP request/response values that transports send and archives persist
//! - Request fingerprints (the archive lookup key)
//! - Quota state of a credential
//! - Redacted secrets
//! - The provenance envelope stamped on every normalized record
//!
//! ## Key Types
//!
//! - [`HttpRequest`] / [`HttpResponse`] - Plain request and response data
//! - [`Fingerprint`] - Sanitized request identity with a stable hashcode
//! - [`QuotaState`] - Remaining calls and reset time
//! - [`Secret`] - Credential value with redacted `Debug`
//! - [`Item`] / [`Provenance`] - Normalized records and their origin

pub mod error;
pub mod models;

// Re-export error types
pub use error::CoreError;

// Re-export all model types
pub use models::{
    Fingerprint, HARVEST_VERSION, Headers, HttpRequest, HttpResponse, Item, Method, Provenance,
    QuotaState, Secret, uuid,
};
