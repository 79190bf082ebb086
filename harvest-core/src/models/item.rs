//! Normalized items with provenance metadata.
//!
//! Adapters turn raw pages into typed data; the [`Provenance`] of the fetch
//! run then stamps every record with where, when and by what it was fetched.

use chrono::{DateTime, Utc};
use ring::digest::{SHA1_FOR_LEGACY_USE_ONLY, digest};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Version of the harvesting library recorded in every item.
pub const HARVEST_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Generates a stable identifier from the given parts.
///
/// The identifier is the SHA-1 hex digest of the parts joined by `:`.
/// Every part must be non-empty.
pub fn uuid(parts: &[&str]) -> Result<String, CoreError> {
    if parts.iter().any(|part| part.is_empty()) {
        return Err(CoreError::EmptyIdentifierPart);
    }

    let joined = parts.join(":");
    Ok(hex::encode(digest(
        &SHA1_FOR_LEGACY_USE_ONLY,
        joined.as_bytes(),
    )))
}

// ============================================================================
// Provenance
// ============================================================================

/// Describes one fetch run: which adapter fetched which origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Adapter name (e.g. "GitHub").
    pub backend_name: String,
    /// Adapter version.
    pub backend_version: String,
    /// Origin the data came from.
    pub origin: String,
    /// Optional user label for the origin; defaults to the origin itself.
    pub tag: String,
}

impl Provenance {
    /// Creates provenance for an origin, tagging it with the origin.
    pub fn new(
        backend_name: impl Into<String>,
        backend_version: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        let origin = origin.into();
        Self {
            backend_name: backend_name.into(),
            backend_version: backend_version.into(),
            tag: origin.clone(),
            origin,
        }
    }

    /// Overrides the tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Wraps raw data into an [`Item`].
    ///
    /// `id` is the origin's own identifier for the record; it is combined
    /// with the origin to produce the item `uuid`.
    pub fn stamp(
        &self,
        id: &str,
        category: impl Into<String>,
        updated_on: DateTime<Utc>,
        data: serde_json::Value,
    ) -> Result<Item, CoreError> {
        Ok(Item {
            backend_name: self.backend_name.clone(),
            backend_version: self.backend_version.clone(),
            harvest_version: HARVEST_VERSION.to_string(),
            timestamp: Utc::now(),
            origin: self.origin.clone(),
            uuid: uuid(&[&self.origin, id])?,
            updated_on,
            category: category.into(),
            tag: self.tag.clone(),
            search_fields: serde_json::Map::new(),
            data,
        })
    }
}

// ============================================================================
// Item
// ============================================================================

/// A normalized record plus how and when it was fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Adapter name.
    pub backend_name: String,
    /// Adapter version.
    pub backend_version: String,
    /// Library version.
    pub harvest_version: String,
    /// When the item was produced.
    pub timestamp: DateTime<Utc>,
    /// Origin the item came from.
    pub origin: String,
    /// Stable identifier derived from the origin and the record id.
    pub uuid: String,
    /// When the record was last updated at the origin.
    pub updated_on: DateTime<Utc>,
    /// Item category (e.g. "issue", "pull_request").
    pub category: String,
    /// Tag of the run.
    pub tag: String,
    /// Fields an indexer may search on.
    #[serde(default)]
    pub search_fields: serde_json::Map<String, serde_json::Value>,
    /// The raw record.
    pub data: serde_json::Value,
}

impl Item {
    /// Adds a search field.
    pub fn with_search_field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.search_fields.insert(name.into(), value);
        self
    }
}
