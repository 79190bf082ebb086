//! Request/response archives.
//!
//! An archive is an ordered, append-only log. Each entry is either a
//! recorded exchange (the sanitized request fingerprint plus the response
//! or the transport error it produced) or a positional [`Checkpoint`].
//! Records are also addressable by fingerprint hashcode for replay.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use harvest_core::{Fingerprint, HttpResponse};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{ArchiveError, TransportError};

/// What a recorded request produced.
pub type ArchivedOutcome = Result<HttpResponse, TransportError>;

// ============================================================================
// Entries
// ============================================================================

/// A boundary marker in a nested fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "checkpoint", content = "marker", rename_all = "snake_case")]
pub enum Checkpoint {
    /// All enrichment for one item has been recorded.
    Item(String),
    /// All items of one page have been recorded.
    Page,
}

/// One entry of the ordered log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArchiveEntry {
    /// A recorded exchange.
    Record {
        /// Sanitized request identity.
        fingerprint: Fingerprint,
        /// Response or error.
        #[serde(with = "outcome_serde")]
        outcome: ArchivedOutcome,
    },
    /// A positional marker.
    Checkpoint(Checkpoint),
}

impl ArchiveEntry {
    /// Returns the checkpoint, if this entry is one.
    pub fn as_checkpoint(&self) -> Option<&Checkpoint> {
        match self {
            Self::Checkpoint(checkpoint) => Some(checkpoint),
            Self::Record { .. } => None,
        }
    }
}

/// Describes the fetch run an archive captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    /// Origin fetched.
    pub origin: String,
    /// Adapter name.
    pub backend_name: String,
    /// Adapter version.
    pub backend_version: String,
    /// Item category fetched.
    pub category: String,
    /// Adapter parameters of the run.
    #[serde(default)]
    pub params: serde_json::Value,
    /// When the archive was created.
    pub created_on: DateTime<Utc>,
}

impl ArchiveMetadata {
    /// Creates metadata stamped with the current time.
    pub fn new(
        origin: impl Into<String>,
        backend_name: impl Into<String>,
        backend_version: impl Into<String>,
        category: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        Self {
            origin: origin.into(),
            backend_name: backend_name.into(),
            backend_version: backend_version.into(),
            category: category.into(),
            params,
            created_on: Utc::now(),
        }
    }
}

// ============================================================================
// Archive Trait
// ============================================================================

/// Storage for one fetch run.
///
/// Implementors provide the three primitives; recording, replay lookup and
/// checkpointing are built on top of them.
pub trait Archive: Send {
    /// Appends an entry to the end of the log.
    fn append(&mut self, entry: ArchiveEntry) -> Result<(), ArchiveError>;

    /// Returns the first outcome recorded for `hashcode`.
    fn lookup(&self, hashcode: &str) -> Result<Option<ArchivedOutcome>, ArchiveError>;

    /// Returns every entry in written order.
    fn entries(&self) -> Result<Vec<ArchiveEntry>, ArchiveError>;

    /// Returns the run metadata, if set.
    fn metadata(&self) -> Result<Option<ArchiveMetadata>, ArchiveError>;

    /// Records an exchange.
    fn record(
        &mut self,
        fingerprint: Fingerprint,
        outcome: ArchivedOutcome,
    ) -> Result<(), ArchiveError> {
        trace!(url = %fingerprint.url, ok = outcome.is_ok(), "Recording exchange");
        self.append(ArchiveEntry::Record {
            fingerprint,
            outcome,
        })
    }

    /// Replays an exchange. A miss is an error, never a fallback.
    fn replay(&self, fingerprint: &Fingerprint) -> Result<ArchivedOutcome, ArchiveError> {
        let hashcode = fingerprint.hashcode();
        self.lookup(&hashcode)?.ok_or_else(|| ArchiveError::Miss {
            method: fingerprint.method.to_string(),
            url: fingerprint.url.clone(),
            hashcode,
        })
    }

    /// Appends a checkpoint.
    fn checkpoint(&mut self, checkpoint: Checkpoint) -> Result<(), ArchiveError> {
        debug!(?checkpoint, "Writing checkpoint");
        self.append(ArchiveEntry::Checkpoint(checkpoint))
    }
}

// ============================================================================
// Memory Archive
// ============================================================================

/// Archive held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryArchive {
    metadata: Option<ArchiveMetadata>,
    entries: Vec<ArchiveEntry>,
    index: HashMap<String, usize>,
}

impl MemoryArchive {
    /// Creates an empty archive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty archive with metadata.
    pub fn with_metadata(metadata: ArchiveMetadata) -> Self {
        Self {
            metadata: Some(metadata),
            ..Self::default()
        }
    }

    /// Rebuilds an archive from a log, e.g. one read back from disk.
    pub fn from_entries(entries: Vec<ArchiveEntry>) -> Self {
        let mut archive = Self::new();
        for entry in entries {
            archive.push(entry);
        }
        archive
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, entry: ArchiveEntry) {
        if let ArchiveEntry::Record { fingerprint, .. } = &entry {
            self.index
                .entry(fingerprint.hashcode())
                .or_insert(self.entries.len());
        }
        self.entries.push(entry);
    }
}

impl Archive for MemoryArchive {
    fn append(&mut self, entry: ArchiveEntry) -> Result<(), ArchiveError> {
        self.push(entry);
        Ok(())
    }

    fn lookup(&self, hashcode: &str) -> Result<Option<ArchivedOutcome>, ArchiveError> {
        Ok(self
            .index
            .get(hashcode)
            .and_then(|position| match &self.entries[*position] {
                ArchiveEntry::Record { outcome, .. } => Some(outcome.clone()),
                ArchiveEntry::Checkpoint(_) => None,
            }))
    }

    fn entries(&self) -> Result<Vec<ArchiveEntry>, ArchiveError> {
        Ok(self.entries.clone())
    }

    fn metadata(&self) -> Result<Option<ArchiveMetadata>, ArchiveError> {
        Ok(self.metadata.clone())
    }
}

/// Archived outcomes are stored as `{"ok": response}` or `{"err": error}`.
pub mod outcome_serde {
    use harvest_core::HttpResponse;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::ArchivedOutcome;
    use crate::error::TransportError;

    #[derive(Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    enum Stored {
        Ok(HttpResponse),
        Err(TransportError),
    }

    /// Serializes an outcome.
    pub fn serialize<S: Serializer>(outcome: &ArchivedOutcome, serializer: S) -> Result<S::Ok, S::Error> {
        match outcome {
            Ok(response) => Stored::Ok(response.clone()),
            Err(error) => Stored::Err(error.clone()),
        }
        .serialize(serializer)
    }

    /// Deserializes an outcome.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ArchivedOutcome, D::Error> {
        Ok(match Stored::deserialize(deserializer)? {
            Stored::Ok(response) => Ok(response),
            Stored::Err(error) => Err(error),
        })
    }
}
