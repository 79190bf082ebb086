//! Archive manager.
//!
//! Archives live under a root directory, one SQLite file per fetch run,
//! spread over two-character subdirectories of a random hex name:
//!
//! ```text
//! <root>/3f/9a2c...e1.sqlite3
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use harvest_fetch::{Archive, ArchiveMetadata};
use ring::rand::{SecureRandom, SystemRandom};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::persistence::default_archive_dir;
use crate::sqlite::{STORAGE_EXT, SqliteArchive};

/// Length in bytes of the random part of an archive name.
const NAME_BYTES: usize = 20;

/// Selects archives by the run they captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveQuery {
    /// Origin fetched.
    pub origin: String,
    /// Adapter name.
    pub backend_name: String,
    /// Adapter version; any version when `None`.
    pub backend_version: Option<String>,
    /// Item category.
    pub category: String,
    /// Only archives created at or after this instant.
    pub archived_after: Option<DateTime<Utc>>,
}

impl ArchiveQuery {
    /// Creates a query for any version and any creation time.
    pub fn new(
        origin: impl Into<String>,
        backend_name: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            origin: origin.into(),
            backend_name: backend_name.into(),
            backend_version: None,
            category: category.into(),
            archived_after: None,
        }
    }

    /// Restricts the query to one adapter version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.backend_version = Some(version.into());
        self
    }

    /// Restricts the query to archives created at or after `after`.
    #[must_use]
    pub fn archived_after(mut self, after: DateTime<Utc>) -> Self {
        self.archived_after = Some(after);
        self
    }

    fn matches(&self, metadata: &ArchiveMetadata) -> bool {
        metadata.origin == self.origin
            && metadata.backend_name == self.backend_name
            && metadata.category == self.category
            && self
                .backend_version
                .as_ref()
                .is_none_or(|version| *version == metadata.backend_version)
            && self
                .archived_after
                .is_none_or(|after| metadata.created_on >= after)
    }
}

/// Creates, finds and removes archives under a root directory.
#[derive(Debug, Clone)]
pub struct ArchiveManager {
    root: PathBuf,
    rng: SystemRandom,
}

impl ArchiveManager {
    /// Creates a manager rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            rng: SystemRandom::new(),
        }
    }

    /// Creates a manager rooted at the platform archive directory.
    pub fn with_default_root() -> Self {
        Self::new(default_archive_dir())
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates a new, empty archive for a run.
    pub fn create_archive(&self, metadata: &ArchiveMetadata) -> Result<SqliteArchive, StoreError> {
        let name = self.random_name()?;
        let (dir, file) = name.split_at(2);

        let dir = self.root.join(dir);
        fs::create_dir_all(&dir)?;

        let archive = SqliteArchive::create(dir.join(format!("{file}.{STORAGE_EXT}")), metadata)?;
        info!(path = %archive.path().display(), backend = %metadata.backend_name, "Archive created");
        Ok(archive)
    }

    /// Opens an existing archive.
    pub fn load_archive(&self, path: &Path) -> Result<SqliteArchive, StoreError> {
        SqliteArchive::open(path)
    }

    /// Deletes one archive.
    pub fn delete_archive(&self, path: &Path) -> Result<(), StoreError> {
        if !path.is_file() {
            return Err(StoreError::NotFound(path.display().to_string()));
        }
        fs::remove_file(path)?;

        // Drop the subdirectory once its last archive is gone.
        if let Some(parent) = path.parent() {
            if parent != self.root.as_path() && fs::read_dir(parent)?.next().is_none() {
                fs::remove_dir(parent)?;
            }
        }

        debug!(path = %path.display(), "Archive deleted");
        Ok(())
    }

    /// Deletes every archive under the root. Returns how many were removed.
    pub fn delete_archives(&self) -> Result<usize, StoreError> {
        let archives = self.archives()?;
        for path in &archives {
            self.delete_archive(path)?;
        }
        info!(count = archives.len(), root = %self.root.display(), "Archives deleted");
        Ok(archives.len())
    }

    /// Lists every archive file under the root.
    pub fn archives(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut found = Vec::new();
        if !self.root.is_dir() {
            return Ok(found);
        }

        for dir in fs::read_dir(&self.root)? {
            let dir = dir?.path();
            if !dir.is_dir() {
                continue;
            }
            for file in fs::read_dir(&dir)? {
                let file = file?.path();
                if file.is_file() && file.extension().is_some_and(|ext| ext == STORAGE_EXT) {
                    found.push(file);
                }
            }
        }

        found.sort();
        Ok(found)
    }

    /// Finds the archives of matching runs, oldest first.
    ///
    /// Files that cannot be read as archives are skipped with a warning.
    pub fn collect_archives(&self, query: &ArchiveQuery) -> Result<Vec<PathBuf>, StoreError> {
        let mut matching = Vec::new();

        for path in self.archives()? {
            let metadata = match SqliteArchive::open(&path).and_then(|a| Ok(a.metadata()?)) {
                Ok(Some(metadata)) => metadata,
                Ok(None) => {
                    warn!(path = %path.display(), "Archive has no metadata, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Unreadable archive, skipping");
                    continue;
                }
            };

            if query.matches(&metadata) {
                matching.push((metadata.created_on, path));
            }
        }

        matching.sort();
        debug!(count = matching.len(), origin = %query.origin, "Collected archives");
        Ok(matching.into_iter().map(|(_, path)| path).collect())
    }

    fn random_name(&self) -> Result<String, StoreError> {
        let mut bytes = [0u8; NAME_BYTES];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| StoreError::Io(std::io::Error::other("system random source failed")))?;
        Ok(hex::encode(bytes))
    }
}
