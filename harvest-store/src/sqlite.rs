//! SQLite-backed archive.
//!
//! One database file holds one fetch run: a single metadata row and the
//! ordered entry log. Entries are stored as JSON next to their kind and,
//! for records, the fingerprint hashcode used for replay lookups.

use std::path::{Path, PathBuf};

use harvest_fetch::{Archive, ArchiveEntry, ArchiveError, ArchiveMetadata, ArchivedOutcome};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use tracing::{debug, trace};

use crate::error::StoreError;

/// File extension of archive databases.
pub const STORAGE_EXT: &str = "sqlite3";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS metadata (
        id INTEGER PRIMARY KEY CHECK (id = 0),
        metadata TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS entries (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        hashcode TEXT,
        entry TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS entries_hashcode ON entries (hashcode);
";

/// An archive stored in a SQLite database file.
#[derive(Debug)]
pub struct SqliteArchive {
    path: PathBuf,
    conn: Connection,
}

impl SqliteArchive {
    /// Creates a new archive file with the given metadata.
    ///
    /// Fails if a file already exists at `path`.
    pub fn create(path: impl Into<PathBuf>, metadata: &ArchiveMetadata) -> Result<Self, StoreError> {
        let path = path.into();
        if path.exists() {
            return Err(StoreError::Archive(ArchiveError::Storage(format!(
                "archive {} already exists",
                path.display()
            ))));
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;
        conn.execute(
            "INSERT INTO metadata (id, metadata) VALUES (0, ?1)",
            params![serde_json::to_string(metadata)?],
        )?;

        debug!(path = %path.display(), origin = %metadata.origin, "Created archive");
        Ok(Self { path, conn })
    }

    /// Opens an existing archive file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if !path.is_file() {
            return Err(StoreError::NotFound(path.display().to_string()));
        }

        let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
        let archive = Self { path, conn };

        // Reject files that are not archives before anyone appends to them.
        if archive.read_metadata().is_err() {
            return Err(StoreError::Archive(ArchiveError::Metadata(format!(
                "{} is not a valid archive",
                archive.path.display()
            ))));
        }

        debug!(path = %archive.path.display(), "Opened archive");
        Ok(archive)
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of entries.
    pub fn len(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Closes the database.
    pub fn close(self) -> Result<(), StoreError> {
        self.conn.close().map_err(|(_, err)| StoreError::Sqlite(err))
    }

    fn insert(&self, entry: &ArchiveEntry) -> Result<(), StoreError> {
        let (kind, hashcode) = match entry {
            ArchiveEntry::Record { fingerprint, .. } => ("record", Some(fingerprint.hashcode())),
            ArchiveEntry::Checkpoint(_) => ("checkpoint", None),
        };
        self.conn.execute(
            "INSERT INTO entries (kind, hashcode, entry) VALUES (?1, ?2, ?3)",
            params![kind, hashcode, serde_json::to_string(entry)?],
        )?;
        trace!(kind, "Appended archive entry");
        Ok(())
    }

    fn first_record(&self, hashcode: &str) -> Result<Option<ArchivedOutcome>, StoreError> {
        let stored: Option<String> = self
            .conn
            .query_row(
                "SELECT entry FROM entries WHERE hashcode = ?1 ORDER BY seq LIMIT 1",
                params![hashcode],
                |row| row.get(0),
            )
            .optional()?;

        match stored {
            None => Ok(None),
            Some(json) => match serde_json::from_str(&json)? {
                ArchiveEntry::Record { outcome, .. } => Ok(Some(outcome)),
                ArchiveEntry::Checkpoint(_) => Err(StoreError::Archive(ArchiveError::Storage(
                    format!("entry for {hashcode} is not a record"),
                ))),
            },
        }
    }

    fn read_entries(&self) -> Result<Vec<ArchiveEntry>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT entry FROM entries ORDER BY seq")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(serde_json::from_str(&row?)?);
        }
        Ok(entries)
    }

    fn read_metadata(&self) -> Result<Option<ArchiveMetadata>, StoreError> {
        let stored: Option<String> = self
            .conn
            .query_row("SELECT metadata FROM metadata WHERE id = 0", [], |row| row.get(0))
            .optional()?;
        Ok(stored.map(|json| serde_json::from_str(&json)).transpose()?)
    }
}

impl Archive for SqliteArchive {
    fn append(&mut self, entry: ArchiveEntry) -> Result<(), ArchiveError> {
        Ok(self.insert(&entry)?)
    }

    fn lookup(&self, hashcode: &str) -> Result<Option<ArchivedOutcome>, ArchiveError> {
        Ok(self.first_record(hashcode)?)
    }

    fn entries(&self) -> Result<Vec<ArchiveEntry>, ArchiveError> {
        Ok(self.read_entries()?)
    }

    fn metadata(&self) -> Result<Option<ArchiveMetadata>, ArchiveError> {
        Ok(self.read_metadata()?)
    }
}
