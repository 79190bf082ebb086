// Lint configuration for this crate
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

//! # Harvest Store
//!
//! On-disk persistence for Harvest.
//!
//! This crate provides:
//!
//! - **SqliteArchive**: an [`Archive`](harvest_fetch::Archive) in a SQLite file
//! - **ArchiveManager**: creates, finds and deletes archives under a root
//! - **Persistence**: JSON helpers and session config loading
//!
//! ## Usage
//!
//! ```ignore
//! use harvest_fetch::{ArchiveMetadata, Session, SessionMode};
//! use harvest_store::{ArchiveManager, ArchiveQuery, load_session_config};
//!
//! let config = load_session_config(&path).await?;
//! let manager = ArchiveManager::with_default_root();
//!
//! // Record a run
//! let archive = manager.create_archive(&metadata)?;
//! let mut session = Session::from_config(&config, SessionMode::Record(Box::new(archive)))?;
//!
//! // Later, replay the newest matching run
//! let query = ArchiveQuery::new(origin, "github", "issue");
//! if let Some(path) = manager.collect_archives(&query)?.pop() {
//!     let archive = manager.load_archive(&path)?;
//!     let session = Session::from_config(&config, SessionMode::Replay(Box::new(archive)))?;
//! }
//! ```

pub mod error;
pub mod manager;
pub mod persistence;
pub mod sqlite;

pub use error::StoreError;
pub use manager::{ArchiveManager, ArchiveQuery};
pub use persistence::{
    default_archive_dir, default_config_dir, default_session_config_path, ensure_dir, load_json,
    load_json_or_default, load_session_config, save_json, save_session_config,
};
pub use sqlite::{STORAGE_EXT, SqliteArchive};
