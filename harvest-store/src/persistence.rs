//! File persistence helpers.
//!
//! JSON files written atomically with owner-only permissions, the default
//! locations Harvest uses, and session configuration loading.

use serde::{Serialize, de::DeserializeOwned};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use harvest_fetch::SessionConfig;

use crate::error::StoreError;

// ============================================================================
// Default Paths
// ============================================================================

/// Returns the default configuration directory.
///
/// - Linux: `~/.config/harvest`
/// - macOS: `~/Library/Application Support/harvest`
/// - Windows: `%APPDATA%\harvest`
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|c| c.join("harvest"))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns the default directory archives are stored under.
///
/// - Linux: `~/.local/share/harvest/archives`
/// - macOS: `~/Library/Application Support/harvest/archives`
/// - Windows: `%APPDATA%\harvest\archives`
pub fn default_archive_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("harvest").join("archives"))
        .unwrap_or_else(|| PathBuf::from("archives"))
}

/// Returns the default session configuration file path.
pub fn default_session_config_path() -> PathBuf {
    default_config_dir().join("session.json")
}

// ============================================================================
// Security: File Permissions
// ============================================================================

/// Sets owner-only file permissions (0o600) on Unix systems.
#[cfg(unix)]
async fn set_restrictive_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o600);
    tokio::fs::set_permissions(path, perms).await?;

    debug!(path = %path.display(), mode = "0600", "Set restrictive permissions");
    Ok(())
}

/// Sets owner-only directory permissions (0o700) on Unix systems.
#[cfg(unix)]
async fn set_restrictive_dir_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o700);
    tokio::fs::set_permissions(path, perms).await?;

    debug!(path = %path.display(), mode = "0700", "Set restrictive directory permissions");
    Ok(())
}

#[cfg(not(unix))]
async fn set_restrictive_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(not(unix))]
async fn set_restrictive_dir_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

// ============================================================================
// File Operations
// ============================================================================

/// Saves data to a JSON file with owner-only permissions.
///
/// Creates the parent directory if needed (0o700 on Unix) and writes
/// through a temp file and rename so readers never see a partial file.
pub async fn save_json<T: Serialize>(path: &Path, data: &T) -> Result<(), StoreError> {
    debug!(path = %path.display(), "Saving JSON file");

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_dir(parent).await?;
    }

    let json = serde_json::to_string_pretty(data)?;

    let temp_path = path.with_extension("json.tmp");
    tokio::fs::write(&temp_path, &json).await?;
    set_restrictive_permissions(&temp_path).await?;
    tokio::fs::rename(&temp_path, path).await?;

    debug!(path = %path.display(), "JSON file saved");
    Ok(())
}

/// Loads data from a JSON file.
pub async fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    debug!(path = %path.display(), "Loading JSON file");

    let content = tokio::fs::read_to_string(path).await?;
    let data = serde_json::from_str(&content)?;

    Ok(data)
}

/// Loads data from a JSON file, returning default if not found.
pub async fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match load_json(path).await {
        Ok(data) => data,
        Err(e) => {
            if !matches!(e, StoreError::Io(_)) {
                warn!(path = %path.display(), error = %e, "Failed to load, using defaults");
            }
            T::default()
        }
    }
}

/// Ensures a directory exists with owner-only permissions.
pub async fn ensure_dir(path: &Path) -> Result<(), StoreError> {
    if !path.exists() {
        debug!(path = %path.display(), "Creating directory");
        tokio::fs::create_dir_all(path).await?;
        set_restrictive_dir_permissions(path).await?;
    }
    Ok(())
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Loads and validates a session configuration file.
///
/// Missing fields take their defaults; an invalid result is a
/// [`StoreError::Config`].
pub async fn load_session_config(path: &Path) -> Result<SessionConfig, StoreError> {
    if !path.is_file() {
        return Err(StoreError::NotFound(path.display().to_string()));
    }

    let config: SessionConfig = load_json(path).await?;
    config
        .validate()
        .map_err(|e| StoreError::Config(format!("{}: {e}", path.display())))?;

    info!(path = %path.display(), base_url = %config.base_url, "Loaded session config");
    Ok(config)
}

/// Saves a session configuration file.
///
/// The file may hold tokens, so it is written owner-only.
pub async fn save_session_config(path: &Path, config: &SessionConfig) -> Result<(), StoreError> {
    config
        .validate()
        .map_err(|e| StoreError::Config(e.to_string()))?;
    save_json(path, config).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths() {
        assert!(default_config_dir().ends_with("harvest"));
        assert!(default_archive_dir().ends_with("archives"));
        assert!(default_session_config_path().ends_with("session.json"));
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data.json");

        save_json(&path, &vec![1, 2, 3]).await.unwrap();
        let loaded: Vec<u32> = load_json(&path).await.unwrap();

        assert_eq!(loaded, vec![1, 2, 3]);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_load_or_default_on_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let loaded: Vec<u32> = load_json_or_default(&path).await;
        assert!(loaded.is_empty());

        let missing: Vec<u32> = load_json_or_default(&dir.path().join("none.json")).await;
        assert!(missing.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("private").join("session.json");
        save_json(&path, &"secret").await.unwrap();

        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        let mode = tokio::fs::metadata(path.parent().unwrap())
            .await
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o700);
    }
}
