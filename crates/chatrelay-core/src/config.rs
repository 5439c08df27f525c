//! Configuration and data directory management.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// User id transcripts are attributed to when the caller is anonymous.
pub const DEFAULT_SYSTEM_USER_ID: i64 = 1;

/// Paths to all chatrelay data files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPaths {
    /// Root data directory (e.g., `data/`).
    pub root: PathBuf,
    /// Database directory (`data/db/`).
    pub db: PathBuf,
    /// App registry seed (`data/apps.json`).
    pub apps_file: PathBuf,
    /// Provider endpoint settings (`data/providers.json`).
    pub providers_file: PathBuf,
}

impl DataPaths {
    /// Create data paths from a root directory. Creates directories if needed.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        let paths = Self {
            db: root.join("db"),
            apps_file: root.join("apps.json"),
            providers_file: root.join("providers.json"),
            root,
        };
        std::fs::create_dir_all(&paths.db)?;
        Ok(paths)
    }
}

/// Top-level chatrelay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// HTTP server port.
    pub port: u16,
    /// Data directory paths.
    pub data_paths: DataPaths,
    /// Owner recorded on conversations when no caller identity is supplied.
    pub system_user_id: i64,
}

impl RelayConfig {
    /// Create configuration from environment and defaults.
    pub fn from_env(data_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3010);

        let system_user_id = match std::env::var("CHATRELAY_SYSTEM_USER_ID") {
            Ok(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(
                    "Ignoring invalid CHATRELAY_SYSTEM_USER_ID '{}', using {}",
                    raw, DEFAULT_SYSTEM_USER_ID
                );
                DEFAULT_SYSTEM_USER_ID
            }),
            Err(_) => DEFAULT_SYSTEM_USER_ID,
        };

        let data_paths = DataPaths::new(data_dir)?;

        Ok(Self {
            port,
            data_paths,
            system_user_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_paths_layout() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path()).unwrap();
        assert!(paths.db.is_dir());
        assert_eq!(paths.apps_file, dir.path().join("apps.json"));
        assert_eq!(paths.providers_file, dir.path().join("providers.json"));
    }
}
