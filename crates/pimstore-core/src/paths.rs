//! On-disk layout of a store installation.
//!
//! Everything is derived from two roots: the configuration directory holding
//! the server config file, and the data directory holding the database,
//! external payload files and the migration scratch areas.

use std::path::{Path, PathBuf};

use crate::config::DbEngine;
use crate::error::Result;

const CONFIG_FILE_NAME: &str = "server.toml";
const PAYLOAD_DIR_NAME: &str = "file_db_data";
const MIGRATION_DIR_NAME: &str = "db_migration";
const MIGRATION_BACKUP_DIR_NAME: &str = "migration_backup";
const DB_DATA_DIR_NAME: &str = "db_data";
const SQLITE_FILE_NAME: &str = "pimstore.db";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    config_dir: PathBuf,
    data_dir: PathBuf,
}

impl StoragePaths {
    pub fn new(config_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            data_dir: data_dir.into(),
        }
    }

    /// Layout rooted in the user's home directory.
    pub fn from_home() -> Self {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self::new(
            home.join(".config").join("pimstore"),
            home.join(".local").join("share").join("pimstore"),
        )
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn server_config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE_NAME)
    }

    /// Directory holding externally stored part payloads.
    pub fn payload_dir(&self) -> PathBuf {
        self.data_dir.join(PAYLOAD_DIR_NAME)
    }

    /// Scratch location the migrator builds the new database in.
    pub fn migration_dir(&self) -> PathBuf {
        self.data_dir.join(MIGRATION_DIR_NAME)
    }

    /// Where the previous database is parked while a migration runs.
    pub fn migration_backup_dir(&self) -> PathBuf {
        self.data_dir.join(MIGRATION_BACKUP_DIR_NAME)
    }

    /// Default database location for `engine` below `base`.
    pub fn database_location(base: &Path, engine: DbEngine) -> PathBuf {
        if engine.is_file_based() {
            base.join(SQLITE_FILE_NAME)
        } else {
            base.join(DB_DATA_DIR_NAME)
        }
    }

    /// Default database location for `engine` in the data directory.
    pub fn default_database_path(&self, engine: DbEngine) -> PathBuf {
        Self::database_location(&self.data_dir, engine)
    }

    /// Create a directory below the data directory and return its path.
    pub fn save_dir(&self, name: &str) -> Result<PathBuf> {
        let dir = self.data_dir.join(name);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}
