//! CLI argument definitions for the database migrator.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::Parser;
use std::path::PathBuf;

use pimstore_core::paths::StoragePaths;

/// Migrate the PIM store to another database engine.
#[derive(Parser, Debug)]
#[command(name = "pimstore-dbmigrator", version, about)]
pub struct CliArgs {
    /// Database engine to migrate to: sqlite, mysql or postgres.
    #[arg(long = "newengine")]
    pub new_engine: String,

    /// Directory holding the server configuration file.
    #[arg(short = 'c', long = "config-dir")]
    pub config_dir: Option<PathBuf>,

    /// Directory holding the database and payload files.
    #[arg(short = 'd', long = "data-dir")]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,
}

impl CliArgs {
    /// Resolve the store layout.
    ///
    /// Each directory comes from its flag, then from `PIMSTORE_CONFIG_DIR`
    /// or `PIMSTORE_DATA_DIR`, then from the home directory layout.
    pub fn resolve_paths(&self) -> StoragePaths {
        let defaults = StoragePaths::from_home();
        let config_dir = self
            .config_dir
            .clone()
            .or_else(|| std::env::var("PIMSTORE_CONFIG_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| defaults.config_dir().to_path_buf());
        let data_dir = self
            .data_dir
            .clone()
            .or_else(|| std::env::var("PIMSTORE_DATA_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| defaults.data_dir().to_path_buf());
        StoragePaths::new(config_dir, data_dir)
    }

    /// Resolve the log level.
    ///
    /// Priority: --log-level flag > config file value.
    pub fn resolve_log_level(&self, config_level: &str) -> String {
        self.log_level
            .clone()
            .unwrap_or_else(|| config_level.to_string())
    }
}
