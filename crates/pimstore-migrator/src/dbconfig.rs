//! Per-engine database setup.
//!
//! A [`DbConfig`] knows where an engine keeps its data, how to bring up a
//! private server for it and how to open connections to it. SQLite and
//! PostgreSQL on an already running server are built in; other engines plug
//! in through a [`DbConfigFactory`].

use std::path::{Path, PathBuf};

use tracing::debug;

use pimstore_core::config::{DbEngine, DriverSettings, ServerConfig};
use pimstore_core::error::{PimError, Result};
use pimstore_core::paths::StoragePaths;
use pimstore_storage::{
    DataStore, DbConnection, PostgresConnection, SqlDialect, SqliteConnection, StoreSettings,
};

pub trait DbConfig: Send {
    fn engine(&self) -> DbEngine;

    fn driver_name(&self) -> &'static str {
        self.engine().name()
    }

    fn database_name(&self) -> String;

    /// File or directory holding the database's data.
    fn database_path(&self) -> PathBuf;

    /// Whether the data lives under [`DbConfig::database_path`]. A database
    /// on an external server has no local files to back up or move.
    fn has_local_data(&self) -> bool {
        true
    }

    /// Point this database at `path` and record it in `config`.
    fn set_database_path(&mut self, path: &Path, config: &mut ServerConfig);

    /// Per-connection setup run right after opening.
    fn apply(&self, conn: &mut dyn DbConnection) -> Result<()>;

    fn use_internal_server(&self) -> bool;

    fn start_internal_server(&mut self) -> Result<()>;

    fn stop_internal_server(&mut self);

    fn open_connection(&self) -> Result<Box<dyn DbConnection>>;

    fn disable_constraint_checks(&self, conn: &mut dyn DbConnection) -> Result<()> {
        let statement = conn.engine().disable_constraint_checks_statement();
        conn.execute_batch(statement)
    }

    fn enable_constraint_checks(&self, conn: &mut dyn DbConnection) -> Result<()> {
        let statement = conn.engine().enable_constraint_checks_statement();
        conn.execute_batch(statement)
    }

    /// Open a store with an initialized schema.
    fn open_store(&self, settings: StoreSettings) -> Result<DataStore> {
        let mut conn = self.open_connection()?;
        self.apply(conn.as_mut())?;
        let mut store = DataStore::new(conn, settings)?;
        store.init()?;
        Ok(store)
    }
}

/// Builds the [`DbConfig`] for the engine a server configuration selects.
pub trait DbConfigFactory: Send + Sync {
    /// `database_path` overrides the location stored in `config`.
    fn create(&self, config: &ServerConfig, database_path: Option<&Path>)
        -> Result<Box<dyn DbConfig>>;
}

#[derive(Debug, Clone)]
pub struct DefaultDbConfigFactory {
    paths: StoragePaths,
}

impl DefaultDbConfigFactory {
    pub fn new(paths: StoragePaths) -> Self {
        Self { paths }
    }
}

impl DbConfigFactory for DefaultDbConfigFactory {
    fn create(
        &self,
        config: &ServerConfig,
        database_path: Option<&Path>,
    ) -> Result<Box<dyn DbConfig>> {
        match config.general.driver {
            DbEngine::Sqlite => Ok(Box::new(SqliteDbConfig::from_config(
                config,
                &self.paths,
                database_path,
            ))),
            DbEngine::Postgres => Ok(Box::new(PostgresDbConfig::from_config(
                config,
                &self.paths,
                database_path,
            ))),
            engine => Err(PimError::Config(format!(
                "the {} backend is not built into this binary",
                engine
            ))),
        }
    }
}

/// SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteDbConfig {
    path: PathBuf,
    options: String,
}

impl SqliteDbConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            options: String::new(),
        }
    }

    /// Location from `override_path`, the `[sqlite]` group, or the default
    /// location in the data directory, in that order.
    pub fn from_config(
        config: &ServerConfig,
        paths: &StoragePaths,
        override_path: Option<&Path>,
    ) -> Self {
        let settings = config.driver_settings(DbEngine::Sqlite);
        let path = match override_path {
            Some(path) => path.to_path_buf(),
            None if !settings.name.trim().is_empty() => PathBuf::from(&settings.name),
            None => paths.default_database_path(DbEngine::Sqlite),
        };
        Self {
            path,
            options: settings.options.clone(),
        }
    }

    /// `PRAGMA` statements for the `;`-separated driver options.
    fn pragmas(&self) -> impl Iterator<Item = String> + '_ {
        self.options
            .split(';')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(|o| format!("PRAGMA {}", o))
    }
}

impl DbConfig for SqliteDbConfig {
    fn engine(&self) -> DbEngine {
        DbEngine::Sqlite
    }

    fn database_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn database_path(&self) -> PathBuf {
        self.path.clone()
    }

    fn set_database_path(&mut self, path: &Path, config: &mut ServerConfig) {
        self.path = path.to_path_buf();
        config.driver_settings_mut(DbEngine::Sqlite).name = path.to_string_lossy().into_owned();
    }

    fn apply(&self, conn: &mut dyn DbConnection) -> Result<()> {
        for pragma in self.pragmas() {
            debug!(pragma = %pragma, "Applying driver option");
            conn.execute_batch(&pragma)?;
        }
        Ok(())
    }

    fn use_internal_server(&self) -> bool {
        false
    }

    fn start_internal_server(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop_internal_server(&mut self) {}

    fn open_connection(&self) -> Result<Box<dyn DbConnection>> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Box::new(SqliteConnection::open(&self.path)?))
    }
}

/// PostgreSQL database.
///
/// Only an already running server is supported: with `start_server` set
/// the internal server cannot be brought up and the migration stops.
#[derive(Debug, Clone)]
pub struct PostgresDbConfig {
    settings: DriverSettings,
    data_path: PathBuf,
}

impl PostgresDbConfig {
    pub fn new(settings: DriverSettings) -> Self {
        Self {
            settings,
            data_path: PathBuf::new(),
        }
    }

    /// Settings from the `[postgres]` group. `override_path` or the default
    /// `db_data` directory is where an internal server would keep its data.
    pub fn from_config(
        config: &ServerConfig,
        paths: &StoragePaths,
        override_path: Option<&Path>,
    ) -> Self {
        let data_path = match override_path {
            Some(path) => path.to_path_buf(),
            None => paths.default_database_path(DbEngine::Postgres),
        };
        Self {
            settings: config.driver_settings(DbEngine::Postgres).clone(),
            data_path,
        }
    }
}

impl DbConfig for PostgresDbConfig {
    fn engine(&self) -> DbEngine {
        DbEngine::Postgres
    }

    fn database_name(&self) -> String {
        match self.settings.name.trim() {
            "" => "pimstore".to_string(),
            name => name.to_string(),
        }
    }

    fn database_path(&self) -> PathBuf {
        self.data_path.clone()
    }

    fn has_local_data(&self) -> bool {
        self.settings.start_server
    }

    fn set_database_path(&mut self, path: &Path, _config: &mut ServerConfig) {
        self.data_path = path.to_path_buf();
    }

    fn apply(&self, conn: &mut dyn DbConnection) -> Result<()> {
        // Timestamps are stored without zone.
        conn.execute_batch("SET TIME ZONE 'UTC'")
    }

    fn use_internal_server(&self) -> bool {
        self.settings.start_server
    }

    fn start_internal_server(&mut self) -> Result<()> {
        Err(PimError::Config(
            "an internal PostgreSQL server cannot be started; set start_server = false \
             in the [postgres] group and point host at a running server"
                .to_string(),
        ))
    }

    fn stop_internal_server(&mut self) {}

    fn open_connection(&self) -> Result<Box<dyn DbConnection>> {
        Ok(Box::new(PostgresConnection::connect(&self.settings)?))
    }
}
