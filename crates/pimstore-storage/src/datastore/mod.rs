//! The transactional data-access layer.
//!
//! A [`DataStore`] owns exactly one database connection and is confined to
//! the thread (or task) that created it. Transactions nest: only the
//! outermost begin/commit/rollback reaches the database. Rolling back at
//! any depth dooms the whole outer transaction.

mod collections;
mod entities;
mod flags;
mod items;
mod relations;
mod tags;

use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use pimstore_core::config::{DbEngine, ServerConfig};
use pimstore_core::error::{PimError, Result};
use pimstore_core::events::ChangeNotification;
use pimstore_core::paths::StoragePaths;
use pimstore_core::types::EntityId;

use crate::cache::EntityCache;
use crate::connection::{DbConnection, SqliteConnection};
use crate::engine::SqlDialect;
use crate::initializer;
use crate::notification::{NotificationCollector, NotificationSubscriber};
use crate::parts::ExternalPartStorage;
use crate::registry::{ConnectionInfo, ConnectionRegistry, StoreId};
use crate::transaction::Transaction;
use crate::value::{SqlRow, SqlValue};

pub use flags::FlagChange;
pub use items::{NewPimItem, HIDDEN_ATTRIBUTE};
pub use tags::TagChange;

/// Settings a store needs besides its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    /// Directory for externally stored payloads.
    pub payload_dir: PathBuf,
    /// Payloads larger than this are stored as files.
    pub size_threshold: u64,
}

impl StoreSettings {
    pub fn new(payload_dir: impl Into<PathBuf>, size_threshold: u64) -> Self {
        Self {
            payload_dir: payload_dir.into(),
            size_threshold,
        }
    }

    pub fn from_config(config: &ServerConfig, paths: &StoragePaths) -> Self {
        Self::new(paths.payload_dir(), config.size_threshold())
    }
}

/// Creates stores for worker threads. Each call yields an independent
/// store with its own connection.
pub trait DataStoreFactory: Send + Sync {
    fn create_store(&self) -> Result<DataStore>;
}

/// Factory opening SQLite database files.
#[derive(Debug, Clone)]
pub struct SqliteStoreFactory {
    db_path: PathBuf,
    settings: StoreSettings,
}

impl SqliteStoreFactory {
    pub fn new(db_path: impl Into<PathBuf>, settings: StoreSettings) -> Self {
        Self {
            db_path: db_path.into(),
            settings,
        }
    }
}

impl DataStoreFactory for SqliteStoreFactory {
    fn create_store(&self) -> Result<DataStore> {
        DataStore::open_sqlite(&self.db_path, self.settings.clone())
    }
}

pub struct DataStore {
    id: StoreId,
    conn: Box<dyn DbConnection>,
    engine: DbEngine,
    open: bool,
    transaction_level: u32,
    rollback_only: bool,
    killed_by_db: bool,
    notifications: NotificationCollector,
    cache: EntityCache,
    external: ExternalPartStorage,
    size_threshold: u64,
}

impl DataStore {
    /// Wrap an already open connection.
    pub fn new(conn: Box<dyn DbConnection>, settings: StoreSettings) -> Result<Self> {
        if !conn.is_open() {
            return Err(PimError::Connection(
                "cannot create a store on a closed connection".into(),
            ));
        }
        let engine = conn.engine();
        let id = ConnectionRegistry::global().register(ConnectionInfo::current(engine));
        debug!(store = id, engine = %engine, "Data store opened");

        Ok(Self {
            id,
            conn,
            engine,
            open: true,
            transaction_level: 0,
            rollback_only: false,
            killed_by_db: false,
            notifications: NotificationCollector::new(),
            cache: EntityCache::new(),
            external: ExternalPartStorage::new(settings.payload_dir),
            size_threshold: settings.size_threshold,
        })
    }

    pub fn open_sqlite(path: &Path, settings: StoreSettings) -> Result<Self> {
        Self::new(Box::new(SqliteConnection::open(path)?), settings)
    }

    /// Create missing tables and seed the built-in rows.
    pub fn init(&mut self) -> Result<()> {
        initializer::initialize(self.conn.as_mut())?;
        info!(store = self.id, "Database schema initialized");
        Ok(())
    }

    pub fn id(&self) -> StoreId {
        self.id
    }

    pub fn engine(&self) -> DbEngine {
        self.engine
    }

    pub fn is_open(&self) -> bool {
        self.open && self.conn.is_open()
    }

    pub fn size_threshold(&self) -> u64 {
        self.size_threshold
    }

    pub fn set_size_threshold(&mut self, threshold: u64) {
        self.size_threshold = threshold;
    }

    pub fn external_storage(&self) -> &ExternalPartStorage {
        &self.external
    }

    pub fn external_storage_mut(&mut self) -> &mut ExternalPartStorage {
        &mut self.external
    }

    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }

    pub(crate) fn cache_mut(&mut self) -> &mut EntityCache {
        &mut self.cache
    }

    /// Raw access to the connection, bypassing transaction bookkeeping.
    pub fn connection(&mut self) -> &mut dyn DbConnection {
        self.conn.as_mut()
    }

    pub fn subscribe(&mut self, subscriber: impl NotificationSubscriber + 'static) {
        self.notifications.subscribe(subscriber);
    }

    pub fn notifications(&self) -> &NotificationCollector {
        &self.notifications
    }

    pub(crate) fn notify(&mut self, notification: ChangeNotification) {
        let in_transaction = self.in_transaction();
        self.notifications.collect(notification, in_transaction);
    }

    /// Close the connection, rolling back an open transaction first.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        if self.in_transaction() {
            warn!(
                store = self.id,
                level = self.transaction_level,
                "Closing store with open transaction, rolling back"
            );
            self.transaction_level = 1;
            if let Err(e) = self.rollback_transaction() {
                warn!(store = self.id, error = %e, "Rollback on close failed");
            }
        }
        self.conn.close();
        self.open = false;
        ConnectionRegistry::global().unregister(self.id);
        debug!(store = self.id, "Data store closed");
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    pub fn in_transaction(&self) -> bool {
        self.transaction_level > 0
    }

    pub fn transaction_level(&self) -> u32 {
        self.transaction_level
    }

    /// Begin a scoped transaction that rolls back unless committed.
    pub fn transaction(&mut self, name: &str) -> Result<Transaction<'_>> {
        Transaction::new(self, name)
    }

    pub fn begin_transaction(&mut self, name: &str) -> Result<()> {
        if !self.is_open() {
            return Err(PimError::Connection(format!(
                "cannot begin transaction {}: database is not open",
                name
            )));
        }

        if self.transaction_level == 0 || self.killed_by_db {
            self.killed_by_db = false;
            self.rollback_only = false;
            self.conn.execute_batch(self.engine.begin_statement())?;
            if let Some(defer) = self.engine.defer_constraints_statement() {
                if let Err(e) = self.conn.execute_batch(defer) {
                    let _ = self.conn.execute_batch(self.engine.rollback_statement());
                    return Err(e);
                }
            }
            self.external.begin_transaction();
        }

        self.transaction_level += 1;
        debug!(store = self.id, name, level = self.transaction_level, "Transaction begun");
        Ok(())
    }

    /// Commit one nesting level. Only the outermost level commits
    /// physically; if that fails the transaction is rolled back.
    pub fn commit_transaction(&mut self) -> Result<()> {
        if !self.is_open() {
            return Err(PimError::Connection("database is not open".into()));
        }
        if self.transaction_level == 0 {
            return Err(PimError::Transaction(
                "commit requested without a transaction".into(),
            ));
        }
        if self.transaction_level > 1 {
            self.transaction_level -= 1;
            return Ok(());
        }

        self.transaction_level = 0;

        if self.killed_by_db {
            warn!(store = self.id, "Transaction was killed by the database, not committing");
            return Err(PimError::Transaction(
                "transaction was killed by the database".into(),
            ));
        }

        if self.rollback_only {
            warn!(store = self.id, "Inner transaction was rolled back, rolling back outer transaction");
            self.physical_rollback()?;
            return Err(PimError::Transaction(
                "transaction rolled back because a nested transaction failed".into(),
            ));
        }

        if let Err(e) = self.conn.execute_batch(self.engine.commit_statement()) {
            error!(store = self.id, error = %e, "Commit failed, rolling back");
            let _ = self.physical_rollback();
            return Err(e);
        }

        self.external.commit_transaction();
        self.notifications.transaction_committed();
        Ok(())
    }

    /// Roll back one nesting level. Inner levels only doom the outer
    /// transaction; the outermost level rolls back physically.
    pub fn rollback_transaction(&mut self) -> Result<()> {
        if !self.is_open() {
            return Err(PimError::Connection("database is not open".into()));
        }
        if self.transaction_level == 0 {
            return Err(PimError::Transaction(
                "rollback requested without a transaction".into(),
            ));
        }

        self.transaction_level -= 1;
        if self.transaction_level > 0 {
            self.rollback_only = true;
            debug!(store = self.id, level = self.transaction_level, "Nested rollback, outer transaction doomed");
            return Ok(());
        }

        if self.killed_by_db {
            // Everything was cleaned up when the kill was detected.
            return Ok(());
        }
        self.physical_rollback()
    }

    /// The database aborted the running transaction on its own.
    pub fn transaction_killed_by_db(&mut self) {
        if self.killed_by_db {
            return;
        }
        warn!(store = self.id, "Transaction killed by the database");
        self.killed_by_db = true;
        self.cleanup_after_rollback();
    }

    pub fn is_transaction_killed_by_db(&self) -> bool {
        self.killed_by_db
    }

    fn physical_rollback(&mut self) -> Result<()> {
        let result = self.conn.execute_batch(self.engine.rollback_statement());
        if let Err(e) = &result {
            error!(store = self.id, error = %e, "Physical rollback failed");
        }
        self.cleanup_after_rollback();
        result
    }

    fn cleanup_after_rollback(&mut self) {
        self.rollback_only = false;
        self.cache.invalidate_all();
        self.external.rollback_transaction();
        self.notifications.transaction_rolled_back();
    }

    // =========================================================================
    // Statement helpers
    // =========================================================================

    fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err()
            && self.transaction_level > 0
            && !self.killed_by_db
            && !self.conn.in_transaction()
        {
            self.transaction_killed_by_db();
        }
        result
    }

    pub fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        let result = self.conn.execute(sql, params);
        self.check(result)
    }

    pub fn execute_batch(&mut self, sql: &str) -> Result<()> {
        let result = self.conn.execute_batch(sql);
        self.check(result)
    }

    pub fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        let result = self.conn.query(sql, params);
        self.check(result)
    }

    pub fn insert(&mut self, sql: &str, params: &[SqlValue]) -> Result<EntityId> {
        let result = self.conn.insert(sql, params);
        self.check(result)
    }
}

impl Drop for DataStore {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for DataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStore")
            .field("id", &self.id)
            .field("engine", &self.engine)
            .field("open", &self.open)
            .field("transaction_level", &self.transaction_level)
            .finish()
    }
}

/// `?, ?, ?` for `n` parameters.
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::connection::{InstrumentedConnection, StatementLog};

    /// Initialized in-memory store recording its statements.
    pub fn recorded_store(threshold: u64) -> (tempfile::TempDir, DataStore, StatementLog) {
        let dir = tempfile::tempdir().unwrap();
        let conn = InstrumentedConnection::new(Box::new(SqliteConnection::in_memory().unwrap()));
        let log = conn.log();
        let mut store = DataStore::new(
            Box::new(conn),
            StoreSettings::new(dir.path().join("file_db_data"), threshold),
        )
        .unwrap();
        store.init().unwrap();
        log.lock().unwrap().clear();
        (dir, store, log)
    }

    pub fn store() -> (tempfile::TempDir, DataStore) {
        let (dir, store, _) = recorded_store(4096);
        (dir, store)
    }

    /// Top-level collection of a test resource.
    pub fn test_collection(store: &mut DataStore, name: &str) -> EntityId {
        let resource = store.resource_by_name_or_create("test_resource").unwrap();
        let mut collection = pimstore_core::types::Collection::new(name, None, resource.id);
        store.append_collection(&mut collection, &[], &[]).unwrap();
        collection.id
    }

    pub fn count(log: &StatementLog, statement: &str) -> usize {
        log.lock()
            .unwrap()
            .iter()
            .filter(|s| s.as_str() == statement)
            .count()
    }
}
