//! Database connection abstraction.
//!
//! [`DbConnection`] is the narrow interface the store and the migrator talk
//! to. [`SqliteConnection`] implements it on top of rusqlite with WAL mode
//! and the recommended PRAGMAs; [`crate::pg::PostgresConnection`] talks to
//! a running PostgreSQL server. Other engines plug in through the same trait.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{Connection, ToSql};
use tracing::{info, trace};

use pimstore_core::config::DbEngine;
use pimstore_core::error::{PimError, Result};
use pimstore_core::types::EntityId;

use crate::value::{SqlRow, SqlValue, TIMESTAMP_FORMAT};

/// A single database session.
///
/// Implementations are owned by exactly one store and may move between
/// threads, but are never shared.
pub trait DbConnection: Send {
    fn engine(&self) -> DbEngine;

    fn is_open(&self) -> bool;

    /// Run one statement, returning the number of affected rows.
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize>;

    /// Run one or more statements without parameters.
    fn execute_batch(&mut self, sql: &str) -> Result<()>;

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>>;

    /// Id generated by the most recent successful insert.
    fn last_insert_id(&self) -> EntityId;

    /// Whether the engine itself has a transaction open. Used to detect
    /// transactions the engine aborted on its own.
    fn in_transaction(&self) -> bool;

    fn close(&mut self);

    /// Insert a row and return its generated id.
    fn insert(&mut self, sql: &str, params: &[SqlValue]) -> Result<EntityId> {
        self.execute(sql, params)?;
        Ok(self.last_insert_id())
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            SqlValue::Bool(v) => ToSqlOutput::Owned(Value::Integer(*v as i64)),
            SqlValue::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            SqlValue::Blob(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
            SqlValue::Timestamp(v) => {
                ToSqlOutput::Owned(Value::Text(v.format(TIMESTAMP_FORMAT).to_string()))
            }
        })
    }
}

fn value_from_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(v) => SqlValue::Integer(v),
        // The schema declares no floating point columns.
        ValueRef::Real(v) => SqlValue::Text(v.to_string()),
        // Text that is not UTF-8 is kept as raw bytes.
        ValueRef::Text(v) => match std::str::from_utf8(v) {
            Ok(s) => SqlValue::Text(s.to_owned()),
            Err(_) => SqlValue::Blob(v.to_vec()),
        },
        ValueRef::Blob(v) => SqlValue::Blob(v.to_vec()),
    }
}

/// SQLite session backed by rusqlite.
pub struct SqliteConnection {
    conn: Option<Connection>,
    path: Option<PathBuf>,
}

impl SqliteConnection {
    /// Open (or create) a database file.
    ///
    /// Configures WAL mode, synchronous=NORMAL, foreign keys and a busy
    /// timeout so concurrent writers queue instead of failing immediately.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| PimError::Connection(format!("Failed to open database: {}", e)))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| PimError::Connection(format!("Failed to set pragmas: {}", e)))?;

        info!("Database opened at {}", path.display());

        Ok(Self {
            conn: Some(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| PimError::Connection(format!("Failed to open in-memory db: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| PimError::Connection(format!("Failed to set pragmas: {}", e)))?;

        Ok(Self {
            conn: Some(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| PimError::Connection("connection is closed".into()))
    }
}

impl DbConnection for SqliteConnection {
    fn engine(&self) -> DbEngine {
        DbEngine::Sqlite
    }

    fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached(sql)
            .map_err(|e| PimError::Integrity(format!("{} [{}]", e, sql)))?;
        stmt.execute(rusqlite::params_from_iter(params.iter()))
            .map_err(|e| PimError::Integrity(format!("{} [{}]", e, sql)))
    }

    fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.conn()?
            .execute_batch(sql)
            .map_err(|e| PimError::Integrity(format!("{} [{}]", e, sql)))
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached(sql)
            .map_err(|e| PimError::Integrity(format!("{} [{}]", e, sql)))?;
        let column_count = stmt.column_count();
        let mut rows = stmt
            .query(rusqlite::params_from_iter(params.iter()))
            .map_err(|e| PimError::Integrity(format!("{} [{}]", e, sql)))?;

        let mut result = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|e| PimError::Integrity(format!("{} [{}]", e, sql)))?
        {
            let mut values = Vec::with_capacity(column_count);
            for idx in 0..column_count {
                let value = row
                    .get_ref(idx)
                    .map_err(|e| PimError::Integrity(e.to_string()))?;
                values.push(value_from_ref(value));
            }
            result.push(SqlRow::new(values));
        }
        Ok(result)
    }

    fn last_insert_id(&self) -> EntityId {
        self.conn
            .as_ref()
            .map(|c| c.last_insert_rowid())
            .unwrap_or(0)
    }

    fn in_transaction(&self) -> bool {
        self.conn
            .as_ref()
            .map(|c| !c.is_autocommit())
            .unwrap_or(false)
    }

    fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err((_, e)) = conn.close() {
                tracing::warn!(error = %e, "Closing database connection failed");
            }
        }
    }
}

impl std::fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("path", &self.path)
            .field("open", &self.conn.is_some())
            .finish()
    }
}

/// Shared list of statements seen by an [`InstrumentedConnection`].
pub type StatementLog = Arc<Mutex<Vec<String>>>;

type FaultPredicate = Box<dyn Fn(&str) -> bool + Send>;

/// Connection wrapper that records every statement it forwards and can be
/// told to fail statements matching a predicate.
///
/// Statements are also emitted at trace level, which makes it the tool of
/// choice when diagnosing what a store sends to the engine.
pub struct InstrumentedConnection {
    inner: Box<dyn DbConnection>,
    log: StatementLog,
    fault: Option<FaultPredicate>,
}

impl InstrumentedConnection {
    pub fn new(inner: Box<dyn DbConnection>) -> Self {
        Self {
            inner,
            log: Arc::new(Mutex::new(Vec::new())),
            fault: None,
        }
    }

    /// Fail every statement for which `predicate` returns true.
    pub fn fail_when(mut self, predicate: impl Fn(&str) -> bool + Send + 'static) -> Self {
        self.fault = Some(Box::new(predicate));
        self
    }

    pub fn log(&self) -> StatementLog {
        Arc::clone(&self.log)
    }

    fn record(&self, sql: &str) -> Result<()> {
        trace!(sql, "statement");
        if let Ok(mut log) = self.log.lock() {
            log.push(sql.to_string());
        }
        match &self.fault {
            Some(predicate) if predicate(sql) => Err(PimError::Integrity(format!(
                "injected failure [{}]",
                sql
            ))),
            _ => Ok(()),
        }
    }
}

impl DbConnection for InstrumentedConnection {
    fn engine(&self) -> DbEngine {
        self.inner.engine()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        self.record(sql)?;
        self.inner.execute(sql, params)
    }

    fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.record(sql)?;
        self.inner.execute_batch(sql)
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        self.record(sql)?;
        self.inner.query(sql, params)
    }

    fn last_insert_id(&self) -> EntityId {
        self.inner.last_insert_id()
    }

    fn in_transaction(&self) -> bool {
        self.inner.in_transaction()
    }

    fn close(&mut self) {
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> SqliteConnection {
        let mut conn = SqliteConnection::in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT, flag BOOLEAN, data BLOB)")
            .unwrap();
        conn
    }

    #[test]
    fn test_insert_and_query() {
        let mut conn = memory();
        let id = conn
            .insert(
                "INSERT INTO t (name, flag, data) VALUES (?, ?, ?)",
                &["a".into(), true.into(), vec![1u8, 2].into()],
            )
            .unwrap();
        assert_eq!(id, 1);

        let rows = conn
            .query("SELECT id, name, flag, data FROM t WHERE id = ?", &[id.into()])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].string(1).unwrap(), "a");
        assert!(rows[0].bool(2).unwrap());
        assert_eq!(rows[0].bytes(3).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("test.db");
        let mut conn = SqliteConnection::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(conn.path(), Some(path.as_path()));
        conn.close();
        assert!(!conn.is_open());
        assert!(matches!(
            conn.execute_batch("SELECT 1"),
            Err(PimError::Connection(_))
        ));
    }

    #[test]
    fn test_sql_error_is_integrity_error() {
        let mut conn = memory();
        let err = conn.execute("INSERT INTO missing VALUES (1)", &[]).unwrap_err();
        assert!(matches!(err, PimError::Integrity(_)));
    }

    #[test]
    fn test_in_transaction_tracks_engine_state() {
        let mut conn = memory();
        assert!(!conn.in_transaction());
        conn.execute_batch("BEGIN").unwrap();
        assert!(conn.in_transaction());
        conn.execute_batch("ROLLBACK").unwrap();
        assert!(!conn.in_transaction());
    }

    #[test]
    fn test_instrumented_connection_records_and_fails() {
        let conn = InstrumentedConnection::new(Box::new(memory()))
            .fail_when(|sql| sql.starts_with("DELETE"));
        let log = conn.log();
        let mut conn = conn;

        conn.execute("INSERT INTO t (name) VALUES (?)", &["x".into()])
            .unwrap();
        assert!(conn.execute("DELETE FROM t", &[]).is_err());

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert!(log[1].starts_with("DELETE"));
    }
}
