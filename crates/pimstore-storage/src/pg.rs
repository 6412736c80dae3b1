//! PostgreSQL session on top of the synchronous `postgres` client.
//!
//! Statements arrive with `?` placeholders and are renumbered to `$n`.
//! Parameters are bound by the type the server reports for each
//! placeholder, so a value is coerced to its column type on the way in.
//!
//! The server keeps a transaction open after a statement failed inside it
//! and turns the eventual `COMMIT` into a silent rollback. The connection
//! remembers such aborted transactions and fails the commit instead.

use std::error::Error as StdError;

use bytes::BytesMut;
use chrono::{DateTime, NaiveDateTime, Utc};
use postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use postgres::{Client, NoTls, Row};
use tracing::{info, warn};

use pimstore_core::config::{DbEngine, DriverSettings};
use pimstore_core::error::{PimError, Result};
use pimstore_core::types::EntityId;

use crate::connection::DbConnection;
use crate::value::{ColumnType, SqlRow, SqlValue};

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_DATABASE: &str = "pimstore";

pub struct PostgresConnection {
    client: Option<Client>,
    in_transaction: bool,
    aborted: bool,
    last_insert_id: EntityId,
}

impl PostgresConnection {
    /// Connect to the server described by a `[postgres]` settings group.
    pub fn connect(settings: &DriverSettings) -> Result<Self> {
        let config = connection_config(settings)?;
        let client = config
            .connect(NoTls)
            .map_err(|e| PimError::Connection(format!("Failed to connect to PostgreSQL: {}", e)))?;
        info!(
            host = %host_or_default(settings),
            database = %database_or_default(settings),
            "Connected to PostgreSQL"
        );
        Ok(Self {
            client: Some(client),
            in_transaction: false,
            aborted: false,
            last_insert_id: 0,
        })
    }

    fn client(&mut self) -> Result<&mut Client> {
        self.client
            .as_mut()
            .ok_or_else(|| PimError::Connection("connection is closed".into()))
    }

    /// Run `f` and keep the transaction state in step with `sql`.
    fn run<T>(
        &mut self,
        sql: &str,
        f: impl FnOnce(&mut Client) -> std::result::Result<T, postgres::Error>,
    ) -> Result<T> {
        let kind = StatementKind::of(sql);
        if kind == StatementKind::Commit && self.aborted {
            let _ = self.client()?.batch_execute("ROLLBACK");
            self.in_transaction = false;
            self.aborted = false;
            return Err(PimError::Transaction(
                "transaction was aborted by the server and has been rolled back".into(),
            ));
        }

        let result = f(self.client()?);
        match (kind, &result) {
            (StatementKind::Begin, Ok(_)) => {
                self.in_transaction = true;
                self.aborted = false;
            }
            (StatementKind::Commit | StatementKind::Rollback, _) => {
                self.in_transaction = false;
                self.aborted = false;
            }
            (StatementKind::Other, Err(_)) if self.in_transaction => self.aborted = true,
            _ => {}
        }
        result.map_err(|e| PimError::Integrity(format!("{} [{}]", e, sql)))
    }
}

impl DbConnection for PostgresConnection {
    fn engine(&self) -> DbEngine {
        DbEngine::Postgres
    }

    fn is_open(&self) -> bool {
        self.client.as_ref().map(|c| !c.is_closed()).unwrap_or(false)
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        let statement = numbered_placeholders(sql);
        let bound: Vec<PgParam<'_>> = params.iter().map(PgParam).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = bound.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let affected = self.run(sql, |client| client.execute(statement.as_str(), &refs))?;
        Ok(affected as usize)
    }

    fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.run(sql, |client| client.batch_execute(sql))
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        let statement = numbered_placeholders(sql);
        let bound: Vec<PgParam<'_>> = params.iter().map(PgParam).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = bound.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let rows = self.run(sql, |client| client.query(statement.as_str(), &refs))?;
        rows.iter().map(row_values).collect()
    }

    fn last_insert_id(&self) -> EntityId {
        self.last_insert_id
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn close(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.close() {
                warn!(error = %e, "Closing PostgreSQL connection failed");
            }
        }
    }

    /// PostgreSQL has no last-insert-id; the generated key is returned by
    /// the insert itself.
    fn insert(&mut self, sql: &str, params: &[SqlValue]) -> Result<EntityId> {
        let rows = self.query(&format!("{} RETURNING id", sql), params)?;
        let id = rows
            .first()
            .map(|row| row.i64(0))
            .transpose()?
            .ok_or_else(|| PimError::Integrity(format!("insert returned no id [{}]", sql)))?;
        self.last_insert_id = id;
        Ok(id)
    }
}

impl std::fmt::Debug for PostgresConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConnection")
            .field("open", &self.is_open())
            .field("in_transaction", &self.in_transaction)
            .field("aborted", &self.aborted)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatementKind {
    Begin,
    Commit,
    Rollback,
    Other,
}

impl StatementKind {
    fn of(sql: &str) -> Self {
        let head = sql
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        match head.as_str() {
            "BEGIN" | "START" => StatementKind::Begin,
            "COMMIT" | "END" => StatementKind::Commit,
            "ROLLBACK" | "ABORT" => StatementKind::Rollback,
            _ => StatementKind::Other,
        }
    }
}

fn host_or_default(settings: &DriverSettings) -> &str {
    match settings.host.trim() {
        "" => DEFAULT_HOST,
        host => host,
    }
}

fn database_or_default(settings: &DriverSettings) -> &str {
    match settings.name.trim() {
        "" => DEFAULT_DATABASE,
        name => name,
    }
}

/// Client configuration for a settings group.
///
/// `options` holds `;`-separated `key=value` pairs; `port`,
/// `connect_timeout` (seconds) and `application_name` are understood.
pub fn connection_config(settings: &DriverSettings) -> Result<postgres::Config> {
    let mut config = postgres::Config::new();
    config
        .host(host_or_default(settings))
        .dbname(database_or_default(settings));

    let user = match settings.user.trim() {
        "" => std::env::var("USER").unwrap_or_else(|_| "postgres".to_string()),
        user => user.to_string(),
    };
    config.user(&user);
    if !settings.password.is_empty() {
        config.password(&settings.password);
    }

    for option in settings.options.split(';').map(str::trim).filter(|o| !o.is_empty()) {
        let (key, value) = option.split_once('=').ok_or_else(|| {
            PimError::Config(format!("malformed PostgreSQL option \"{}\"", option))
        })?;
        let (key, value) = (key.trim(), value.trim());
        match key {
            "port" => {
                let port = value.parse::<u16>().map_err(|_| {
                    PimError::Config(format!("invalid PostgreSQL port \"{}\"", value))
                })?;
                config.port(port);
            }
            "connect_timeout" => {
                let secs = value.parse::<u64>().map_err(|_| {
                    PimError::Config(format!("invalid PostgreSQL connect_timeout \"{}\"", value))
                })?;
                config.connect_timeout(std::time::Duration::from_secs(secs));
            }
            "application_name" => {
                config.application_name(value);
            }
            _ => warn!(option = key, "Ignoring unknown PostgreSQL option"),
        }
    }
    Ok(config)
}

/// Rewrite `?` placeholders outside string literals to `$1`, `$2`, ...
pub fn numbered_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 16);
    let mut in_literal = false;
    let mut n = 0;
    for c in sql.chars() {
        match c {
            '\'' => {
                in_literal = !in_literal;
                out.push(c);
            }
            '?' if !in_literal => {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            }
            _ => out.push(c),
        }
    }
    out
}

fn column_type_of(ty: &Type) -> Option<ColumnType> {
    match ty.name() {
        "int2" | "int4" | "int8" | "oid" => Some(ColumnType::Integer),
        "bool" => Some(ColumnType::Bool),
        "text" | "varchar" | "bpchar" | "name" | "unknown" => Some(ColumnType::Text),
        "bytea" => Some(ColumnType::Blob),
        "timestamp" | "timestamptz" => Some(ColumnType::Timestamp),
        _ => None,
    }
}

/// A [`SqlValue`] bound to whatever type the server expects.
#[derive(Debug)]
struct PgParam<'a>(&'a SqlValue);

type BoxError = Box<dyn StdError + Sync + Send>;

impl ToSql for PgParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        let value = match column_type_of(ty) {
            Some(column_type) => self.0.clone().coerce(column_type)?,
            None => self.0.clone(),
        };
        match (value, ty.name()) {
            (SqlValue::Null, _) => Ok(IsNull::Yes),
            (SqlValue::Integer(v), "int2") => i16::try_from(v)?.to_sql(ty, out),
            (SqlValue::Integer(v), "int4") => i32::try_from(v)?.to_sql(ty, out),
            (SqlValue::Integer(v), "oid") => u32::try_from(v)?.to_sql(ty, out),
            (SqlValue::Integer(v), _) => v.to_sql(ty, out),
            (SqlValue::Bool(v), _) => v.to_sql(ty, out),
            (SqlValue::Text(v), _) => v.as_str().to_sql(ty, out),
            (SqlValue::Blob(v), "bytea") => v.as_slice().to_sql(ty, out),
            (SqlValue::Blob(_), name) => {
                Err(format!("bytes that are not UTF-8 cannot be stored as {}", name).into())
            }
            (SqlValue::Timestamp(v), "timestamptz") => v.and_utc().to_sql(ty, out),
            (SqlValue::Timestamp(v), _) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn row_values(row: &Row) -> Result<SqlRow> {
    let mut values = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        values.push(column_value(row, idx, column.type_()).map_err(|e| {
            PimError::Integrity(format!("cannot read column {}: {}", column.name(), e))
        })?);
    }
    Ok(SqlRow::new(values))
}

fn column_value(
    row: &Row,
    idx: usize,
    ty: &Type,
) -> std::result::Result<SqlValue, postgres::Error> {
    let value = match ty.name() {
        "int8" => row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::Integer),
        "int4" => row
            .try_get::<_, Option<i32>>(idx)?
            .map(|v| SqlValue::Integer(v.into())),
        "int2" => row
            .try_get::<_, Option<i16>>(idx)?
            .map(|v| SqlValue::Integer(v.into())),
        "oid" => row
            .try_get::<_, Option<u32>>(idx)?
            .map(|v| SqlValue::Integer(v.into())),
        "bool" => row.try_get::<_, Option<bool>>(idx)?.map(SqlValue::Bool),
        "bytea" => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(SqlValue::Blob),
        "timestamp" => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(SqlValue::Timestamp),
        "timestamptz" => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|v| SqlValue::Timestamp(v.naive_utc())),
        // The schema declares no floating point columns.
        "float4" => row
            .try_get::<_, Option<f32>>(idx)?
            .map(|v| SqlValue::Text(v.to_string())),
        "float8" => row
            .try_get::<_, Option<f64>>(idx)?
            .map(|v| SqlValue::Text(v.to_string())),
        _ => row.try_get::<_, Option<String>>(idx)?.map(SqlValue::Text),
    };
    Ok(value.unwrap_or(SqlValue::Null))
}
