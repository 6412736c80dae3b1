//! Engine specific SQL.
//!
//! Statements that differ between SQLite, MySQL and PostgreSQL are produced
//! here so the rest of the storage layer can stay engine agnostic. Statements
//! use `?` placeholders; connection implementations for engines with a
//! different placeholder syntax translate them.

use pimstore_core::config::DbEngine;

use crate::value::ColumnType;

pub trait SqlDialect {
    /// Statement opening a physical transaction.
    fn begin_statement(&self) -> &'static str;

    /// Issued right after a physical begin, if the engine needs it.
    fn defer_constraints_statement(&self) -> Option<&'static str>;

    fn commit_statement(&self) -> &'static str {
        "COMMIT"
    }

    fn rollback_statement(&self) -> &'static str {
        "ROLLBACK"
    }

    /// SQL type used for a declared column type.
    fn column_type(&self, ty: ColumnType) -> &'static str;

    /// Column definition of an autoincrementing integer primary key.
    fn auto_increment_primary_key(&self, column: &str) -> String;

    /// Query returning the next id the table would hand out. An empty result
    /// means the table never had a row.
    fn next_auto_increment_query(&self, table: &str, column: &str) -> String;

    /// Statements making `next_value` the next id handed out.
    fn set_auto_increment_statements(&self, table: &str, column: &str, next_value: i64)
        -> Vec<String>;

    fn analyze_statement(&self, table: &str) -> String;

    fn disable_constraint_checks_statement(&self) -> &'static str;

    fn enable_constraint_checks_statement(&self) -> &'static str;
}

impl SqlDialect for DbEngine {
    fn begin_statement(&self) -> &'static str {
        match self {
            DbEngine::Sqlite => "BEGIN IMMEDIATE TRANSACTION",
            DbEngine::Mysql => "START TRANSACTION",
            DbEngine::Postgres => "BEGIN",
        }
    }

    fn defer_constraints_statement(&self) -> Option<&'static str> {
        match self {
            DbEngine::Postgres => Some("SET CONSTRAINTS ALL DEFERRED"),
            DbEngine::Sqlite | DbEngine::Mysql => None,
        }
    }

    fn column_type(&self, ty: ColumnType) -> &'static str {
        match (self, ty) {
            (_, ColumnType::Integer) => "BIGINT",
            (DbEngine::Mysql, ColumnType::Bool) => "TINYINT(1)",
            (_, ColumnType::Bool) => "BOOLEAN",
            (DbEngine::Mysql, ColumnType::Text) => "VARBINARY(1024)",
            (_, ColumnType::Text) => "TEXT",
            (DbEngine::Sqlite, ColumnType::Blob) => "BLOB",
            (DbEngine::Mysql, ColumnType::Blob) => "LONGBLOB",
            (DbEngine::Postgres, ColumnType::Blob) => "BYTEA",
            (DbEngine::Mysql, ColumnType::Timestamp) => "DATETIME",
            (_, ColumnType::Timestamp) => "TIMESTAMP",
        }
    }

    fn auto_increment_primary_key(&self, column: &str) -> String {
        match self {
            DbEngine::Sqlite => format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", column),
            DbEngine::Mysql => format!("{} BIGINT PRIMARY KEY AUTO_INCREMENT", column),
            DbEngine::Postgres => format!("{} BIGSERIAL PRIMARY KEY", column),
        }
    }

    fn next_auto_increment_query(&self, table: &str, column: &str) -> String {
        match self {
            DbEngine::Sqlite => format!(
                "SELECT seq + 1 FROM sqlite_sequence WHERE name = '{}'",
                table
            ),
            DbEngine::Mysql => format!(
                "SELECT AUTO_INCREMENT FROM information_schema.TABLES \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = '{}'",
                table
            ),
            DbEngine::Postgres => format!(
                "SELECT CASE WHEN is_called THEN last_value + 1 ELSE last_value END FROM {}_{}_seq",
                table, column
            ),
        }
    }

    fn set_auto_increment_statements(
        &self,
        table: &str,
        column: &str,
        next_value: i64,
    ) -> Vec<String> {
        match self {
            // sqlite_sequence has no unique constraint on name.
            DbEngine::Sqlite => vec![
                format!("DELETE FROM sqlite_sequence WHERE name = '{}'", table),
                format!(
                    "INSERT INTO sqlite_sequence (name, seq) VALUES ('{}', {})",
                    table,
                    next_value - 1
                ),
            ],
            DbEngine::Mysql => vec![format!(
                "ALTER TABLE {} AUTO_INCREMENT = {}",
                table, next_value
            )],
            DbEngine::Postgres => vec![format!(
                "SELECT setval('{}_{}_seq', {}, false)",
                table, column, next_value
            )],
        }
    }

    fn analyze_statement(&self, table: &str) -> String {
        match self {
            DbEngine::Sqlite | DbEngine::Postgres => format!("ANALYZE {}", table),
            DbEngine::Mysql => format!("ANALYZE TABLE {}", table),
        }
    }

    fn disable_constraint_checks_statement(&self) -> &'static str {
        match self {
            DbEngine::Sqlite => "PRAGMA foreign_keys = OFF",
            DbEngine::Mysql => "SET FOREIGN_KEY_CHECKS = 0",
            DbEngine::Postgres => "SET session_replication_role = replica",
        }
    }

    fn enable_constraint_checks_statement(&self) -> &'static str {
        match self {
            DbEngine::Sqlite => "PRAGMA foreign_keys = ON",
            DbEngine::Mysql => "SET FOREIGN_KEY_CHECKS = 1",
            DbEngine::Postgres => "SET session_replication_role = DEFAULT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_statements() {
        assert_eq!(
            DbEngine::Sqlite.begin_statement(),
            "BEGIN IMMEDIATE TRANSACTION"
        );
        assert_eq!(DbEngine::Sqlite.defer_constraints_statement(), None);
        assert_eq!(
            DbEngine::Postgres.defer_constraints_statement(),
            Some("SET CONSTRAINTS ALL DEFERRED")
        );
    }

    #[test]
    fn test_analyze_statements() {
        assert_eq!(DbEngine::Sqlite.analyze_statement("parts"), "ANALYZE parts");
        assert_eq!(
            DbEngine::Postgres.analyze_statement("parts"),
            "ANALYZE parts"
        );
        assert_eq!(
            DbEngine::Mysql.analyze_statement("parts"),
            "ANALYZE TABLE parts"
        );
    }

    #[test]
    fn test_sqlite_auto_increment_statements() {
        let stmts = DbEngine::Sqlite.set_auto_increment_statements("flags", "id", 42);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[1].contains("'flags', 41"));
        assert_eq!(
            DbEngine::Postgres.set_auto_increment_statements("flags", "id", 42),
            vec!["SELECT setval('flags_id_seq', 42, false)".to_string()]
        );
    }
}
