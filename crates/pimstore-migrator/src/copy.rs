//! Row copying between two stores of possibly different engines.

use tracing::{debug, info};

use pimstore_core::error::{PimError, Result};
use pimstore_storage::schema::{self, TableDescription};
use pimstore_storage::{DataStore, SqlDialect, SqlValue};

use crate::dbconfig::DbConfig;
use crate::events::Reporter;

/// Rows inserted per destination transaction.
pub const MAX_TRANSACTION_SIZE: usize = 1000;

/// Copy every table of the schema, regular tables first, then relations.
/// Constraint checks are off on the destination while rows go in, so the
/// order of rows within a table does not matter. Stops at the first table
/// that fails.
pub fn migrate_tables(
    source: &mut DataStore,
    dest: &mut DataStore,
    dest_config: &dyn DbConfig,
    batch_size: usize,
    reporter: &Reporter,
) -> Result<()> {
    let tables = schema::schema().all_tables();
    let total = tables.len();

    dest_config.disable_constraint_checks(dest.connection())?;
    for (idx, table) in tables.iter().enumerate() {
        reporter.progress(table.name, idx + 1, total);
        if let Err(e) = copy_table(source, dest, table, batch_size, reporter) {
            reporter.error(format!(
                "Error has occurred while migrating table {}",
                table.name
            ));
            let _ = dest_config.enable_constraint_checks(dest.connection());
            return Err(e);
        }
    }
    dest_config.enable_constraint_checks(dest.connection())?;
    Ok(())
}

/// Replace the contents of `table` in `dest` with the rows of `source`.
///
/// Rows are inserted in transactions of at most `batch_size` rows. A batch
/// that fails is rolled back and the copy stops; batches committed before
/// stay in the destination. Returns the number of rows copied.
pub fn copy_table(
    source: &mut DataStore,
    dest: &mut DataStore,
    table: &TableDescription,
    batch_size: usize,
    reporter: &Reporter,
) -> Result<usize> {
    let batch_size = batch_size.max(1);
    let columns = table.column_names().join(", ");

    let total = source
        .query(&format!("SELECT COUNT(*) FROM {}", table.name), &[])?
        .first()
        .map(|row| row.i64(0))
        .transpose()?
        .unwrap_or(0)
        .max(0) as usize;
    let rows = source.query(&format!("SELECT {} FROM {}", columns, table.name), &[])?;

    // Drop rows the destination seeded when its schema was created.
    dest.execute(&format!("DELETE FROM {}", table.name), &[])?;

    let insert = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table.name,
        columns,
        vec!["?"; table.columns.len()].join(", ")
    );

    let mut copied = 0;
    let mut rows = rows.into_iter().peekable();
    // A batch transaction is only opened when there is a row to put in it.
    while rows.peek().is_some() {
        let mut tx = dest.transaction("Migrator")?;
        for row in rows.by_ref().take(batch_size) {
            let values = row
                .into_values()
                .into_iter()
                .zip(&table.columns)
                .map(|(value, column)| value.coerce(column.column_type))
                .collect::<Result<Vec<SqlValue>>>()?;
            tx.execute(&insert, &values)?;
            copied += 1;
        }
        tx.commit()?;
        reporter.table_progress(table.name, copied, total);
    }
    debug!(table = table.name, rows = copied, "Table copied");

    if let Some(column) = table.auto_increment_column() {
        sync_auto_increment(source, dest, table.name, column.name).map_err(|e| {
            let message = format!(
                "Error: failed to update autoincrement value for table {}",
                table.name
            );
            reporter.error(message.clone());
            PimError::Integrity(format!("{}: {}", message, e))
        })?;
    }

    reporter.info(format!("Optimizing table {}...", table.name));
    let analyze = dest.engine().analyze_statement(table.name);
    dest.execute_batch(&analyze).map_err(|e| {
        let message = format!("Error: failed to optimize table {}", table.name);
        reporter.error(message.clone());
        PimError::Integrity(format!("{}: {}", message, e))
    })?;

    Ok(copied)
}

/// Make the destination hand out the same next id as the source. A source
/// sequence that never handed out an id counts as 1.
fn sync_auto_increment(
    source: &mut DataStore,
    dest: &mut DataStore,
    table: &str,
    column: &str,
) -> Result<()> {
    let query = source.engine().next_auto_increment_query(table, column);
    let next = match source.query(&query, &[])?.first() {
        Some(row) => row.opt_i64(0)?.unwrap_or(1),
        None => 1,
    };

    for statement in dest.engine().set_auto_increment_statements(table, column, next) {
        dest.execute_batch(&statement)?;
    }
    info!(table, next, "Autoincrement value synchronized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use pimstore_storage::schema::FLAGS;
    use pimstore_storage::{
        DbConnection, InstrumentedConnection, SqliteConnection, StatementLog, StoreSettings,
    };

    fn settings(dir: &Path) -> StoreSettings {
        StoreSettings::new(dir.join("file_db_data"), 4096)
    }

    fn source_with_flags(dir: &Path, n: usize) -> DataStore {
        let mut store = DataStore::open_sqlite(&dir.join("source.db"), settings(dir)).unwrap();
        store.init().unwrap();
        let mut tx = store.transaction("fill").unwrap();
        for i in 0..n {
            tx.execute(
                "INSERT INTO flags (name) VALUES (?)",
                &[format!("flag{}", i).into()],
            )
            .unwrap();
        }
        tx.commit().unwrap();
        store
    }

    fn recorded_dest(
        dir: &Path,
        fail_when: Option<Box<dyn Fn(&str) -> bool + Send>>,
    ) -> (DataStore, StatementLog) {
        let mut conn = InstrumentedConnection::new(Box::new(
            SqliteConnection::open(&dir.join("dest.db")).unwrap(),
        ));
        if let Some(predicate) = fail_when {
            conn = conn.fail_when(predicate);
        }
        let log = conn.log();
        let mut store = DataStore::new(Box::new(conn), settings(dir)).unwrap();
        store.init().unwrap();
        log.lock().unwrap().clear();
        (store, log)
    }

    fn count_rows(store: &mut DataStore, table: &str) -> i64 {
        store
            .query(&format!("SELECT COUNT(*) FROM {}", table), &[])
            .unwrap()[0]
            .i64(0)
            .unwrap()
    }

    fn next_id(store: &mut DataStore, table: &str) -> i64 {
        let query = store.engine().next_auto_increment_query(table, "id");
        store
            .query(&query, &[])
            .unwrap()
            .first()
            .map(|r| r.i64(0).unwrap())
            .unwrap_or(1)
    }

    fn commits(log: &StatementLog) -> usize {
        log.lock().unwrap().iter().filter(|s| s.as_str() == "COMMIT").count()
    }

    #[test]
    fn test_rows_are_copied_in_batches() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = source_with_flags(dir.path(), 2510);
        source.execute("DELETE FROM flags WHERE id > 2500", &[]).unwrap();
        let (mut dest, log) = recorded_dest(dir.path(), None);
        let (reporter, mut rx) = Reporter::channel();

        let table = schema::schema().table(FLAGS).unwrap();
        let copied = copy_table(&mut source, &mut dest, table, MAX_TRANSACTION_SIZE, &reporter).unwrap();

        assert_eq!(copied, 2500);
        assert_eq!(commits(&log), 3);
        assert_eq!(count_rows(&mut dest, FLAGS), count_rows(&mut source, FLAGS));
        assert!(next_id(&mut dest, FLAGS) >= next_id(&mut source, FLAGS));
        assert_eq!(next_id(&mut dest, FLAGS), 2511);

        let mut progress = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let crate::MigrationEvent::TableProgress { done, total, .. } = event {
                progress.push((done, total));
            }
        }
        assert_eq!(progress, vec![(1000, 2500), (2000, 2500), (2500, 2500)]);
    }

    #[test]
    fn test_exactly_full_batches() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = source_with_flags(dir.path(), 2000);
        let (mut dest, log) = recorded_dest(dir.path(), None);
        let (reporter, _rx) = Reporter::channel();

        let table = schema::schema().table(FLAGS).unwrap();
        copy_table(&mut source, &mut dest, table, MAX_TRANSACTION_SIZE, &reporter).unwrap();
        assert_eq!(commits(&log), 2);
    }

    #[test]
    fn test_empty_table_replaces_seeded_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = source_with_flags(dir.path(), 0);
        source.execute("DELETE FROM collections", &[]).unwrap();
        let (mut dest, log) = recorded_dest(dir.path(), None);
        assert!(count_rows(&mut dest, "collections") > 0);

        let (reporter, _rx) = Reporter::channel();
        let table = schema::schema().table("collections").unwrap();
        let copied = copy_table(&mut source, &mut dest, table, MAX_TRANSACTION_SIZE, &reporter).unwrap();

        assert_eq!(copied, 0);
        assert_eq!(commits(&log), 0);
        assert_eq!(count_rows(&mut dest, "collections"), 0);
    }

    #[test]
    fn test_failed_batch_keeps_earlier_batches() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = source_with_flags(dir.path(), 2500);
        let inserts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&inserts);
        let (mut dest, log) = recorded_dest(
            dir.path(),
            Some(Box::new(move |sql: &str| {
                sql.starts_with("INSERT INTO flags")
                    && counter.fetch_add(1, Ordering::SeqCst) + 1 == 1500
            })),
        );
        let (reporter, _rx) = Reporter::channel();

        let table = schema::schema().table(FLAGS).unwrap();
        let result = copy_table(&mut source, &mut dest, table, MAX_TRANSACTION_SIZE, &reporter);

        assert!(result.is_err());
        assert_eq!(commits(&log), 1);
        assert!(!dest.in_transaction());
        assert_eq!(count_rows(&mut dest, FLAGS), 1000);
    }

    #[test]
    fn test_values_are_coerced_to_column_types() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = source_with_flags(dir.path(), 0);
        // A boolean stored as text by a foreign writer.
        source
            .execute(
                "UPDATE collections SET enabled = 'true' WHERE id = (SELECT MIN(id) FROM collections)",
                &[],
            )
            .unwrap();
        let (mut dest, _log) = recorded_dest(dir.path(), None);
        let (reporter, _rx) = Reporter::channel();

        dest.connection().execute_batch("PRAGMA foreign_keys = OFF").unwrap();
        let table = schema::schema().table("collections").unwrap();
        copy_table(&mut source, &mut dest, table, MAX_TRANSACTION_SIZE, &reporter).unwrap();

        let rows = dest
            .query("SELECT enabled FROM collections ORDER BY id LIMIT 1", &[])
            .unwrap();
        assert!(rows[0].bool(0).unwrap());
    }

    #[test]
    fn test_non_utf8_text_is_copied_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = source_with_flags(dir.path(), 0);
        source
            .execute(
                "UPDATE collections SET remote_id = CAST(X'696D61703AFFFE2F' AS TEXT) \
                 WHERE id = (SELECT MIN(id) FROM collections)",
                &[],
            )
            .unwrap();
        let (mut dest, _log) = recorded_dest(dir.path(), None);
        let (reporter, _rx) = Reporter::channel();

        dest.connection().execute_batch("PRAGMA foreign_keys = OFF").unwrap();
        let table = schema::schema().table("collections").unwrap();
        copy_table(&mut source, &mut dest, table, MAX_TRANSACTION_SIZE, &reporter).unwrap();

        let hex = "SELECT hex(remote_id) FROM collections ORDER BY id LIMIT 1";
        let expected = source.query(hex, &[]).unwrap()[0].string(0).unwrap();
        assert_eq!(expected, "696D61703AFFFE2F");
        assert_eq!(dest.query(hex, &[]).unwrap()[0].string(0).unwrap(), expected);
    }
}
