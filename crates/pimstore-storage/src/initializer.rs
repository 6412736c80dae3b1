//! Schema creation.
//!
//! Creates every table of the schema description that does not exist yet
//! and seeds the rows every installation starts with.

use tracing::info;

use pimstore_core::error::Result;

use crate::connection::DbConnection;
use crate::schema::{self, COLLECTIONS, RESOURCES};
use crate::value::SqlValue;

/// Resource owning the search (virtual) collections.
pub const SEARCH_RESOURCE: &str = "pimstore_search_resource";

/// Name of the search resource's top-level collection.
pub const SEARCH_COLLECTION: &str = "Search";

/// Create missing tables and seed initial rows.
pub fn initialize(conn: &mut dyn DbConnection) -> Result<()> {
    let engine = conn.engine();
    for table in schema::schema().all_tables() {
        conn.execute_batch(&table.create_statement(engine))?;
    }
    seed(conn)?;
    Ok(())
}

fn seed(conn: &mut dyn DbConnection) -> Result<()> {
    let existing = conn.query(
        &format!("SELECT id FROM {} WHERE name = ?", RESOURCES),
        &[SEARCH_RESOURCE.into()],
    )?;
    if !existing.is_empty() {
        return Ok(());
    }

    let resource_id = conn.insert(
        &format!("INSERT INTO {} (name, is_virtual) VALUES (?, ?)", RESOURCES),
        &[SEARCH_RESOURCE.into(), true.into()],
    )?;
    conn.insert(
        &format!(
            "INSERT INTO {} (remote_id, remote_revision, name, parent_id, resource_id, enabled, is_virtual, \
             cache_policy_inherit, cache_policy_check_interval, cache_policy_cache_timeout, \
             cache_policy_sync_on_demand, cache_policy_local_parts) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            COLLECTIONS
        ),
        &[
            SqlValue::Null,
            SqlValue::Null,
            SEARCH_COLLECTION.into(),
            SqlValue::Null,
            resource_id.into(),
            true.into(),
            true.into(),
            false.into(),
            (-1i64).into(),
            (-1i64).into(),
            false.into(),
            "ALL".into(),
        ],
    )?;
    info!(resource_id, "Seeded search resource and collection");
    Ok(())
}
