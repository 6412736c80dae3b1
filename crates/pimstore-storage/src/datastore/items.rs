//! Item creation and removal.

use std::collections::BTreeSet;

use chrono::NaiveDateTime;
use tracing::{debug, warn};

use pimstore_core::error::{PimError, Result};
use pimstore_core::events::{ChangeNotification, CollectionScope};
use pimstore_core::types::{EntityId, Part, PimItem, PAYLOAD_NAMESPACE};

use super::entities::{now, opt_text, part_from_row, PART_COLUMNS};
use super::{placeholders, DataStore};
use crate::parts::{PartColumn, PartHelper};
use crate::schema::{PARTS, PART_TYPES, PIM_ITEMS};
use crate::value::SqlValue;

/// Attribute part marking an item as hidden.
pub const HIDDEN_ATTRIBUTE: &str = "ATR:HIDDEN";

/// Everything needed to append an item.
#[derive(Debug, Clone, Default)]
pub struct NewPimItem {
    pub collection_id: EntityId,
    pub mime_type: String,
    pub remote_id: String,
    pub remote_revision: String,
    pub gid: String,
    /// Defaults to the time of insertion.
    pub datetime: Option<NaiveDateTime>,
    pub flags: Vec<String>,
    /// Fully qualified part type name and payload.
    pub parts: Vec<(String, Vec<u8>)>,
}

impl NewPimItem {
    pub fn new(collection_id: EntityId, mime_type: &str) -> Self {
        Self {
            collection_id,
            mime_type: mime_type.to_string(),
            ..Default::default()
        }
    }

    pub fn remote_id(mut self, remote_id: impl Into<String>) -> Self {
        self.remote_id = remote_id.into();
        self
    }

    pub fn remote_revision(mut self, remote_revision: impl Into<String>) -> Self {
        self.remote_revision = remote_revision.into();
        self
    }

    pub fn gid(mut self, gid: impl Into<String>) -> Self {
        self.gid = gid.into();
        self
    }

    pub fn datetime(mut self, datetime: NaiveDateTime) -> Self {
        self.datetime = Some(datetime);
        self
    }

    pub fn flag(mut self, name: impl Into<String>) -> Self {
        self.flags.push(name.into());
        self
    }

    pub fn part(mut self, fq_name: impl Into<String>, data: Vec<u8>) -> Self {
        self.parts.push((fq_name.into(), data));
        self
    }
}

impl DataStore {
    /// Insert an item with its parts and flags.
    ///
    /// An item without remote id comes from an application and starts out
    /// dirty until its resource confirms it.
    pub fn append_pim_item(&mut self, new: NewPimItem) -> Result<PimItem> {
        let mut tx = self.transaction("append item")?;

        if tx.collection(new.collection_id)?.is_none() {
            return Err(PimError::NotFound(format!(
                "collection {}",
                new.collection_id
            )));
        }
        let mime_type = tx.mime_type_by_name_or_create(&new.mime_type)?;
        let timestamp = now();

        let mut item = PimItem {
            id: 0,
            rev: 0,
            remote_id: new.remote_id,
            remote_revision: new.remote_revision,
            gid: new.gid,
            collection_id: new.collection_id,
            mime_type_id: mime_type.id,
            datetime: new.datetime.unwrap_or(timestamp),
            atime: timestamp,
            dirty: false,
            size: 0,
            hidden: false,
        };
        item.dirty = item.remote_id.is_empty();

        item.id = tx.insert(
            &format!(
                "INSERT INTO {} (rev, remote_id, remote_revision, gid, collection_id, mime_type_id, \
                 datetime, atime, dirty, size, hidden) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                PIM_ITEMS
            ),
            &[
                item.rev.into(),
                opt_text(&item.remote_id),
                opt_text(&item.remote_revision),
                opt_text(&item.gid),
                item.collection_id.into(),
                item.mime_type_id.into(),
                item.datetime.into(),
                item.atime.into(),
                item.dirty.into(),
                item.size.into(),
                item.hidden.into(),
            ],
        )?;

        for (fq_name, data) in new.parts {
            let part_type = tx.part_type_by_fq_name_or_create(&fq_name)?;
            let mut part = Part::new(item.id, part_type.id, data);
            PartHelper::insert(&mut tx, &mut part)?;
            item.size += part.datasize;
        }
        if item.size > 0 {
            tx.update_pim_item(&item)?;
        }

        if !new.flags.is_empty() {
            let flags = tx.flags_by_names(&new.flags)?;
            tx.append_items_flags(std::slice::from_ref(&item), &flags, false, true)?;
        }

        tx.cache_mut().invalidate_statistics(item.collection_id);
        tx.notify(ChangeNotification::ItemAdded {
            item_id: item.id,
            collection_id: item.collection_id,
        });
        tx.commit()?;

        debug!(item = item.id, collection = item.collection_id, size = item.size, "Item appended");
        Ok(item)
    }

    /// Delete items together with their parts and payload files.
    pub fn cleanup_pim_items(&mut self, items: &[PimItem], silent: bool) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut tx = self.transaction("cleanup items")?;
        if !silent {
            tx.notify(ChangeNotification::ItemsRemoved {
                item_ids: items.iter().map(|i| i.id).collect(),
                scope: CollectionScope::from_items(items.iter().map(|i| i.collection_id)),
            });
        }

        for item in items {
            PartHelper::remove_by(&mut tx, PartColumn::PimItemId, item.id)?;
        }
        let params: Vec<SqlValue> = items.iter().map(|i| i.id.into()).collect();
        tx.execute(
            &format!(
                "DELETE FROM {} WHERE id IN ({})",
                PIM_ITEMS,
                placeholders(items.len())
            ),
            &params,
        )?;
        let collections: BTreeSet<EntityId> = items.iter().map(|i| i.collection_id).collect();
        for collection in collections {
            tx.cache_mut().invalidate_statistics(collection);
        }
        tx.commit()?;

        debug!(count = items.len(), "Items removed");
        Ok(())
    }

    /// Remove the named parts of an item.
    pub fn remove_item_parts<S: AsRef<str>>(&mut self, item: &PimItem, part_names: &[S]) -> Result<()> {
        let mut tx = self.transaction("remove item parts")?;
        let mut removed = BTreeSet::new();
        for name in part_names {
            let part_type = tx.part_type_by_fq_name_or_create(name.as_ref())?;
            if let Some(part) = tx.part_by_type(item.id, part_type.id)? {
                PartHelper::remove(&mut tx, &part)?;
                removed.insert(part_type.fq_name());
            }
        }
        if !removed.is_empty() {
            tx.notify(ChangeNotification::ItemChanged {
                item_id: item.id,
                collection_id: item.collection_id,
                parts: removed,
            });
        }
        tx.commit()
    }

    /// Drop the cached payload of an item the resource can deliver again.
    ///
    /// Dirty items are left alone: their payload exists nowhere else.
    /// Returns the number of truncated parts.
    pub fn invalidate_item_cache(&mut self, item: &PimItem) -> Result<usize> {
        let rows = self.query(
            &format!(
                "SELECT {} FROM {} p JOIN {} i ON i.id = p.pim_item_id \
                 JOIN {} t ON t.id = p.part_type_id \
                 WHERE p.pim_item_id = ? AND p.data IS NOT NULL AND t.ns = ? AND i.dirty = ?",
                PART_COLUMNS
                    .split(", ")
                    .map(|c| format!("p.{}", c))
                    .collect::<Vec<_>>()
                    .join(", "),
                PARTS,
                PIM_ITEMS,
                PART_TYPES
            ),
            &[item.id.into(), PAYLOAD_NAMESPACE.into(), false.into()],
        )?;
        let mut parts = rows.iter().map(part_from_row).collect::<Result<Vec<_>>>()?;
        if parts.is_empty() {
            return Ok(0);
        }

        let mut tx = self.transaction("invalidate item cache")?;
        for part in parts.iter_mut() {
            if let Err(e) = PartHelper::truncate(&mut tx, part) {
                warn!(item = item.id, part = part.id, error = %e, "Failed to truncate payload part");
                return Err(e);
            }
        }
        tx.commit()?;
        Ok(parts.len())
    }

    pub fn unhide_pim_item(&mut self, item: &mut PimItem) -> Result<()> {
        debug!(item = item.id, "Unhiding item");
        let mut tx = self.transaction("unhide item")?;
        tx.remove_item_parts(item, &[HIDDEN_ATTRIBUTE])?;
        if item.hidden {
            item.hidden = false;
            tx.update_pim_item(item)?;
        }
        tx.commit()
    }

    /// Returns the number of items that were hidden.
    pub fn unhide_all_pim_items(&mut self) -> Result<usize> {
        debug!("Unhiding all items");
        let mut tx = self.transaction("unhide all items")?;
        let part_type = tx.part_type_by_fq_name_or_create(HIDDEN_ATTRIBUTE)?;
        PartHelper::remove_by(&mut tx, PartColumn::PartTypeId, part_type.id)?;
        let count = tx.execute(
            &format!("UPDATE {} SET hidden = ? WHERE hidden = ?", PIM_ITEMS),
            &[false.into(), true.into()],
        )?;
        tx.commit()?;
        Ok(count)
    }

    /// Hide an item from clients until its resource confirms it.
    pub fn hide_pim_item(&mut self, item: &mut PimItem) -> Result<()> {
        item.hidden = true;
        self.update_pim_item(item)
    }
}
