//! Row mapping and lookups of individual entities.

use chrono::{NaiveDateTime, SubsecRound, Utc};
use tracing::debug;

use pimstore_core::error::Result;
use pimstore_core::types::{
    CachePolicy, Collection, CollectionStatistics, EntityId, Flag, MimeType, Part, PartStorage,
    PartType, PimItem, Resource, Tag,
};

use super::{placeholders, DataStore};
use crate::schema::{
    COLLECTIONS, FLAGS, MIME_TYPES, PARTS, PART_TYPES, PIM_ITEMS, RESOURCES, TAGS, TAG_TYPES,
};
use crate::value::{SqlRow, SqlValue};

pub(crate) const ITEM_COLUMNS: &str = "id, rev, remote_id, remote_revision, gid, collection_id, \
     mime_type_id, datetime, atime, dirty, size, hidden";

pub(crate) const PART_COLUMNS: &str =
    "id, pim_item_id, part_type_id, data, datasize, version, storage";

pub(crate) const COLLECTION_COLUMNS: &str = "id, remote_id, remote_revision, name, parent_id, \
     resource_id, enabled, is_virtual, cache_policy_inherit, cache_policy_check_interval, \
     cache_policy_cache_timeout, cache_policy_sync_on_demand, cache_policy_local_parts";

/// Current time at the precision the database keeps.
pub(crate) fn now() -> NaiveDateTime {
    Utc::now().naive_utc().trunc_subsecs(0)
}

pub(crate) fn item_from_row(row: &SqlRow) -> Result<PimItem> {
    Ok(PimItem {
        id: row.i64(0)?,
        rev: row.i64(1)?,
        remote_id: row.string(2)?,
        remote_revision: row.string(3)?,
        gid: row.string(4)?,
        collection_id: row.i64(5)?,
        mime_type_id: row.i64(6)?,
        datetime: row.timestamp(7)?,
        atime: row.timestamp(8)?,
        dirty: row.bool(9)?,
        size: row.i64(10)?,
        hidden: row.bool(11)?,
    })
}

pub(crate) fn part_from_row(row: &SqlRow) -> Result<Part> {
    Ok(Part {
        id: row.i64(0)?,
        pim_item_id: row.i64(1)?,
        part_type_id: row.i64(2)?,
        data: row.bytes(3)?,
        datasize: row.i64(4)?,
        version: row.i64(5)? as i32,
        storage: PartStorage::from_i64(row.i64(6)?)?,
    })
}

pub(crate) fn collection_from_row(row: &SqlRow) -> Result<Collection> {
    Ok(Collection {
        id: row.i64(0)?,
        remote_id: row.string(1)?,
        remote_revision: row.string(2)?,
        name: row.string(3)?,
        parent_id: row.opt_i64(4)?,
        resource_id: row.i64(5)?,
        enabled: row.bool(6)?,
        is_virtual: row.bool(7)?,
        cache_policy: CachePolicy {
            inherit: row.bool(8)?,
            check_interval: row.i64(9)?,
            cache_timeout: row.i64(10)?,
            sync_on_demand: row.bool(11)?,
            local_parts: row.string(12)?,
        },
    })
}

/// Empty strings are stored as NULL.
pub(crate) fn opt_text(value: &str) -> SqlValue {
    if value.is_empty() {
        SqlValue::Null
    } else {
        SqlValue::Text(value.to_string())
    }
}

impl DataStore {
    // =========================================================================
    // Items
    // =========================================================================

    pub fn pim_item(&mut self, id: EntityId) -> Result<Option<PimItem>> {
        let rows = self.query(
            &format!("SELECT {} FROM {} WHERE id = ?", ITEM_COLUMNS, PIM_ITEMS),
            &[id.into()],
        )?;
        rows.first().map(item_from_row).transpose()
    }

    pub fn pim_items(&mut self, ids: &[EntityId]) -> Result<Vec<PimItem>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let params: Vec<SqlValue> = ids.iter().map(|id| (*id).into()).collect();
        let rows = self.query(
            &format!(
                "SELECT {} FROM {} WHERE id IN ({}) ORDER BY id",
                ITEM_COLUMNS,
                PIM_ITEMS,
                placeholders(ids.len())
            ),
            &params,
        )?;
        rows.iter().map(item_from_row).collect()
    }

    pub fn items_in_collection(&mut self, collection_id: EntityId) -> Result<Vec<PimItem>> {
        let rows = self.query(
            &format!(
                "SELECT {} FROM {} WHERE collection_id = ? ORDER BY id",
                ITEM_COLUMNS, PIM_ITEMS
            ),
            &[collection_id.into()],
        )?;
        rows.iter().map(item_from_row).collect()
    }

    pub(crate) fn update_pim_item(&mut self, item: &PimItem) -> Result<()> {
        self.execute(
            &format!(
                "UPDATE {} SET rev = ?, remote_id = ?, remote_revision = ?, gid = ?, \
                 collection_id = ?, mime_type_id = ?, datetime = ?, atime = ?, dirty = ?, \
                 size = ?, hidden = ? WHERE id = ?",
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
                item.id.into(),
            ],
        )?;
        self.cache_mut().invalidate_statistics(item.collection_id);
        Ok(())
    }

    // =========================================================================
    // Parts
    // =========================================================================

    pub fn part(&mut self, id: EntityId) -> Result<Option<Part>> {
        let rows = self.query(
            &format!("SELECT {} FROM {} WHERE id = ?", PART_COLUMNS, PARTS),
            &[id.into()],
        )?;
        rows.first().map(part_from_row).transpose()
    }

    pub fn parts_of_item(&mut self, item_id: EntityId) -> Result<Vec<Part>> {
        let rows = self.query(
            &format!(
                "SELECT {} FROM {} WHERE pim_item_id = ? ORDER BY id",
                PART_COLUMNS, PARTS
            ),
            &[item_id.into()],
        )?;
        rows.iter().map(part_from_row).collect()
    }

    /// Parts whose payload lives in a file, managed or foreign.
    pub fn file_backed_parts(&mut self) -> Result<Vec<Part>> {
        let rows = self.query(
            &format!(
                "SELECT {} FROM {} WHERE storage <> ? ORDER BY id",
                PART_COLUMNS, PARTS
            ),
            &[PartStorage::Internal.as_i64().into()],
        )?;
        rows.iter().map(part_from_row).collect()
    }

    pub fn part_by_type(
        &mut self,
        item_id: EntityId,
        part_type_id: EntityId,
    ) -> Result<Option<Part>> {
        let rows = self.query(
            &format!(
                "SELECT {} FROM {} WHERE pim_item_id = ? AND part_type_id = ?",
                PART_COLUMNS, PARTS
            ),
            &[item_id.into(), part_type_id.into()],
        )?;
        rows.first().map(part_from_row).transpose()
    }

    // =========================================================================
    // Collections
    // =========================================================================

    pub fn collection(&mut self, id: EntityId) -> Result<Option<Collection>> {
        if let Some(c) = self.cache().collection(id) {
            return Ok(Some(c.clone()));
        }
        let rows = self.query(
            &format!(
                "SELECT {} FROM {} WHERE id = ?",
                COLLECTION_COLUMNS, COLLECTIONS
            ),
            &[id.into()],
        )?;
        let collection = rows.first().map(collection_from_row).transpose()?;
        if let Some(c) = &collection {
            self.cache_mut().insert_collection(c.clone());
        }
        Ok(collection)
    }

    pub fn child_collections(&mut self, parent_id: EntityId) -> Result<Vec<Collection>> {
        let rows = self.query(
            &format!(
                "SELECT {} FROM {} WHERE parent_id = ? ORDER BY id",
                COLLECTION_COLUMNS, COLLECTIONS
            ),
            &[parent_id.into()],
        )?;
        rows.iter().map(collection_from_row).collect()
    }

    pub(crate) fn update_collection(&mut self, c: &Collection) -> Result<()> {
        self.execute(
            &format!(
                "UPDATE {} SET remote_id = ?, remote_revision = ?, name = ?, parent_id = ?, \
                 resource_id = ?, enabled = ?, is_virtual = ?, cache_policy_inherit = ?, \
                 cache_policy_check_interval = ?, cache_policy_cache_timeout = ?, \
                 cache_policy_sync_on_demand = ?, cache_policy_local_parts = ? WHERE id = ?",
                COLLECTIONS
            ),
            &[
                opt_text(&c.remote_id),
                opt_text(&c.remote_revision),
                c.name.as_str().into(),
                c.parent_id.into(),
                c.resource_id.into(),
                c.enabled.into(),
                c.is_virtual.into(),
                c.cache_policy.inherit.into(),
                c.cache_policy.check_interval.into(),
                c.cache_policy.cache_timeout.into(),
                c.cache_policy.sync_on_demand.into(),
                c.cache_policy.local_parts.as_str().into(),
                c.id.into(),
            ],
        )?;
        self.cache_mut().invalidate_collection(c.id);
        Ok(())
    }

    /// Item count and payload size of a collection.
    pub fn collection_statistics(&mut self, collection_id: EntityId) -> Result<CollectionStatistics> {
        if let Some(stats) = self.cache().statistics(collection_id) {
            return Ok(stats);
        }
        let rows = self.query(
            &format!(
                "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM {} WHERE collection_id = ?",
                PIM_ITEMS
            ),
            &[collection_id.into()],
        )?;
        let stats = match rows.first() {
            Some(row) => CollectionStatistics {
                count: row.i64(0)?,
                size: row.i64(1)?,
            },
            None => CollectionStatistics::default(),
        };
        self.cache_mut().insert_statistics(collection_id, stats);
        Ok(stats)
    }

    // =========================================================================
    // Lookup entities
    // =========================================================================

    pub fn flag_by_name(&mut self, name: &str) -> Result<Option<Flag>> {
        if let Some(flag) = self.cache().flag(name) {
            return Ok(Some(flag.clone()));
        }
        let rows = self.query(
            &format!("SELECT id, name FROM {} WHERE name = ?", FLAGS),
            &[name.into()],
        )?;
        let flag = match rows.first() {
            Some(row) => Flag {
                id: row.i64(0)?,
                name: row.string(1)?,
            },
            None => return Ok(None),
        };
        self.cache_mut().insert_flag(flag.clone());
        Ok(Some(flag))
    }

    pub fn flag_by_name_or_create(&mut self, name: &str) -> Result<Flag> {
        if let Some(flag) = self.flag_by_name(name)? {
            return Ok(flag);
        }
        let id = self.insert(
            &format!("INSERT INTO {} (name) VALUES (?)", FLAGS),
            &[name.into()],
        )?;
        debug!(id, name, "Flag created");
        let flag = Flag {
            id,
            name: name.to_string(),
        };
        self.cache_mut().insert_flag(flag.clone());
        Ok(flag)
    }

    /// Look up (creating where needed) every flag name.
    pub fn flags_by_names<S: AsRef<str>>(&mut self, names: &[S]) -> Result<Vec<Flag>> {
        names
            .iter()
            .map(|name| self.flag_by_name_or_create(name.as_ref()))
            .collect()
    }

    pub fn mime_type_by_name_or_create(&mut self, name: &str) -> Result<MimeType> {
        if let Some(mt) = self.cache().mime_type(name) {
            return Ok(mt.clone());
        }
        let rows = self.query(
            &format!("SELECT id FROM {} WHERE name = ?", MIME_TYPES),
            &[name.into()],
        )?;
        let id = match rows.first() {
            Some(row) => row.i64(0)?,
            None => self.insert(
                &format!("INSERT INTO {} (name) VALUES (?)", MIME_TYPES),
                &[name.into()],
            )?,
        };
        let mime_type = MimeType {
            id,
            name: name.to_string(),
        };
        self.cache_mut().insert_mime_type(mime_type.clone());
        Ok(mime_type)
    }

    pub fn part_type_by_fq_name_or_create(&mut self, fq_name: &str) -> Result<PartType> {
        if let Some(pt) = self.cache().part_type(fq_name) {
            return Ok(pt.clone());
        }
        let (ns, name) = PartType::parse_fq_name(fq_name)?;
        let rows = self.query(
            &format!("SELECT id FROM {} WHERE ns = ? AND name = ?", PART_TYPES),
            &[ns.into(), name.into()],
        )?;
        let id = match rows.first() {
            Some(row) => row.i64(0)?,
            None => self.insert(
                &format!("INSERT INTO {} (ns, name) VALUES (?, ?)", PART_TYPES),
                &[ns.into(), name.into()],
            )?,
        };
        let part_type = PartType {
            id,
            ns: ns.to_string(),
            name: name.to_string(),
        };
        self.cache_mut().insert_part_type(part_type.clone());
        Ok(part_type)
    }

    pub fn part_type(&mut self, id: EntityId) -> Result<Option<PartType>> {
        if let Some(pt) = self.cache().part_type_by_id(id) {
            return Ok(Some(pt.clone()));
        }
        let rows = self.query(
            &format!("SELECT id, ns, name FROM {} WHERE id = ?", PART_TYPES),
            &[id.into()],
        )?;
        let part_type = match rows.first() {
            Some(row) => PartType {
                id: row.i64(0)?,
                ns: row.string(1)?,
                name: row.string(2)?,
            },
            None => return Ok(None),
        };
        self.cache_mut().insert_part_type(part_type.clone());
        Ok(Some(part_type))
    }

    pub fn resource_by_name_or_create(&mut self, name: &str) -> Result<Resource> {
        if let Some(res) = self.cache().resource(name) {
            return Ok(res.clone());
        }
        let rows = self.query(
            &format!("SELECT id, is_virtual FROM {} WHERE name = ?", RESOURCES),
            &[name.into()],
        )?;
        let resource = match rows.first() {
            Some(row) => Resource {
                id: row.i64(0)?,
                name: name.to_string(),
                is_virtual: row.bool(1)?,
            },
            None => Resource {
                id: self.insert(
                    &format!("INSERT INTO {} (name, is_virtual) VALUES (?, ?)", RESOURCES),
                    &[name.into(), false.into()],
                )?,
                name: name.to_string(),
                is_virtual: false,
            },
        };
        self.cache_mut().insert_resource(resource.clone());
        Ok(resource)
    }

    // =========================================================================
    // Tags
    // =========================================================================

    pub fn tag_type_by_name_or_create(&mut self, name: &str) -> Result<EntityId> {
        let rows = self.query(
            &format!("SELECT id FROM {} WHERE name = ?", TAG_TYPES),
            &[name.into()],
        )?;
        match rows.first() {
            Some(row) => row.i64(0),
            None => self.insert(
                &format!("INSERT INTO {} (name) VALUES (?)", TAG_TYPES),
                &[name.into()],
            ),
        }
    }

    pub fn append_tag(
        &mut self,
        gid: &str,
        type_name: &str,
        parent_id: Option<EntityId>,
    ) -> Result<Tag> {
        let type_id = self.tag_type_by_name_or_create(type_name)?;
        let id = self.insert(
            &format!(
                "INSERT INTO {} (gid, parent_id, type_id) VALUES (?, ?, ?)",
                TAGS
            ),
            &[gid.into(), parent_id.into(), type_id.into()],
        )?;
        Ok(Tag {
            id,
            gid: gid.to_string(),
            parent_id,
            type_id,
        })
    }

    pub fn tag(&mut self, id: EntityId) -> Result<Option<Tag>> {
        let rows = self.query(
            &format!("SELECT id, gid, parent_id, type_id FROM {} WHERE id = ?", TAGS),
            &[id.into()],
        )?;
        match rows.first() {
            Some(row) => Ok(Some(Tag {
                id: row.i64(0)?,
                gid: row.string(1)?,
                parent_id: row.opt_i64(2)?,
                type_id: row.i64(3)?,
            })),
            None => Ok(None),
        }
    }
}
