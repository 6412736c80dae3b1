//! Storage-mode aware part persistence.
//!
//! A payload larger than the store's threshold lives in a file, anything
//! else inline in the `parts` row. Foreign payloads stay where their owner
//! put them. Every transition leaves exactly one artifact holding the
//! current payload.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use pimstore_core::error::{PimError, Result};
use pimstore_core::types::{EntityId, Part, PartStorage};

use crate::datastore::DataStore;
use crate::schema::PARTS;
use crate::value::SqlValue;

/// Column a bulk part removal filters on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartColumn {
    Id,
    PimItemId,
    PartTypeId,
}

impl PartColumn {
    fn as_str(&self) -> &'static str {
        match self {
            PartColumn::Id => "id",
            PartColumn::PimItemId => "pim_item_id",
            PartColumn::PartTypeId => "part_type_id",
        }
    }
}

pub struct PartHelper;

impl PartHelper {
    /// Whether a payload of `size` bytes goes into a file.
    pub fn is_external_size(store: &DataStore, size: i64) -> bool {
        size.max(0) as u64 > store.size_threshold()
    }

    /// Write a new part.
    ///
    /// For an external payload the row is inserted first to obtain the id
    /// the file name is derived from. If writing the file fails the row
    /// stays behind; callers run this inside a transaction and roll back.
    pub fn insert(store: &mut DataStore, part: &mut Part) -> Result<()> {
        if part.storage == PartStorage::Foreign {
            part.id = Self::insert_row(store, part)?;
            return Ok(());
        }

        part.datasize = part.data.len() as i64;
        if !Self::is_external_size(store, part.datasize) {
            part.storage = PartStorage::Internal;
            part.id = Self::insert_row(store, part)?;
            return Ok(());
        }

        let payload = std::mem::take(&mut part.data);
        part.storage = PartStorage::External;
        part.id = Self::insert_row(store, part)?;

        let name = store
            .external_storage_mut()
            .create_part_file(&payload, part.id)?;
        part.data = name.into_bytes();
        Self::update_row(store, part)?;
        debug!(part = part.id, size = part.datasize, "External part inserted");
        Ok(())
    }

    /// Replace the payload of a part, moving it between inline and file
    /// storage as its new size requires. Inserts the part if it has no row.
    pub fn update(store: &mut DataStore, part: &mut Part, data: &[u8], data_size: i64) -> Result<()> {
        let store_external = Self::is_external_size(store, data_size);
        let was_external = part.is_valid() && part.storage == PartStorage::External;

        match (was_external, store_external) {
            (true, true) => {
                let current = Self::file_name(part)?;
                let name = store
                    .external_storage_mut()
                    .update_part_file(data, &current)?;
                part.data = name.into_bytes();
            }
            (false, true) => {
                if !part.is_valid() {
                    part.storage = PartStorage::External;
                    part.data.clear();
                    part.datasize = data_size;
                    part.id = Self::insert_row(store, part)?;
                }
                let name = store
                    .external_storage_mut()
                    .create_part_file(data, part.id)?;
                part.data = name.into_bytes();
                part.storage = PartStorage::External;
            }
            (true, false) => {
                let current = Self::file_name(part)?;
                store.external_storage_mut().remove_part_file(&current)?;
                part.data = data.to_vec();
                part.storage = PartStorage::Internal;
            }
            (false, false) => {
                part.data = data.to_vec();
                part.storage = PartStorage::Internal;
            }
        }

        part.datasize = data_size;
        if part.is_valid() {
            Self::update_row(store, part)
        } else {
            part.id = Self::insert_row(store, part)?;
            Ok(())
        }
    }

    /// Delete a part and its payload file.
    pub fn remove(store: &mut DataStore, part: &Part) -> Result<()> {
        if part.storage == PartStorage::External {
            let name = Self::file_name(part)?;
            store.external_storage_mut().remove_part_file(&name)?;
        }
        store.execute(
            &format!("DELETE FROM {} WHERE id = ?", PARTS),
            &[part.id.into()],
        )?;
        Ok(())
    }

    /// Delete every part whose `column` equals `value`. Payload files go
    /// first; if one cannot be removed no row is touched.
    pub fn remove_by(store: &mut DataStore, column: PartColumn, value: EntityId) -> Result<usize> {
        let rows = store.query(
            &format!(
                "SELECT data FROM {} WHERE {} = ? AND storage = ?",
                PARTS,
                column.as_str()
            ),
            &[value.into(), PartStorage::External.as_i64().into()],
        )?;
        for row in rows {
            let name = String::from_utf8_lossy(&row.bytes(0)?).into_owned();
            store.external_storage_mut().remove_part_file(&name)?;
        }
        store.execute(
            &format!("DELETE FROM {} WHERE {} = ?", PARTS, column.as_str()),
            &[value.into()],
        )
    }

    /// Drop the payload in place: no read, no rewrite.
    pub fn truncate(store: &mut DataStore, part: &mut Part) -> Result<()> {
        if part.storage == PartStorage::External {
            let name = Self::file_name(part)?;
            store.external_storage_mut().remove_part_file(&name)?;
        }
        part.data.clear();
        part.datasize = 0;
        part.storage = PartStorage::Internal;
        Self::update_row(store, part)
    }

    /// The payload bytes, whatever the storage mode.
    pub fn translate_data(store: &DataStore, part: &Part) -> Result<Vec<u8>> {
        match part.storage {
            PartStorage::Internal => Ok(part.data.clone()),
            PartStorage::External => {
                let name = Self::file_name(part)?;
                store.external_storage().read_part_file(&name)
            }
            PartStorage::Foreign => {
                let path = PathBuf::from(Self::file_name(part)?);
                std::fs::read(&path).map_err(|e| PimError::payload_io(&path, e))
            }
        }
    }

    /// Absolute path of the payload file, if the part has one.
    pub fn resolve_absolute_path(store: &DataStore, part: &Part) -> Option<(PathBuf, bool)> {
        let name = part.file_reference()?;
        Some(store.external_storage().resolve_absolute_path(&name))
    }

    /// Check the payload file of a non-inline part. A missing file demotes
    /// the part to an empty inline part. Returns whether the part was intact.
    pub fn verify(store: &mut DataStore, part: &mut Part) -> Result<bool> {
        let exists = match part.storage {
            PartStorage::Internal => return Ok(true),
            PartStorage::External => Self::resolve_absolute_path(store, part)
                .map(|(_, exists)| exists)
                .unwrap_or(false),
            PartStorage::Foreign => Path::new(&Self::file_name(part)?).exists(),
        };
        if exists {
            return Ok(true);
        }

        warn!(
            part = part.id,
            file = %String::from_utf8_lossy(&part.data),
            "Payload file of part is missing, resetting part"
        );
        part.data.clear();
        part.datasize = 0;
        part.storage = PartStorage::Internal;
        Self::update_row(store, part)?;
        Ok(false)
    }

    fn file_name(part: &Part) -> Result<String> {
        part
            .file_reference()
            .ok_or_else(|| PimError::Integrity(format!("part {} has no payload file", part.id)))
    }

    pub(crate) fn insert_row(store: &mut DataStore, part: &Part) -> Result<EntityId> {
        store.insert(
            &format!(
                "INSERT INTO {} (pim_item_id, part_type_id, data, datasize, version, storage) \
                 VALUES (?, ?, ?, ?, ?, ?)",
                PARTS
            ),
            &[
                part.pim_item_id.into(),
                part.part_type_id.into(),
                SqlValue::Blob(part.data.clone()),
                part.datasize.into(),
                part.version.into(),
                part.storage.as_i64().into(),
            ],
        )
    }

    pub(crate) fn update_row(store: &mut DataStore, part: &Part) -> Result<()> {
        store.execute(
            &format!(
                "UPDATE {} SET pim_item_id = ?, part_type_id = ?, data = ?, datasize = ?, \
                 version = ?, storage = ? WHERE id = ?",
                PARTS
            ),
            &[
                part.pim_item_id.into(),
                part.part_type_id.into(),
                SqlValue::Blob(part.data.clone()),
                part.datasize.into(),
                part.version.into(),
                part.storage.as_i64().into(),
                part.id.into(),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::test_support::{recorded_store, store, test_collection};
    use crate::datastore::{DataStore, NewPimItem};

    /// An item with one payload part type, returns (item id, part type id).
    fn item(store: &mut DataStore) -> (EntityId, EntityId) {
        let collection = test_collection(store, "Inbox");
        let item = store
            .append_pim_item(NewPimItem::new(collection, "message/rfc822").remote_id("rid"))
            .unwrap();
        let pt = store.part_type_by_fq_name_or_create("PLD:RFC822").unwrap();
        (item.id, pt.id)
    }

    fn file_size(store: &DataStore, part: &Part) -> u64 {
        let (path, exists) = PartHelper::resolve_absolute_path(store, part).unwrap();
        assert!(exists, "payload file {} missing", path.display());
        std::fs::metadata(path).unwrap().len()
    }

    #[test]
    fn test_small_payload_is_internal() {
        let (_dir, mut store) = store();
        let (item_id, pt) = item(&mut store);
        let mut part = Part::new(item_id, pt, vec![7u8; 4096]);
        PartHelper::insert(&mut store, &mut part).unwrap();

        assert_eq!(part.storage, PartStorage::Internal);
        assert_eq!(part.datasize, 4096);
        let stored = store.part(part.id).unwrap().unwrap();
        assert_eq!(stored.data.len(), 4096);
    }

    #[test]
    fn test_large_payload_is_external_then_truncated() {
        let (_dir, mut store) = store();
        let (item_id, pt) = item(&mut store);
        let mut part = Part::new(item_id, pt, vec![1u8; 9000]);
        PartHelper::insert(&mut store, &mut part).unwrap();

        assert_eq!(part.storage, PartStorage::External);
        assert_eq!(part.datasize, 9000);
        assert_eq!(file_size(&store, &part), 9000);
        let (path, _) = PartHelper::resolve_absolute_path(&store, &part).unwrap();

        let stored = store.part(part.id).unwrap().unwrap();
        assert_eq!(stored.storage, PartStorage::External);
        assert_eq!(stored.data, format!("{}_r0", part.id).into_bytes());

        PartHelper::truncate(&mut store, &mut part).unwrap();
        assert_eq!(part.storage, PartStorage::Internal);
        assert_eq!(part.datasize, 0);
        assert!(!path.exists());
        let stored = store.part(part.id).unwrap().unwrap();
        assert_eq!(stored.datasize, 0);
        assert!(stored.data.is_empty());
    }

    #[test]
    fn test_translate_data_is_storage_transparent() {
        let (_dir, mut store) = store();
        let (item_id, pt) = item(&mut store);
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        let mut external = Part::new(item_id, pt, payload.clone());
        PartHelper::insert(&mut store, &mut external).unwrap();
        assert_eq!(external.storage, PartStorage::External);

        store.set_size_threshold(u64::MAX);
        let mut internal = Part::new(item_id, pt, payload.clone());
        PartHelper::insert(&mut store, &mut internal).unwrap();
        assert_eq!(internal.storage, PartStorage::Internal);

        assert_eq!(PartHelper::translate_data(&store, &external).unwrap(), payload);
        assert_eq!(PartHelper::translate_data(&store, &internal).unwrap(), payload);
    }

    #[test]
    fn test_update_transitions() {
        let (_dir, mut store) = store();
        let (item_id, pt) = item(&mut store);
        let big = vec![2u8; 5000];
        let bigger = vec![3u8; 6000];
        let small = b"tiny".to_vec();

        // internal -> internal
        let mut part = Part::new(item_id, pt, small.clone());
        PartHelper::insert(&mut store, &mut part).unwrap();
        PartHelper::update(&mut store, &mut part, b"other", 5).unwrap();
        assert_eq!(part.storage, PartStorage::Internal);
        assert_eq!(part.data, b"other");

        // internal -> external
        PartHelper::update(&mut store, &mut part, &big, big.len() as i64).unwrap();
        assert_eq!(part.storage, PartStorage::External);
        assert_eq!(file_size(&store, &part), 5000);
        let (first_file, _) = PartHelper::resolve_absolute_path(&store, &part).unwrap();

        // external -> external, new revision replaces the old file
        PartHelper::update(&mut store, &mut part, &bigger, bigger.len() as i64).unwrap();
        assert_eq!(part.storage, PartStorage::External);
        assert_eq!(file_size(&store, &part), 6000);
        assert!(!first_file.exists());
        let (second_file, _) = PartHelper::resolve_absolute_path(&store, &part).unwrap();
        assert_ne!(first_file, second_file);

        // external -> internal
        PartHelper::update(&mut store, &mut part, &small, small.len() as i64).unwrap();
        assert_eq!(part.storage, PartStorage::Internal);
        assert!(!second_file.exists());
        let stored = store.part(part.id).unwrap().unwrap();
        assert_eq!(stored.data, small);
        assert_eq!(stored.storage, PartStorage::Internal);
    }

    #[test]
    fn test_update_inserts_new_part() {
        let (_dir, mut store) = store();
        let (item_id, pt) = item(&mut store);
        let mut part = Part::new(item_id, pt, Vec::new());
        PartHelper::update(&mut store, &mut part, &[9u8; 8000], 8000).unwrap();
        assert!(part.is_valid());
        assert_eq!(part.storage, PartStorage::External);
        assert_eq!(file_size(&store, &part), 8000);
    }

    #[test]
    fn test_remove_by_item_deletes_files_and_rows() {
        let (_dir, mut store) = store();
        let (item_id, pt) = item(&mut store);
        let attr = store.part_type_by_fq_name_or_create("ATR:HEAD").unwrap();
        let mut big = Part::new(item_id, pt, vec![5u8; 7000]);
        let mut small = Part::new(item_id, attr.id, b"head".to_vec());
        PartHelper::insert(&mut store, &mut big).unwrap();
        PartHelper::insert(&mut store, &mut small).unwrap();
        let (path, _) = PartHelper::resolve_absolute_path(&store, &big).unwrap();

        let removed = PartHelper::remove_by(&mut store, PartColumn::PimItemId, item_id).unwrap();
        assert_eq!(removed, 2);
        assert!(!path.exists());
        assert!(store.parts_of_item(item_id).unwrap().is_empty());
    }

    #[test]
    fn test_remove_single_part() {
        let (_dir, mut store) = store();
        let (item_id, pt) = item(&mut store);
        let mut part = Part::new(item_id, pt, vec![5u8; 7000]);
        PartHelper::insert(&mut store, &mut part).unwrap();
        let (path, _) = PartHelper::resolve_absolute_path(&store, &part).unwrap();

        PartHelper::remove(&mut store, &part).unwrap();
        assert!(!path.exists());
        assert!(store.part(part.id).unwrap().is_none());
    }

    #[test]
    fn test_verify_resets_missing_file() {
        let (_dir, mut store) = store();
        let (item_id, pt) = item(&mut store);
        let mut part = Part::new(item_id, pt, vec![5u8; 7000]);
        PartHelper::insert(&mut store, &mut part).unwrap();
        assert!(PartHelper::verify(&mut store, &mut part).unwrap());

        let (path, _) = PartHelper::resolve_absolute_path(&store, &part).unwrap();
        std::fs::remove_file(path).unwrap();
        assert!(!PartHelper::verify(&mut store, &mut part).unwrap());
        assert_eq!(part.storage, PartStorage::Internal);
        assert_eq!(store.part(part.id).unwrap().unwrap().datasize, 0);
    }

    #[test]
    fn test_foreign_part_is_never_deleted() {
        let (dir, mut store) = store();
        let (item_id, pt) = item(&mut store);
        let foreign = dir.path().join("owned-elsewhere.eml");
        std::fs::write(&foreign, vec![4u8; 9000]).unwrap();

        let mut part = Part {
            data: foreign.to_string_lossy().into_owned().into_bytes(),
            datasize: 9000,
            storage: PartStorage::Foreign,
            ..Part::new(item_id, pt, Vec::new())
        };
        PartHelper::insert(&mut store, &mut part).unwrap();
        assert_eq!(PartHelper::translate_data(&store, &part).unwrap().len(), 9000);

        PartHelper::update(&mut store, &mut part, b"inline now", 10).unwrap();
        assert_eq!(part.storage, PartStorage::Internal);
        assert!(foreign.exists());

        PartHelper::remove(&mut store, &part).unwrap();
        assert!(foreign.exists());
    }

    #[test]
    fn test_rolled_back_insert_leaves_no_file() {
        let (_dir, mut store, _log) = recorded_store(4096);
        let (item_id, pt) = item(&mut store);
        store.begin_transaction("insert").unwrap();
        let mut part = Part::new(item_id, pt, vec![1u8; 9000]);
        PartHelper::insert(&mut store, &mut part).unwrap();
        let (path, exists) = PartHelper::resolve_absolute_path(&store, &part).unwrap();
        assert!(exists);
        store.rollback_transaction().unwrap();

        assert!(!path.exists());
        assert!(store.part(part.id).unwrap().is_none());
    }

    #[test]
    fn test_threshold_boundary() {
        let (_dir, mut store) = store();
        let (item_id, pt) = item(&mut store);
        for (size, expected) in [
            (4095usize, PartStorage::Internal),
            (4096, PartStorage::Internal),
            (4097, PartStorage::External),
        ] {
            let mut part = Part::new(item_id, pt, vec![0u8; size]);
            PartHelper::insert(&mut store, &mut part).unwrap();
            assert_eq!(part.storage, expected, "size {}", size);
            if expected == PartStorage::External {
                assert_eq!(file_size(&store, &part), size as u64);
            }
        }
    }
}
