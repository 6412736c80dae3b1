//! Collection tree operations.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use pimstore_core::error::{PimError, Result};
use pimstore_core::events::{ChangeNotification, CollectionScope};
use pimstore_core::types::{
    CachePolicy, Collection, CollectionAttribute, EntityId, PartStorage, PimItem,
};

use super::entities::{
    collection_from_row, item_from_row, now, opt_text, COLLECTION_COLUMNS, ITEM_COLUMNS,
};
use super::{placeholders, DataStore};
use crate::notification::change_set;
use crate::schema::{
    COLLECTIONS, COLLECTION_ATTRIBUTES, COLLECTION_MIME_TYPES, COLLECTION_PIM_ITEMS, MIME_TYPES,
    PARTS, PIM_ITEMS,
};
use crate::value::SqlValue;

impl DataStore {
    /// Insert a collection with its content mime types and attributes.
    pub fn append_collection(
        &mut self,
        collection: &mut Collection,
        mime_types: &[&str],
        attributes: &[(Vec<u8>, Vec<u8>)],
    ) -> Result<()> {
        let mut tx = self.transaction("append collection")?;
        if let Some(parent) = collection.parent_id {
            if tx.collection(parent)?.is_none() {
                return Err(PimError::NotFound(format!("parent collection {}", parent)));
            }
        }

        let policy = &collection.cache_policy;
        collection.id = tx.insert(
            &format!(
                "INSERT INTO {} (remote_id, remote_revision, name, parent_id, resource_id, enabled, \
                 is_virtual, cache_policy_inherit, cache_policy_check_interval, \
                 cache_policy_cache_timeout, cache_policy_sync_on_demand, cache_policy_local_parts) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                COLLECTIONS
            ),
            &[
                opt_text(&collection.remote_id),
                opt_text(&collection.remote_revision),
                collection.name.as_str().into(),
                collection.parent_id.into(),
                collection.resource_id.into(),
                collection.enabled.into(),
                collection.is_virtual.into(),
                policy.inherit.into(),
                policy.check_interval.into(),
                policy.cache_timeout.into(),
                policy.sync_on_demand.into(),
                policy.local_parts.as_str().into(),
            ],
        )?;

        tx.append_mime_type_for_collection(collection.id, mime_types)?;
        for (attr_type, value) in attributes {
            tx.add_collection_attribute(collection, attr_type, value, true)?;
        }

        tx.notify(ChangeNotification::CollectionAdded {
            collection_id: collection.id,
            resource_id: collection.resource_id,
        });
        tx.commit()?;
        debug!(id = collection.id, name = %collection.name, "Collection appended");
        Ok(())
    }

    /// Delete a collection and everything below it.
    ///
    /// Payload files go first. If any of them cannot be removed nothing is
    /// deleted from the database.
    pub fn cleanup_collection(&mut self, collection: &Collection) -> Result<()> {
        let mut tx = self.transaction("cleanup collection")?;

        let mut subtree = vec![collection.clone()];
        let mut idx = 0;
        while idx < subtree.len() {
            let children = tx.child_collections(subtree[idx].id)?;
            subtree.extend(children);
            idx += 1;
        }
        let ids: Vec<EntityId> = subtree.iter().map(|c| c.id).collect();
        let params: Vec<SqlValue> = ids.iter().map(|id| (*id).into()).collect();

        let files = tx.query(
            &format!(
                "SELECT p.data FROM {} p JOIN {} i ON i.id = p.pim_item_id \
                 WHERE i.collection_id IN ({}) AND p.storage = ? AND p.data IS NOT NULL",
                PARTS,
                PIM_ITEMS,
                placeholders(ids.len())
            ),
            &params
                .iter()
                .cloned()
                .chain([PartStorage::External.as_i64().into()])
                .collect::<Vec<_>>(),
        )?;
        for row in files {
            let name = String::from_utf8_lossy(&row.bytes(0)?).into_owned();
            if let Err(e) = tx.external_storage_mut().remove_part_file(&name) {
                warn!(collection = collection.id, file = %name, error = %e, "Failed to remove payload file");
                return Err(e);
            }
        }

        // Deepest collections first.
        for c in subtree.iter().rev() {
            let items = tx.items_in_collection(c.id)?;
            if !items.is_empty() {
                tx.notify(ChangeNotification::ItemsRemoved {
                    item_ids: items.iter().map(|i| i.id).collect(),
                    scope: CollectionScope::Single(c.id),
                });
            }
            tx.notify(ChangeNotification::CollectionRemoved {
                collection_id: c.id,
                resource_id: c.resource_id,
            });
        }

        tx.execute(
            &format!("DELETE FROM {} WHERE id = ?", COLLECTIONS),
            &[collection.id.into()],
        )?;
        for id in &ids {
            tx.cache_mut().invalidate_collection(*id);
            tx.cache_mut().invalidate_statistics(*id);
        }
        tx.commit()?;
        debug!(collection = collection.id, removed = ids.len(), "Collection subtree removed");
        Ok(())
    }

    /// Reparent a collection; `None` moves it to the root.
    ///
    /// Moving into another resource resets the remote identifiers of the
    /// whole subtree and marks its items dirty.
    pub fn move_collection(
        &mut self,
        collection: &mut Collection,
        new_parent: Option<&Collection>,
    ) -> Result<()> {
        let destination = new_parent.map(|p| p.id);
        if collection.parent_id == destination {
            return Ok(());
        }

        let mut tx = self.transaction("move collection")?;
        if let Some(parent) = new_parent {
            let mut cursor = Some(parent.id);
            while let Some(id) = cursor {
                if id == collection.id {
                    return Err(PimError::Integrity(format!(
                        "cannot move collection {} into its own subtree",
                        collection.id
                    )));
                }
                cursor = tx
                    .collection(id)?
                    .ok_or_else(|| PimError::NotFound(format!("collection {}", id)))?
                    .parent_id;
            }
        }

        let source = collection.parent_id;
        let resource_id = new_parent
            .map(|p| p.resource_id)
            .unwrap_or(collection.resource_id);

        collection.parent_id = destination;
        if collection.resource_id != resource_id {
            collection.resource_id = resource_id;
            collection.remote_id.clear();
            collection.remote_revision.clear();
            tx.reset_resource_recursive(collection.id, resource_id)?;
        }
        tx.update_collection(collection)?;

        tx.notify(ChangeNotification::CollectionMoved {
            collection_id: collection.id,
            source_parent_id: source,
            destination_parent_id: destination,
        });
        tx.commit()
    }

    fn reset_resource_recursive(&mut self, collection_id: EntityId, resource_id: EntityId) -> Result<()> {
        let timestamp = now();
        self.execute(
            &format!(
                "UPDATE {} SET remote_id = NULL, remote_revision = NULL, datetime = ?, atime = ?, \
                 dirty = ? WHERE collection_id = ?",
                PIM_ITEMS
            ),
            &[timestamp.into(), timestamp.into(), true.into(), collection_id.into()],
        )?;

        for child in self.child_collections(collection_id)? {
            self.execute(
                &format!(
                    "UPDATE {} SET resource_id = ?, remote_id = NULL, remote_revision = NULL \
                     WHERE id = ?",
                    COLLECTIONS
                ),
                &[resource_id.into(), child.id.into()],
            )?;
            self.cache_mut().invalidate_collection(child.id);
            self.reset_resource_recursive(child.id, resource_id)?;
        }
        Ok(())
    }

    /// Effective cache policy: the collection's own, the first non-inheriting
    /// ancestor's, or the system default.
    pub fn active_cache_policy(&mut self, collection: &Collection) -> Result<CachePolicy> {
        if !collection.cache_policy.inherit {
            return Ok(collection.cache_policy.clone());
        }
        let mut parent_id = collection.parent_id;
        while let Some(id) = parent_id {
            let Some(parent) = self.collection(id)? else {
                break;
            };
            if !parent.cache_policy.inherit {
                return Ok(CachePolicy {
                    inherit: true,
                    ..parent.cache_policy
                });
            }
            parent_id = parent.parent_id;
        }
        Ok(CachePolicy::default())
    }

    pub fn append_mime_type_for_collection<S: AsRef<str>>(
        &mut self,
        collection_id: EntityId,
        mime_types: &[S],
    ) -> Result<()> {
        for name in mime_types {
            let mime_type = self.mime_type_by_name_or_create(name.as_ref())?;
            self.execute(
                &format!(
                    "INSERT INTO {} (collection_id, mime_type_id) VALUES (?, ?)",
                    COLLECTION_MIME_TYPES
                ),
                &[collection_id.into(), mime_type.id.into()],
            )?;
        }
        Ok(())
    }

    pub fn collection_mime_types(&mut self, collection_id: EntityId) -> Result<BTreeSet<String>> {
        let rows = self.query(
            &format!(
                "SELECT m.name FROM {} m JOIN {} r ON r.mime_type_id = m.id \
                 WHERE r.collection_id = ?",
                MIME_TYPES, COLLECTION_MIME_TYPES
            ),
            &[collection_id.into()],
        )?;
        rows.iter().map(|row| row.string(0)).collect()
    }

    /// Link an item into a virtual collection.
    pub fn link_item(&mut self, collection: &Collection, item: &PimItem) -> Result<()> {
        if !collection.is_virtual {
            return Err(PimError::Integrity(format!(
                "collection {} is not virtual",
                collection.id
            )));
        }
        self.execute(
            &format!(
                "INSERT INTO {} (collection_id, pim_item_id) VALUES (?, ?)",
                COLLECTION_PIM_ITEMS
            ),
            &[collection.id.into(), item.id.into()],
        )?;
        Ok(())
    }

    /// Virtual collections an item is linked into.
    pub fn virtual_collections(&mut self, item: &PimItem) -> Result<Vec<Collection>> {
        let columns = COLLECTION_COLUMNS
            .split(", ")
            .map(|c| format!("c.{}", c))
            .collect::<Vec<_>>()
            .join(", ");
        let rows = self.query(
            &format!(
                "SELECT {} FROM {} c JOIN {} r ON r.collection_id = c.id \
                 WHERE r.pim_item_id = ? ORDER BY c.id",
                columns, COLLECTIONS, COLLECTION_PIM_ITEMS
            ),
            &[item.id.into()],
        )?;
        rows.iter().map(collection_from_row).collect()
    }

    /// Items linked into a virtual collection.
    pub fn linked_items(&mut self, collection_id: EntityId) -> Result<Vec<PimItem>> {
        let columns = ITEM_COLUMNS
            .split(", ")
            .map(|c| format!("i.{}", c))
            .collect::<Vec<_>>()
            .join(", ");
        let rows = self.query(
            &format!(
                "SELECT {} FROM {} i JOIN {} r ON r.pim_item_id = i.id \
                 WHERE r.collection_id = ? ORDER BY i.id",
                columns, PIM_ITEMS, COLLECTION_PIM_ITEMS
            ),
            &[collection_id.into()],
        )?;
        rows.iter().map(item_from_row).collect()
    }

    /// Attach an attribute. Fails if the collection already has one of
    /// that type.
    pub fn add_collection_attribute(
        &mut self,
        collection: &Collection,
        attr_type: &[u8],
        value: &[u8],
        silent: bool,
    ) -> Result<()> {
        let existing = self.query(
            &format!(
                "SELECT id FROM {} WHERE collection_id = ? AND attr_type = ?",
                COLLECTION_ATTRIBUTES
            ),
            &[collection.id.into(), attr_type.into()],
        )?;
        if !existing.is_empty() {
            return Err(PimError::Integrity(format!(
                "collection {} already has attribute {}",
                collection.id,
                String::from_utf8_lossy(attr_type)
            )));
        }

        self.insert(
            &format!(
                "INSERT INTO {} (collection_id, attr_type, value) VALUES (?, ?, ?)",
                COLLECTION_ATTRIBUTES
            ),
            &[collection.id.into(), attr_type.into(), value.into()],
        )?;
        if !silent {
            self.notify(ChangeNotification::CollectionChanged {
                collection_id: collection.id,
                changes: change_set([String::from_utf8_lossy(attr_type).into_owned()]),
            });
        }
        Ok(())
    }

    /// Returns whether an attribute was removed.
    pub fn remove_collection_attribute(
        &mut self,
        collection: &Collection,
        attr_type: &[u8],
    ) -> Result<bool> {
        let removed = self.execute(
            &format!(
                "DELETE FROM {} WHERE collection_id = ? AND attr_type = ?",
                COLLECTION_ATTRIBUTES
            ),
            &[collection.id.into(), attr_type.into()],
        )?;
        if removed == 0 {
            return Ok(false);
        }
        self.notify(ChangeNotification::CollectionChanged {
            collection_id: collection.id,
            changes: change_set([String::from_utf8_lossy(attr_type).into_owned()]),
        });
        Ok(true)
    }

    pub fn collection_attributes(&mut self, collection_id: EntityId) -> Result<Vec<CollectionAttribute>> {
        let rows = self.query(
            &format!(
                "SELECT id, collection_id, attr_type, value FROM {} WHERE collection_id = ? ORDER BY id",
                COLLECTION_ATTRIBUTES
            ),
            &[collection_id.into()],
        )?;
        rows.iter()
            .map(|row| {
                Ok(CollectionAttribute {
                    id: row.i64(0)?,
                    collection_id: row.i64(1)?,
                    attr_type: row.bytes(2)?,
                    value: row.bytes(3)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{store, test_collection};
    use super::super::NewPimItem;
    use super::*;
    use crate::parts::PartHelper;
    use std::sync::{Arc, Mutex};

    fn child(store: &mut DataStore, name: &str, parent: &Collection) -> Collection {
        let mut c = Collection::new(name, Some(parent.id), parent.resource_id);
        store.append_collection(&mut c, &[], &[]).unwrap();
        c
    }

    #[test]
    fn test_append_collection_with_attributes() {
        let (_dir, mut store) = store();
        let resource = store.resource_by_name_or_create("imap").unwrap();
        let mut c = Collection::new("INBOX", None, resource.id);
        store
            .append_collection(
                &mut c,
                &["message/rfc822", "inode/directory"],
                &[(b"ENTITYDISPLAY".to_vec(), b"(\"Inbox\")".to_vec())],
            )
            .unwrap();
        assert!(c.id > 0);
        assert_eq!(store.collection(c.id).unwrap(), Some(c.clone()));
        assert_eq!(
            store.collection_mime_types(c.id).unwrap(),
            change_set(["message/rfc822", "inode/directory"])
        );
        let attrs = store.collection_attributes(c.id).unwrap();
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs[0].value, b"(\"Inbox\")");

        assert!(store
            .add_collection_attribute(&c, b"ENTITYDISPLAY", b"x", true)
            .is_err());
        assert!(store.remove_collection_attribute(&c, b"ENTITYDISPLAY").unwrap());
        assert!(!store.remove_collection_attribute(&c, b"ENTITYDISPLAY").unwrap());
    }

    #[test]
    fn test_cleanup_collection_removes_subtree_and_files() {
        let (_dir, mut store) = store();
        let root_id = test_collection(&mut store, "Root");
        let root = store.collection(root_id).unwrap().unwrap();
        let sub = child(&mut store, "Sub", &root);
        let item = store
            .append_pim_item(NewPimItem::new(sub.id, "text/plain").part("PLD:DATA", vec![1u8; 6000]))
            .unwrap();
        let part = store.parts_of_item(item.id).unwrap().remove(0);
        let (path, _) = PartHelper::resolve_absolute_path(&store, &part).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store.subscribe(move |batch: &[ChangeNotification]| {
            sink.lock().unwrap().extend_from_slice(batch);
        });

        store.cleanup_collection(&root).unwrap();
        assert!(!path.exists());
        assert!(store.collection(root.id).unwrap().is_none());
        assert!(store.collection(sub.id).unwrap().is_none());
        assert!(store.pim_item(item.id).unwrap().is_none());

        let seen = seen.lock().unwrap();
        let names: Vec<&str> = seen.iter().map(|n| n.event_name()).collect();
        assert_eq!(names, vec!["items_removed", "collection_removed", "collection_removed"]);
    }

    #[test]
    fn test_cleanup_collection_aborts_on_file_error() {
        let (_dir, mut store) = store();
        let root_id = test_collection(&mut store, "Root");
        let root = store.collection(root_id).unwrap().unwrap();
        let item = store
            .append_pim_item(NewPimItem::new(root.id, "text/plain").part("PLD:DATA", vec![1u8; 6000]))
            .unwrap();
        let part = store.parts_of_item(item.id).unwrap().remove(0);
        let (path, _) = PartHelper::resolve_absolute_path(&store, &part).unwrap();

        // A directory in place of the file cannot be removed as a file.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        assert!(store.cleanup_collection(&root).is_err());
        assert!(store.collection(root.id).unwrap().is_some());
        assert!(store.pim_item(item.id).unwrap().is_some());
    }

    #[test]
    fn test_move_collection_across_resources() {
        let (_dir, mut store) = store();
        let local = store.resource_by_name_or_create("local").unwrap();
        let imap = store.resource_by_name_or_create("imap").unwrap();

        let mut source = Collection::new("Folder", None, local.id);
        source.remote_id = "folder-rid".into();
        store.append_collection(&mut source, &[], &[]).unwrap();
        let nested = child(&mut store, "Nested", &source);
        let item = store
            .append_pim_item(NewPimItem::new(nested.id, "text/plain").remote_id("item-rid"))
            .unwrap();

        let mut target = Collection::new("INBOX", None, imap.id);
        store.append_collection(&mut target, &[], &[]).unwrap();

        store.move_collection(&mut source, Some(&target)).unwrap();
        assert_eq!(source.parent_id, Some(target.id));
        assert_eq!(source.resource_id, imap.id);
        assert!(source.remote_id.is_empty());

        let nested = store.collection(nested.id).unwrap().unwrap();
        assert_eq!(nested.resource_id, imap.id);
        let item = store.pim_item(item.id).unwrap().unwrap();
        assert!(item.dirty);
        assert!(item.remote_id.is_empty());
    }

    #[test]
    fn test_move_into_own_subtree_fails() {
        let (_dir, mut store) = store();
        let root_id = test_collection(&mut store, "Root");
        let mut root = store.collection(root_id).unwrap().unwrap();
        let sub = child(&mut store, "Sub", &root);
        assert!(matches!(
            store.move_collection(&mut root, Some(&sub)),
            Err(PimError::Integrity(_))
        ));
        assert!(!store.in_transaction());
    }

    #[test]
    fn test_active_cache_policy_inherits() {
        let (_dir, mut store) = store();
        let resource = store.resource_by_name_or_create("imap").unwrap();
        let mut top = Collection::new("Top", None, resource.id);
        top.cache_policy = CachePolicy {
            inherit: false,
            check_interval: 5,
            cache_timeout: 60,
            sync_on_demand: true,
            local_parts: "PLD:ENVELOPE".into(),
        };
        store.append_collection(&mut top, &[], &[]).unwrap();
        let middle = child(&mut store, "Middle", &top);
        let leaf = child(&mut store, "Leaf", &middle);

        let policy = store.active_cache_policy(&leaf).unwrap();
        assert_eq!(policy.check_interval, 5);
        assert_eq!(policy.local_parts, "PLD:ENVELOPE");
        assert!(policy.inherit);

        let orphan_id = test_collection(&mut store, "Orphan");
        let orphan = store.collection(orphan_id).unwrap().unwrap();
        assert_eq!(store.active_cache_policy(&orphan).unwrap(), CachePolicy::default());
    }

    #[test]
    fn test_virtual_collections() {
        let (_dir, mut store) = store();
        let inbox = test_collection(&mut store, "Inbox");
        let item = store.append_pim_item(NewPimItem::new(inbox, "text/plain")).unwrap();
        let search = store.collection(inbox).unwrap().unwrap();
        assert!(store.link_item(&search, &item).is_err());

        let resource = store.resource_by_name_or_create("search").unwrap();
        let mut virt = Collection::new("Results", None, resource.id);
        virt.is_virtual = true;
        store.append_collection(&mut virt, &[], &[]).unwrap();
        store.link_item(&virt, &item).unwrap();

        let linked = store.virtual_collections(&item).unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].id, virt.id);
        assert_eq!(store.linked_items(virt.id).unwrap()[0].id, item.id);
    }
}
