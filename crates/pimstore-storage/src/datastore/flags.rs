//! Item flags.

use std::collections::BTreeSet;

use tracing::debug;

use pimstore_core::error::Result;
use pimstore_core::events::{ChangeNotification, CollectionScope};
use pimstore_core::types::{EntityId, Flag, PimItem};

use super::relations::{diff, item_ids, ItemRelation};
use super::DataStore;
use crate::schema::{FLAGS, PIM_ITEM_FLAGS};

const RELATION: ItemRelation = ItemRelation {
    table: PIM_ITEM_FLAGS,
    column: "flag_id",
};

/// Flag names added to or removed from at least one item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagChange {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

impl FlagChange {
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

fn scope(items: &[PimItem]) -> CollectionScope {
    CollectionScope::from_items(items.iter().map(|i| i.collection_id))
}

impl DataStore {
    /// Make `flags` the exact flag set of every item.
    ///
    /// Issues one query for the current state, one DELETE and one INSERT
    /// unless the batch outgrows a single statement, and a single
    /// notification covering all items.
    pub fn set_items_flags(
        &mut self,
        items: &[PimItem],
        flags: &[Flag],
        silent: bool,
    ) -> Result<FlagChange> {
        let ids = item_ids(items);
        let current = RELATION.current(self, &ids)?;
        let wanted: BTreeSet<EntityId> = flags.iter().map(|f| f.id).collect();
        let (to_remove, to_add) = diff(&ids, &current, &wanted);

        let mut change = FlagChange::default();
        let removed_ids: BTreeSet<EntityId> = to_remove.iter().map(|(_, f)| *f).collect();
        for id in removed_ids {
            if let Some(flag) = self.flag_by_id(id)? {
                change.removed.insert(flag.name);
            }
        }
        let added_ids: BTreeSet<EntityId> = to_add.iter().map(|(_, f)| *f).collect();
        change.added = flags
            .iter()
            .filter(|f| added_ids.contains(&f.id))
            .map(|f| f.name.clone())
            .collect();

        RELATION.delete(self, &to_remove)?;
        RELATION.insert(self, &to_add)?;

        debug!(
            items = ids.len(),
            added = to_add.len(),
            removed = to_remove.len(),
            "Item flags set"
        );
        self.notify_flags(items, &change, silent);
        Ok(change)
    }

    /// Add `flags` to every item.
    ///
    /// With `check_if_exists` pairs already present are skipped; without
    /// it the caller guarantees none of the pairs exist yet.
    pub fn append_items_flags(
        &mut self,
        items: &[PimItem],
        flags: &[Flag],
        check_if_exists: bool,
        silent: bool,
    ) -> Result<FlagChange> {
        let ids = item_ids(items);
        let wanted: BTreeSet<EntityId> = flags.iter().map(|f| f.id).collect();

        let to_add: Vec<(EntityId, EntityId)> = if check_if_exists {
            let current = RELATION.current(self, &ids)?;
            diff(&ids, &current, &wanted).1
        } else {
            ids.iter()
                .flat_map(|item| wanted.iter().map(move |flag| (*item, *flag)))
                .collect()
        };

        let added_ids: BTreeSet<EntityId> = to_add.iter().map(|(_, f)| *f).collect();
        let change = FlagChange {
            added: flags
                .iter()
                .filter(|f| added_ids.contains(&f.id))
                .map(|f| f.name.clone())
                .collect(),
            removed: BTreeSet::new(),
        };

        RELATION.insert(self, &to_add)?;
        self.notify_flags(items, &change, silent);
        Ok(change)
    }

    /// Remove `flags` from every item.
    pub fn remove_items_flags(
        &mut self,
        items: &[PimItem],
        flags: &[Flag],
        silent: bool,
    ) -> Result<FlagChange> {
        let ids = item_ids(items);
        let flag_ids: Vec<EntityId> = flags.iter().map(|f| f.id).collect();
        let affected = RELATION.delete_all(self, &ids, &flag_ids)?;

        let mut change = FlagChange::default();
        if affected > 0 {
            change.removed = flags.iter().map(|f| f.name.clone()).collect();
        }
        self.notify_flags(items, &change, silent);
        Ok(change)
    }

    /// Flags of one item, ordered by name.
    pub fn item_flags(&mut self, item_id: EntityId) -> Result<Vec<Flag>> {
        let rows = self.query(
            &format!(
                "SELECT f.id, f.name FROM {} f JOIN {} r ON r.flag_id = f.id \
                 WHERE r.pim_item_id = ? ORDER BY f.name",
                FLAGS, PIM_ITEM_FLAGS
            ),
            &[item_id.into()],
        )?;
        rows.iter()
            .map(|row| {
                Ok(Flag {
                    id: row.i64(0)?,
                    name: row.string(1)?,
                })
            })
            .collect()
    }

    pub fn flag_by_id(&mut self, id: EntityId) -> Result<Option<Flag>> {
        if let Some(flag) = self.cache().flag_by_id(id) {
            return Ok(Some(flag.clone()));
        }
        let rows = self.query(
            &format!("SELECT id, name FROM {} WHERE id = ?", FLAGS),
            &[id.into()],
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

    fn notify_flags(&mut self, items: &[PimItem], change: &FlagChange, silent: bool) {
        if silent || !change.changed() {
            return;
        }
        self.notify(ChangeNotification::ItemsFlagsChanged {
            item_ids: item_ids(items),
            added: change.added.clone(),
            removed: change.removed.clone(),
            scope: scope(items),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{recorded_store, test_collection};
    use super::super::NewPimItem;
    use super::*;
    use crate::connection::StatementLog;
    use std::sync::{Arc, Mutex};

    fn names(flags: &[Flag]) -> Vec<String> {
        flags.iter().map(|f| f.name.clone()).collect()
    }

    fn statements(log: &StatementLog, prefix: &str) -> usize {
        log.lock()
            .unwrap()
            .iter()
            .filter(|s| s.starts_with(prefix))
            .count()
    }

    fn items(store: &mut DataStore, count: usize) -> Vec<PimItem> {
        let collection = test_collection(store, "Inbox");
        (0..count)
            .map(|i| {
                store
                    .append_pim_item(
                        NewPimItem::new(collection, "message/rfc822").remote_id(&format!("r{}", i)),
                    )
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_set_flags_diff() {
        let (_dir, mut store, log) = recorded_store(4096);
        let items = items(&mut store, 1);
        let old = store.flags_by_names(&["\\Seen", "\\Flagged", "\\Draft"]).unwrap();
        store.set_items_flags(&items, &old, true).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store.subscribe(move |batch: &[ChangeNotification]| {
            sink.lock().unwrap().extend_from_slice(batch);
        });

        let new = store.flags_by_names(&["\\Flagged", "$Urgent"]).unwrap();
        log.lock().unwrap().clear();
        let change = store.set_items_flags(&items, &new, false).unwrap();

        assert_eq!(change.removed, BTreeSet::from(["\\Seen".into(), "\\Draft".into()]));
        assert_eq!(change.added, BTreeSet::from(["$Urgent".to_string()]));
        assert_eq!(statements(&log, "DELETE"), 1);
        assert_eq!(statements(&log, "INSERT"), 1);
        assert_eq!(
            names(&store.item_flags(items[0].id).unwrap()),
            vec!["$Urgent", "\\Flagged"]
        );

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(
            &seen[0],
            ChangeNotification::ItemsFlagsChanged { scope: CollectionScope::Single(_), .. }
        ));
    }

    #[test]
    fn test_set_flags_converges_on_many_items() {
        let (_dir, mut store, log) = recorded_store(4096);
        let items = items(&mut store, 20);
        let first = store.flags_by_names(&["a", "b", "c"]).unwrap();
        store.set_items_flags(&items[..10], &first, true).unwrap();

        let wanted = store.flags_by_names(&["b", "d"]).unwrap();
        log.lock().unwrap().clear();
        store.set_items_flags(&items, &wanted, true).unwrap();
        assert_eq!(statements(&log, "DELETE"), 1);
        assert_eq!(statements(&log, "INSERT"), 1);

        for item in &items {
            assert_eq!(names(&store.item_flags(item.id).unwrap()), vec!["b", "d"]);
        }

        // Setting the same set again is a no-op.
        log.lock().unwrap().clear();
        let change = store.set_items_flags(&items, &wanted, false).unwrap();
        assert!(!change.changed());
        assert_eq!(statements(&log, "DELETE"), 0);
        assert_eq!(statements(&log, "INSERT"), 0);
    }

    #[test]
    fn test_set_flags_on_large_batch() {
        let (_dir, mut store, log) = recorded_store(4096);
        let items = items(&mut store, 600);
        let both = store.flags_by_names(&["a", "b"]).unwrap();
        store.set_items_flags(&items, &both, true).unwrap();
        for item in [&items[0], &items[599]] {
            assert_eq!(names(&store.item_flags(item.id).unwrap()), vec!["a", "b"]);
        }

        log.lock().unwrap().clear();
        let change = store.set_items_flags(&items, &[], true).unwrap();
        assert_eq!(change.removed, BTreeSet::from(["a".to_string(), "b".to_string()]));
        assert!(statements(&log, "DELETE") >= 2);
        for item in &items {
            assert!(store.item_flags(item.id).unwrap().is_empty());
        }

        let removed = store.remove_items_flags(&items, &both, true).unwrap();
        assert!(!removed.changed());
    }

    #[test]
    fn test_repeated_items_are_flagged_once() {
        let (_dir, mut store) = crate::datastore::test_support::store();
        let items = items(&mut store, 1);
        let twice = vec![items[0].clone(), items[0].clone()];
        let seen = store.flags_by_names(&["\\Seen"]).unwrap();

        let change = store.set_items_flags(&twice, &seen, true).unwrap();
        assert_eq!(change.added, BTreeSet::from(["\\Seen".to_string()]));
        assert_eq!(names(&store.item_flags(items[0].id).unwrap()), vec!["\\Seen"]);

        let flagged = store.flags_by_names(&["\\Flagged"]).unwrap();
        store.append_items_flags(&twice, &flagged, false, true).unwrap();
        assert_eq!(store.item_flags(items[0].id).unwrap().len(), 2);
    }

    #[test]
    fn test_append_and_remove_flags() {
        let (_dir, mut store) = crate::datastore::test_support::store();
        let items = items(&mut store, 2);
        let seen = store.flags_by_names(&["\\Seen"]).unwrap();
        store.append_items_flags(&items[..1], &seen, false, true).unwrap();

        let change = store.append_items_flags(&items, &seen, true, true).unwrap();
        assert_eq!(change.added, BTreeSet::from(["\\Seen".to_string()]));
        assert_eq!(store.item_flags(items[1].id).unwrap().len(), 1);

        let again = store.append_items_flags(&items, &seen, true, true).unwrap();
        assert!(!again.changed());

        let removed = store.remove_items_flags(&items, &seen, true).unwrap();
        assert_eq!(removed.removed, BTreeSet::from(["\\Seen".to_string()]));
        assert!(store.item_flags(items[0].id).unwrap().is_empty());
        assert!(!store.remove_items_flags(&items, &seen, true).unwrap().changed());
    }

    #[test]
    fn test_mixed_scope_across_collections() {
        let (_dir, mut store) = crate::datastore::test_support::store();
        let inbox = test_collection(&mut store, "Inbox");
        let sent = test_collection(&mut store, "Sent");
        let a = store.append_pim_item(NewPimItem::new(inbox, "text/plain")).unwrap();
        let b = store.append_pim_item(NewPimItem::new(sent, "text/plain")).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store.subscribe(move |batch: &[ChangeNotification]| {
            sink.lock().unwrap().extend_from_slice(batch);
        });
        let flags = store.flags_by_names(&["\\Seen"]).unwrap();
        store.set_items_flags(&[a, b], &flags, false).unwrap();

        let seen = seen.lock().unwrap();
        assert!(matches!(
            &seen[..],
            [ChangeNotification::ItemsFlagsChanged { scope: CollectionScope::Mixed, .. }]
        ));
    }
}
