//! Item tags.

use std::collections::BTreeSet;

use tracing::debug;

use pimstore_core::error::Result;
use pimstore_core::events::{ChangeNotification, CollectionScope};
use pimstore_core::types::{EntityId, PimItem, Tag};

use super::entities::{item_from_row, ITEM_COLUMNS};
use super::relations::{diff, item_ids, ItemRelation};
use super::{placeholders, DataStore};
use crate::schema::{PIM_ITEMS, PIM_ITEM_TAGS, TAGS, TAG_REMOTE_IDS};
use crate::value::SqlValue;

const RELATION: ItemRelation = ItemRelation {
    table: PIM_ITEM_TAGS,
    column: "tag_id",
};

/// Tag ids added to or removed from at least one item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagChange {
    pub added: BTreeSet<EntityId>,
    pub removed: BTreeSet<EntityId>,
}

impl TagChange {
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

impl DataStore {
    /// Make `tags` the exact tag set of every item.
    pub fn set_items_tags(
        &mut self,
        items: &[PimItem],
        tags: &[Tag],
        silent: bool,
    ) -> Result<TagChange> {
        let ids = item_ids(items);
        let current = RELATION.current(self, &ids)?;
        let wanted: BTreeSet<EntityId> = tags.iter().map(|t| t.id).collect();
        let (to_remove, to_add) = diff(&ids, &current, &wanted);

        let change = TagChange {
            added: to_add.iter().map(|(_, t)| *t).collect(),
            removed: to_remove.iter().map(|(_, t)| *t).collect(),
        };
        RELATION.delete(self, &to_remove)?;
        RELATION.insert(self, &to_add)?;

        debug!(
            items = ids.len(),
            added = to_add.len(),
            removed = to_remove.len(),
            "Item tags set"
        );
        self.notify_tags(items, &change, silent);
        Ok(change)
    }

    pub fn append_items_tags(
        &mut self,
        items: &[PimItem],
        tags: &[Tag],
        check_if_exists: bool,
        silent: bool,
    ) -> Result<TagChange> {
        let ids = item_ids(items);
        let wanted: BTreeSet<EntityId> = tags.iter().map(|t| t.id).collect();
        let to_add = if check_if_exists {
            let current = RELATION.current(self, &ids)?;
            diff(&ids, &current, &wanted).1
        } else {
            ids.iter()
                .flat_map(|item| wanted.iter().map(move |tag| (*item, *tag)))
                .collect()
        };

        let change = TagChange {
            added: to_add.iter().map(|(_, t)| *t).collect(),
            removed: BTreeSet::new(),
        };
        RELATION.insert(self, &to_add)?;
        self.notify_tags(items, &change, silent);
        Ok(change)
    }

    pub fn remove_items_tags(
        &mut self,
        items: &[PimItem],
        tags: &[Tag],
        silent: bool,
    ) -> Result<TagChange> {
        let ids = item_ids(items);
        let tag_ids: Vec<EntityId> = tags.iter().map(|t| t.id).collect();
        let affected = RELATION.delete_all(self, &ids, &tag_ids)?;

        let mut change = TagChange::default();
        if affected > 0 {
            change.removed = tag_ids.into_iter().collect();
        }
        self.notify_tags(items, &change, silent);
        Ok(change)
    }

    /// Delete tags. Items carrying them are told about the removal first,
    /// then every tag is announced together with the remote ids it had.
    pub fn remove_tags(&mut self, tags: &[Tag], silent: bool) -> Result<()> {
        if tags.is_empty() {
            return Ok(());
        }
        let tag_ids: Vec<EntityId> = tags.iter().map(|t| t.id).collect();
        let params: Vec<SqlValue> = tag_ids.iter().map(|id| (*id).into()).collect();

        let tagged = self.query(
            &format!(
                "SELECT DISTINCT {} FROM {} WHERE id IN (SELECT pim_item_id FROM {} WHERE tag_id IN ({})) \
                 ORDER BY id",
                ITEM_COLUMNS,
                PIM_ITEMS,
                PIM_ITEM_TAGS,
                placeholders(tag_ids.len())
            ),
            &params,
        )?;
        let items = tagged
            .iter()
            .map(item_from_row)
            .collect::<Result<Vec<_>>>()?;

        let mut removed = Vec::with_capacity(tags.len());
        for tag in tags {
            let rows = self.query(
                &format!(
                    "SELECT resource_id, remote_id FROM {} WHERE tag_id = ? ORDER BY resource_id",
                    TAG_REMOTE_IDS
                ),
                &[tag.id.into()],
            )?;
            let remote_ids = rows
                .iter()
                .map(|row| Ok((row.i64(0)?, row.string(1)?)))
                .collect::<Result<Vec<_>>>()?;
            removed.push((tag.id, remote_ids));
        }

        self.execute(
            &format!("DELETE FROM {} WHERE id IN ({})", TAGS, placeholders(tag_ids.len())),
            &params,
        )?;
        debug!(tags = tag_ids.len(), items = items.len(), "Tags removed");

        if silent {
            return Ok(());
        }
        if !items.is_empty() {
            self.notify_tags(
                &items,
                &TagChange {
                    added: BTreeSet::new(),
                    removed: tag_ids.into_iter().collect(),
                },
                false,
            );
        }
        for (tag_id, remote_ids) in removed {
            self.notify(ChangeNotification::TagRemoved { tag_id, remote_ids });
        }
        Ok(())
    }

    /// Remember under which remote id a resource knows a tag.
    pub fn set_tag_remote_id(
        &mut self,
        tag_id: EntityId,
        resource_id: EntityId,
        remote_id: &str,
    ) -> Result<()> {
        self.execute(
            &format!(
                "DELETE FROM {} WHERE tag_id = ? AND resource_id = ?",
                TAG_REMOTE_IDS
            ),
            &[tag_id.into(), resource_id.into()],
        )?;
        self.execute(
            &format!(
                "INSERT INTO {} (tag_id, resource_id, remote_id) VALUES (?, ?, ?)",
                TAG_REMOTE_IDS
            ),
            &[tag_id.into(), resource_id.into(), remote_id.into()],
        )?;
        Ok(())
    }

    pub fn item_tags(&mut self, item_id: EntityId) -> Result<Vec<Tag>> {
        let rows = self.query(
            &format!(
                "SELECT t.id, t.gid, t.parent_id, t.type_id FROM {} t JOIN {} r ON r.tag_id = t.id \
                 WHERE r.pim_item_id = ? ORDER BY t.id",
                TAGS, PIM_ITEM_TAGS
            ),
            &[item_id.into()],
        )?;
        rows.iter()
            .map(|row| {
                Ok(Tag {
                    id: row.i64(0)?,
                    gid: row.string(1)?,
                    parent_id: row.opt_i64(2)?,
                    type_id: row.i64(3)?,
                })
            })
            .collect()
    }

    fn notify_tags(&mut self, items: &[PimItem], change: &TagChange, silent: bool) {
        if silent || !change.changed() {
            return;
        }
        self.notify(ChangeNotification::ItemsTagsChanged {
            item_ids: item_ids(items),
            added: change.added.clone(),
            removed: change.removed.clone(),
            scope: CollectionScope::from_items(items.iter().map(|i| i.collection_id)),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{store, test_collection};
    use super::super::NewPimItem;
    use super::*;
    use std::sync::{Arc, Mutex};

    fn ids(tags: &[Tag]) -> Vec<EntityId> {
        tags.iter().map(|t| t.id).collect()
    }

    #[test]
    fn test_set_and_append_tags() {
        let (_dir, mut store) = store();
        let inbox = test_collection(&mut store, "Inbox");
        let items: Vec<PimItem> = (0..3)
            .map(|_| store.append_pim_item(NewPimItem::new(inbox, "text/plain")).unwrap())
            .collect();
        let work = store.append_tag("work", "PLAIN", None).unwrap();
        let home = store.append_tag("home", "PLAIN", None).unwrap();

        let change = store.set_items_tags(&items, &[work.clone()], true).unwrap();
        assert_eq!(change.added, BTreeSet::from([work.id]));

        let change = store.set_items_tags(&items[..1], &[home.clone()], true).unwrap();
        assert_eq!(change.added, BTreeSet::from([home.id]));
        assert_eq!(change.removed, BTreeSet::from([work.id]));
        assert_eq!(ids(&store.item_tags(items[0].id).unwrap()), vec![home.id]);
        assert_eq!(ids(&store.item_tags(items[1].id).unwrap()), vec![work.id]);

        let change = store
            .append_items_tags(&items, &[home.clone()], true, true)
            .unwrap();
        assert_eq!(change.added, BTreeSet::from([home.id]));
        assert_eq!(
            ids(&store.item_tags(items[2].id).unwrap()),
            vec![work.id, home.id]
        );

        let change = store.remove_items_tags(&items, &[work], true).unwrap();
        assert!(change.changed());
        assert_eq!(ids(&store.item_tags(items[1].id).unwrap()), vec![home.id]);
    }

    #[test]
    fn test_repeated_items_are_tagged_once() {
        let (_dir, mut store) = store();
        let inbox = test_collection(&mut store, "Inbox");
        let item = store.append_pim_item(NewPimItem::new(inbox, "text/plain")).unwrap();
        let work = store.append_tag("work", "PLAIN", None).unwrap();
        let twice = vec![item.clone(), item.clone()];

        let change = store.set_items_tags(&twice, &[work.clone()], true).unwrap();
        assert_eq!(change.added, BTreeSet::from([work.id]));
        let home = store.append_tag("home", "PLAIN", None).unwrap();
        store.append_items_tags(&twice, &[home.clone()], false, true).unwrap();
        assert_eq!(ids(&store.item_tags(item.id).unwrap()), vec![work.id, home.id]);
    }

    #[test]
    fn test_remove_tags_reports_remote_ids() {
        let (_dir, mut store) = store();
        let inbox = test_collection(&mut store, "Inbox");
        let item = store
            .append_pim_item(NewPimItem::new(inbox, "text/plain"))
            .unwrap();
        let tag = store.append_tag("urgent", "PLAIN", None).unwrap();
        let resource = store.resource_by_name_or_create("imap_1").unwrap();
        store.set_tag_remote_id(tag.id, resource.id, "urgent-rid").unwrap();
        store.append_items_tags(&[item.clone()], &[tag.clone()], false, true).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store.subscribe(move |batch: &[ChangeNotification]| {
            sink.lock().unwrap().extend_from_slice(batch);
        });

        store.remove_tags(&[tag.clone()], false).unwrap();
        assert!(store.tag(tag.id).unwrap().is_none());
        assert!(store.item_tags(item.id).unwrap().is_empty());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(matches!(&seen[0], ChangeNotification::ItemsTagsChanged { .. }));
        assert_eq!(
            seen[1],
            ChangeNotification::TagRemoved {
                tag_id: tag.id,
                remote_ids: vec![(resource.id, "urgent-rid".to_string())],
            }
        );
    }
}
