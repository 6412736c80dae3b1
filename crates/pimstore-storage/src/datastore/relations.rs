//! Batched access to item relation tables.
//!
//! Statements are split so that none binds more than `MAX_PARAMS` values
//! or ORs together more than `MAX_TERMS` conditions.

use std::collections::{BTreeMap, BTreeSet};

use pimstore_core::error::Result;
use pimstore_core::types::{EntityId, PimItem};

use super::{placeholders, DataStore};
use crate::value::SqlValue;

const MAX_PARAMS: usize = 999;
const MAX_TERMS: usize = 100;

/// An item relation table: `pim_item_id` plus one other id column.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ItemRelation {
    pub table: &'static str,
    pub column: &'static str,
}

pub(crate) type Pair = (EntityId, EntityId);

/// Ids of `items`, sorted and without duplicates.
pub(crate) fn item_ids(items: &[PimItem]) -> Vec<EntityId> {
    items
        .iter()
        .map(|i| i.id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn id_params(ids: &[EntityId]) -> impl Iterator<Item = SqlValue> + '_ {
    ids.iter().map(|id| SqlValue::from(*id))
}

impl ItemRelation {
    /// Related ids per item, for every item in `item_ids`.
    pub fn current(
        &self,
        store: &mut DataStore,
        item_ids: &[EntityId],
    ) -> Result<BTreeMap<EntityId, BTreeSet<EntityId>>> {
        let mut current: BTreeMap<EntityId, BTreeSet<EntityId>> = BTreeMap::new();
        for chunk in item_ids.chunks(MAX_PARAMS) {
            let params: Vec<SqlValue> = id_params(chunk).collect();
            let rows = store.query(
                &format!(
                    "SELECT pim_item_id, {} FROM {} WHERE pim_item_id IN ({})",
                    self.column,
                    self.table,
                    placeholders(chunk.len())
                ),
                &params,
            )?;
            for row in rows {
                current.entry(row.i64(0)?).or_default().insert(row.i64(1)?);
            }
        }
        Ok(current)
    }

    /// Delete the given pairs.
    ///
    /// Pairs are grouped by related id, one `col = ? AND pim_item_id IN (..)`
    /// term per group, so the usual call needs a single statement.
    pub fn delete(&self, store: &mut DataStore, pairs: &[Pair]) -> Result<usize> {
        let mut groups: BTreeMap<EntityId, Vec<EntityId>> = BTreeMap::new();
        for (item, other) in pairs {
            groups.entry(*other).or_default().push(*item);
        }

        let mut terms = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();
        let mut affected = 0;
        for (other, items) in &groups {
            for chunk in items.chunks(MAX_PARAMS - 1) {
                if params.len() + chunk.len() + 1 > MAX_PARAMS || terms.len() == MAX_TERMS {
                    affected += self.delete_terms(store, &terms, &params)?;
                    terms.clear();
                    params.clear();
                }
                terms.push(format!(
                    "({} = ? AND pim_item_id IN ({}))",
                    self.column,
                    placeholders(chunk.len())
                ));
                params.push((*other).into());
                params.extend(id_params(chunk));
            }
        }
        if !terms.is_empty() {
            affected += self.delete_terms(store, &terms, &params)?;
        }
        Ok(affected)
    }

    fn delete_terms(
        &self,
        store: &mut DataStore,
        terms: &[String],
        params: &[SqlValue],
    ) -> Result<usize> {
        store.execute(
            &format!("DELETE FROM {} WHERE {}", self.table, terms.join(" OR ")),
            params,
        )
    }

    /// Delete every pair of the given items and ids.
    pub fn delete_all(
        &self,
        store: &mut DataStore,
        item_ids: &[EntityId],
        ids: &[EntityId],
    ) -> Result<usize> {
        let mut affected = 0;
        for id_chunk in ids.chunks(MAX_PARAMS / 2) {
            for item_chunk in item_ids.chunks(MAX_PARAMS - id_chunk.len()) {
                let params: Vec<SqlValue> =
                    id_params(item_chunk).chain(id_params(id_chunk)).collect();
                affected += store.execute(
                    &format!(
                        "DELETE FROM {} WHERE pim_item_id IN ({}) AND {} IN ({})",
                        self.table,
                        placeholders(item_chunk.len()),
                        self.column,
                        placeholders(id_chunk.len())
                    ),
                    &params,
                )?;
            }
        }
        Ok(affected)
    }

    /// Insert the given pairs, as few multi-row INSERTs as the parameter
    /// limit allows.
    pub fn insert(&self, store: &mut DataStore, pairs: &[Pair]) -> Result<()> {
        for chunk in pairs.chunks(MAX_PARAMS / 2) {
            let values = vec!["(?, ?)"; chunk.len()];
            let params: Vec<SqlValue> = chunk
                .iter()
                .flat_map(|(item, other)| [SqlValue::from(*item), SqlValue::from(*other)])
                .collect();
            store.execute(
                &format!(
                    "INSERT INTO {} (pim_item_id, {}) VALUES {}",
                    self.table,
                    self.column,
                    values.join(", ")
                ),
                &params,
            )?;
        }
        Ok(())
    }
}

/// Split the wanted set against the current one, per item.
///
/// Returns the pairs to delete and the pairs to insert. An item listed
/// more than once is only diffed once.
pub(crate) fn diff(
    item_ids: &[EntityId],
    current: &BTreeMap<EntityId, BTreeSet<EntityId>>,
    wanted: &BTreeSet<EntityId>,
) -> (Vec<Pair>, Vec<Pair>) {
    let empty = BTreeSet::new();
    let mut removed = Vec::new();
    let mut added = Vec::new();
    let unique: BTreeSet<EntityId> = item_ids.iter().copied().collect();
    for item in &unique {
        let have = current.get(item).unwrap_or(&empty);
        removed.extend(have.difference(wanted).map(|id| (*item, *id)));
        added.extend(wanted.difference(have).map(|id| (*item, *id)));
    }
    (removed, added)
}
