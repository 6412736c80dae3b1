//! Scoped transactions.

use std::ops::{Deref, DerefMut};

use tracing::warn;

use pimstore_core::error::Result;

use crate::datastore::DataStore;

/// Begins a transaction on construction and rolls it back when dropped
/// without [`Transaction::commit`].
///
/// ```ignore
/// let mut tx = store.transaction("append item")?;
/// tx.flag_by_name_or_create("\\Seen")?;
/// tx.commit()?;
/// ```
pub struct Transaction<'a> {
    store: &'a mut DataStore,
    name: String,
    done: bool,
}

impl<'a> Transaction<'a> {
    pub fn new(store: &'a mut DataStore, name: &str) -> Result<Self> {
        store.begin_transaction(name)?;
        Ok(Self {
            store,
            name: name.to_string(),
            done: false,
        })
    }

    pub fn commit(mut self) -> Result<()> {
        self.done = true;
        self.store.commit_transaction()
    }

    pub fn rollback(mut self) -> Result<()> {
        self.done = true;
        self.store.rollback_transaction()
    }
}

impl Deref for Transaction<'_> {
    type Target = DataStore;

    fn deref(&self) -> &DataStore {
        self.store
    }
}

impl DerefMut for Transaction<'_> {
    fn deref_mut(&mut self) -> &mut DataStore {
        self.store
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.done || !self.store.in_transaction() {
            return;
        }
        warn!(name = %self.name, "Transaction dropped without commit, rolling back");
        if let Err(e) = self.store.rollback_transaction() {
            warn!(name = %self.name, error = %e, "Rollback of dropped transaction failed");
        }
    }
}
