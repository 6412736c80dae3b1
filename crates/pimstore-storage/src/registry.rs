//! Process-wide registry of open stores.
//!
//! Each [`DataStore`](crate::DataStore) registers itself on open and removes
//! itself on close. Lookups vastly outnumber registrations, hence the
//! reader/writer lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{OnceLock, RwLock};
use std::thread::ThreadId;

use chrono::{DateTime, Utc};

use pimstore_core::config::DbEngine;

/// Unique id of a store within this process.
pub type StoreId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub engine: DbEngine,
    pub thread: ThreadId,
    pub thread_name: Option<String>,
    pub opened_at: DateTime<Utc>,
}

impl ConnectionInfo {
    /// Info for a connection opened on the current thread.
    pub fn current(engine: DbEngine) -> Self {
        let thread = std::thread::current();
        Self {
            engine,
            thread: thread.id(),
            thread_name: thread.name().map(str::to_string),
            opened_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<StoreId, ConnectionInfo>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every store of this process.
    pub fn global() -> &'static ConnectionRegistry {
        static REGISTRY: OnceLock<ConnectionRegistry> = OnceLock::new();
        REGISTRY.get_or_init(ConnectionRegistry::new)
    }

    pub fn register(&self, info: ConnectionInfo) -> StoreId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        if let Ok(mut map) = self.connections.write() {
            map.insert(id, info);
        }
        id
    }

    pub fn unregister(&self, id: StoreId) {
        if let Ok(mut map) = self.connections.write() {
            map.remove(&id);
        }
    }

    pub fn lookup(&self, id: StoreId) -> Option<ConnectionInfo> {
        self.connections.read().ok()?.get(&id).cloned()
    }

    /// Stores opened on `thread`.
    pub fn stores_on_thread(&self, thread: ThreadId) -> Vec<StoreId> {
        self.connections
            .read()
            .map(|map| {
                map.iter()
                    .filter(|(_, info)| info.thread == thread)
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.connections.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_lookup_unregister() {
        let registry = ConnectionRegistry::new();
        let id = registry.register(ConnectionInfo::current(DbEngine::Sqlite));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(id).unwrap().engine, DbEngine::Sqlite);
        assert_eq!(
            registry.stores_on_thread(std::thread::current().id()),
            vec![id]
        );

        registry.unregister(id);
        assert!(registry.is_empty());
        assert!(registry.lookup(id).is_none());
    }

    #[test]
    fn test_ids_are_unique_across_threads() {
        let registry = std::sync::Arc::new(ConnectionRegistry::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = std::sync::Arc::clone(&registry);
                std::thread::spawn(move || registry.register(ConnectionInfo::current(DbEngine::Sqlite)))
            })
            .collect();
        let mut ids: Vec<StoreId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);
        assert_eq!(registry.len(), 4);
    }
}
