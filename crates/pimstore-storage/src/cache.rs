//! Per-store caches of small lookup entities.
//!
//! Flags, mime types, part types and resources are looked up by name on
//! nearly every write. Collections are cached by id. All of it is thrown
//! away when a transaction rolls back, since rows created inside it no
//! longer exist.

use std::collections::HashMap;

use pimstore_core::types::{
    Collection, CollectionStatistics, EntityId, Flag, MimeType, PartType, Resource,
};

#[derive(Debug, Default)]
pub struct EntityCache {
    flags: HashMap<String, Flag>,
    mime_types: HashMap<String, MimeType>,
    part_types: HashMap<String, PartType>,
    resources: HashMap<String, Resource>,
    collections: HashMap<EntityId, Collection>,
    statistics: HashMap<EntityId, CollectionStatistics>,
    generation: u64,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of full invalidations so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn invalidate_all(&mut self) {
        self.flags.clear();
        self.mime_types.clear();
        self.part_types.clear();
        self.resources.clear();
        self.collections.clear();
        self.statistics.clear();
        self.generation += 1;
    }

    pub fn flag(&self, name: &str) -> Option<&Flag> {
        self.flags.get(name)
    }

    pub fn insert_flag(&mut self, flag: Flag) {
        self.flags.insert(flag.name.clone(), flag);
    }

    pub fn flag_by_id(&self, id: EntityId) -> Option<&Flag> {
        self.flags.values().find(|f| f.id == id)
    }

    pub fn mime_type(&self, name: &str) -> Option<&MimeType> {
        self.mime_types.get(name)
    }

    pub fn insert_mime_type(&mut self, mime_type: MimeType) {
        self.mime_types.insert(mime_type.name.clone(), mime_type);
    }

    pub fn part_type(&self, fq_name: &str) -> Option<&PartType> {
        self.part_types.get(fq_name)
    }

    pub fn insert_part_type(&mut self, part_type: PartType) {
        self.part_types.insert(part_type.fq_name(), part_type);
    }

    pub fn part_type_by_id(&self, id: EntityId) -> Option<&PartType> {
        self.part_types.values().find(|p| p.id == id)
    }

    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.resources.get(name)
    }

    pub fn insert_resource(&mut self, resource: Resource) {
        self.resources.insert(resource.name.clone(), resource);
    }

    pub fn collection(&self, id: EntityId) -> Option<&Collection> {
        self.collections.get(&id)
    }

    pub fn insert_collection(&mut self, collection: Collection) {
        self.collections.insert(collection.id, collection);
    }

    pub fn invalidate_collection(&mut self, id: EntityId) {
        self.collections.remove(&id);
        self.statistics.remove(&id);
    }

    pub fn statistics(&self, collection_id: EntityId) -> Option<CollectionStatistics> {
        self.statistics.get(&collection_id).copied()
    }

    pub fn insert_statistics(&mut self, collection_id: EntityId, stats: CollectionStatistics) {
        self.statistics.insert(collection_id, stats);
    }

    pub fn invalidate_statistics(&mut self, collection_id: EntityId) {
        self.statistics.remove(&collection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalidate_all_clears_everything() {
        let mut cache = EntityCache::new();
        cache.insert_flag(Flag {
            id: 1,
            name: "\\Seen".into(),
        });
        cache.insert_part_type(PartType {
            id: 2,
            ns: "PLD".into(),
            name: "RFC822".into(),
        });
        cache.insert_statistics(3, CollectionStatistics { count: 1, size: 10 });

        assert_eq!(cache.flag("\\Seen").map(|f| f.id), Some(1));
        assert_eq!(cache.part_type("PLD:RFC822").map(|p| p.id), Some(2));
        assert_eq!(cache.part_type_by_id(2).map(|p| p.name.as_str()), Some("RFC822"));

        cache.invalidate_all();
        assert!(cache.flag("\\Seen").is_none());
        assert!(cache.part_type("PLD:RFC822").is_none());
        assert!(cache.statistics(3).is_none());
        assert_eq!(cache.generation(), 1);
    }

    #[test]
    fn test_invalidate_collection_drops_statistics() {
        let mut cache = EntityCache::new();
        cache.insert_collection(Collection {
            id: 4,
            ..Collection::new("Inbox", None, 1)
        });
        cache.insert_statistics(4, CollectionStatistics::default());
        cache.invalidate_collection(4);
        assert!(cache.collection(4).is_none());
        assert!(cache.statistics(4).is_none());
    }
}
