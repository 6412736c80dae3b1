use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::types::EntityId;

/// Collection a batch of items belongs to, as far as a notification is
/// concerned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionScope {
    /// No item seen yet.
    #[default]
    Unknown,
    /// Every item seen so far lives in this collection.
    Single(EntityId),
    /// Items span several collections.
    Mixed,
}

impl CollectionScope {
    /// Fold one more item's collection into the scope.
    pub fn absorb(self, collection_id: EntityId) -> Self {
        match self {
            CollectionScope::Unknown => CollectionScope::Single(collection_id),
            CollectionScope::Single(id) if id == collection_id => self,
            CollectionScope::Single(_) | CollectionScope::Mixed => CollectionScope::Mixed,
        }
    }

    pub fn from_items(collection_ids: impl IntoIterator<Item = EntityId>) -> Self {
        collection_ids
            .into_iter()
            .fold(CollectionScope::Unknown, CollectionScope::absorb)
    }

    pub fn collection_id(&self) -> Option<EntityId> {
        match self {
            CollectionScope::Single(id) => Some(*id),
            _ => None,
        }
    }
}

/// Change notifications emitted by the store after data mutation.
///
/// Inside a transaction they are buffered and only delivered to subscribers
/// once the outermost transaction committed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ChangeNotification {
    // =========================================================================
    // Item Events
    // =========================================================================
    ItemAdded {
        item_id: EntityId,
        collection_id: EntityId,
    },

    /// Payload or attribute parts of an item changed.
    ItemChanged {
        item_id: EntityId,
        collection_id: EntityId,
        parts: BTreeSet<String>,
    },

    ItemsFlagsChanged {
        item_ids: Vec<EntityId>,
        added: BTreeSet<String>,
        removed: BTreeSet<String>,
        scope: CollectionScope,
    },

    ItemsTagsChanged {
        item_ids: Vec<EntityId>,
        added: BTreeSet<EntityId>,
        removed: BTreeSet<EntityId>,
        scope: CollectionScope,
    },

    ItemsRemoved {
        item_ids: Vec<EntityId>,
        scope: CollectionScope,
    },

    // =========================================================================
    // Collection Events
    // =========================================================================
    CollectionAdded {
        collection_id: EntityId,
        resource_id: EntityId,
    },

    /// Attributes or properties of a collection changed.
    CollectionChanged {
        collection_id: EntityId,
        changes: BTreeSet<String>,
    },

    CollectionMoved {
        collection_id: EntityId,
        source_parent_id: Option<EntityId>,
        destination_parent_id: Option<EntityId>,
    },

    CollectionRemoved {
        collection_id: EntityId,
        resource_id: EntityId,
    },

    // =========================================================================
    // Tag Events
    // =========================================================================
    TagRemoved {
        tag_id: EntityId,
        /// Resource and remote id pairs the tag was known under.
        remote_ids: Vec<(EntityId, String)>,
    },
}

impl ChangeNotification {
    /// Stable name for logging.
    pub fn event_name(&self) -> &'static str {
        match self {
            ChangeNotification::ItemAdded { .. } => "item_added",
            ChangeNotification::ItemChanged { .. } => "item_changed",
            ChangeNotification::ItemsFlagsChanged { .. } => "items_flags_changed",
            ChangeNotification::ItemsTagsChanged { .. } => "items_tags_changed",
            ChangeNotification::ItemsRemoved { .. } => "items_removed",
            ChangeNotification::CollectionAdded { .. } => "collection_added",
            ChangeNotification::CollectionChanged { .. } => "collection_changed",
            ChangeNotification::CollectionMoved { .. } => "collection_moved",
            ChangeNotification::CollectionRemoved { .. } => "collection_removed",
            ChangeNotification::TagRemoved { .. } => "tag_removed",
        }
    }
}
