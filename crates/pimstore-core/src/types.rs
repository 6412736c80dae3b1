use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::{PimError, Result};

/// Primary key of every entity table.
pub type EntityId = i64;

// =============================================================================
// Enums
// =============================================================================

/// Where the payload of a [`Part`] currently lives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartStorage {
    /// `data` holds the payload bytes.
    #[default]
    Internal,
    /// `data` holds the name of a file in the managed payload directory.
    External,
    /// `data` holds the absolute path of a file owned by someone else.
    Foreign,
}

impl PartStorage {
    /// Integer stored in the `storage` column.
    pub fn as_i64(self) -> i64 {
        match self {
            PartStorage::Internal => 0,
            PartStorage::External => 1,
            PartStorage::Foreign => 2,
        }
    }

    pub fn from_i64(value: i64) -> Result<Self> {
        match value {
            0 => Ok(PartStorage::Internal),
            1 => Ok(PartStorage::External),
            2 => Ok(PartStorage::Foreign),
            other => Err(PimError::Integrity(format!(
                "unknown part storage value {}",
                other
            ))),
        }
    }
}

// =============================================================================
// Entities
// =============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PimItem {
    pub id: EntityId,
    pub rev: i64,
    pub remote_id: String,
    pub remote_revision: String,
    pub gid: String,
    pub collection_id: EntityId,
    pub mime_type_id: EntityId,
    pub datetime: NaiveDateTime,
    pub atime: NaiveDateTime,
    /// Not yet confirmed by the owning resource backend.
    pub dirty: bool,
    pub size: i64,
    pub hidden: bool,
}

/// A payload or attribute blob attached to a [`PimItem`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub id: EntityId,
    pub pim_item_id: EntityId,
    pub part_type_id: EntityId,
    pub data: Vec<u8>,
    pub datasize: i64,
    pub version: i32,
    pub storage: PartStorage,
}

impl Part {
    /// A part that has not been written yet.
    pub fn new(pim_item_id: EntityId, part_type_id: EntityId, data: Vec<u8>) -> Self {
        let datasize = data.len() as i64;
        Self {
            id: 0,
            pim_item_id,
            part_type_id,
            data,
            datasize,
            version: 0,
            storage: PartStorage::Internal,
        }
    }

    /// Whether the part has a row in the database.
    pub fn is_valid(&self) -> bool {
        self.id > 0
    }

    /// File name or path held by an External or Foreign part. A row that
    /// was inserted before its file got written has none yet.
    pub fn file_reference(&self) -> Option<String> {
        match self.storage {
            PartStorage::Internal => None,
            PartStorage::External | PartStorage::Foreign if self.data.is_empty() => None,
            PartStorage::External | PartStorage::Foreign => {
                Some(String::from_utf8_lossy(&self.data).into_owned())
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Flag {
    pub id: EntityId,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub id: EntityId,
    pub gid: String,
    pub parent_id: Option<EntityId>,
    pub type_id: EntityId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagType {
    pub id: EntityId,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: EntityId,
    pub name: String,
    pub is_virtual: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MimeType {
    pub id: EntityId,
    pub name: String,
}

/// Kind of a part, addressed by its fully qualified name `NS:NAME`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartType {
    pub id: EntityId,
    pub ns: String,
    pub name: String,
}

impl PartType {
    pub fn fq_name(&self) -> String {
        format!("{}:{}", self.ns, self.name)
    }

    /// Split `NS:NAME` into its namespace and name.
    pub fn parse_fq_name(fq_name: &str) -> Result<(&str, &str)> {
        match fq_name.split_once(':') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() => Ok((ns, name)),
            _ => Err(PimError::Config(format!(
                "invalid part type name \"{}\"",
                fq_name
            ))),
        }
    }
}

/// Payload parts carry the `PLD` namespace, everything else is an attribute.
pub const PAYLOAD_NAMESPACE: &str = "PLD";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    /// Take the policy from the parent collection.
    pub inherit: bool,
    /// Minutes between syncs, -1 for never.
    pub check_interval: i64,
    /// Minutes payloads stay cached, -1 for forever.
    pub cache_timeout: i64,
    pub sync_on_demand: bool,
    /// Space separated part names always kept locally.
    pub local_parts: String,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            inherit: true,
            check_interval: -1,
            cache_timeout: -1,
            sync_on_demand: false,
            local_parts: "ALL".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub id: EntityId,
    pub remote_id: String,
    pub remote_revision: String,
    pub name: String,
    /// `None` for a resource's top-level collection.
    pub parent_id: Option<EntityId>,
    pub resource_id: EntityId,
    pub enabled: bool,
    pub is_virtual: bool,
    pub cache_policy: CachePolicy,
}

impl Collection {
    pub fn new(name: impl Into<String>, parent_id: Option<EntityId>, resource_id: EntityId) -> Self {
        Self {
            id: 0,
            remote_id: String::new(),
            remote_revision: String::new(),
            name: name.into(),
            parent_id,
            resource_id,
            enabled: true,
            is_virtual: false,
            cache_policy: CachePolicy::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionAttribute {
    pub id: EntityId,
    pub collection_id: EntityId,
    pub attr_type: Vec<u8>,
    pub value: Vec<u8>,
}

/// Aggregated item count and payload size of one collection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStatistics {
    pub count: i64,
    pub size: i64,
}
