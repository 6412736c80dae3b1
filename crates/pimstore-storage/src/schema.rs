//! Static schema description.
//!
//! Every table of the store is described once here. The initializer derives
//! the DDL from it and the migrator walks it to copy a whole database
//! without any per-table code.

use std::sync::OnceLock;

use pimstore_core::config::DbEngine;

use crate::engine::SqlDialect;
use crate::value::ColumnType;

/// Referenced column of a foreign key. Deletes always cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    pub table: &'static str,
    pub column: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescription {
    pub name: &'static str,
    pub column_type: ColumnType,
    pub is_primary_key: bool,
    pub is_auto_increment: bool,
    pub is_nullable: bool,
    pub is_unique: bool,
    pub references: Option<ForeignKey>,
}

impl ColumnDescription {
    fn new(name: &'static str, column_type: ColumnType) -> Self {
        Self {
            name,
            column_type,
            is_primary_key: false,
            is_auto_increment: false,
            is_nullable: false,
            is_unique: false,
            references: None,
        }
    }

    /// Autoincrementing `id` primary key.
    fn id() -> Self {
        Self {
            is_primary_key: true,
            is_auto_increment: true,
            ..Self::new("id", ColumnType::Integer)
        }
    }

    fn nullable(mut self) -> Self {
        self.is_nullable = true;
        self
    }

    fn unique(mut self) -> Self {
        self.is_unique = true;
        self
    }

    fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self
    }

    fn references(mut self, table: &'static str, column: &'static str) -> Self {
        self.references = Some(ForeignKey { table, column });
        self
    }

    fn definition(&self, engine: DbEngine, single_auto_increment: bool) -> String {
        if single_auto_increment && self.is_auto_increment {
            return engine.auto_increment_primary_key(self.name);
        }
        let mut def = format!("{} {}", self.name, engine.column_type(self.column_type));
        if !self.is_nullable {
            def.push_str(" NOT NULL");
        }
        if self.is_unique {
            def.push_str(" UNIQUE");
        }
        def
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescription {
    pub name: &'static str,
    pub columns: Vec<ColumnDescription>,
}

impl TableDescription {
    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name).collect()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescription> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// The autoincrement primary key, if the table has exactly one.
    pub fn auto_increment_column(&self) -> Option<&ColumnDescription> {
        let mut auto = self
            .columns
            .iter()
            .filter(|c| c.is_primary_key && c.is_auto_increment);
        match (auto.next(), auto.next()) {
            (Some(col), None) => Some(col),
            _ => None,
        }
    }

    /// `CREATE TABLE IF NOT EXISTS` statement for `engine`.
    pub fn create_statement(&self, engine: DbEngine) -> String {
        let single_auto = self.auto_increment_column().is_some();
        let mut parts: Vec<String> = self
            .columns
            .iter()
            .map(|c| c.definition(engine, single_auto))
            .collect();

        if !single_auto {
            let keys: Vec<&str> = self
                .columns
                .iter()
                .filter(|c| c.is_primary_key)
                .map(|c| c.name)
                .collect();
            if !keys.is_empty() {
                parts.push(format!("PRIMARY KEY ({})", keys.join(", ")));
            }
        }

        for col in &self.columns {
            if let Some(fk) = col.references {
                let mut clause = format!(
                    "FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE CASCADE",
                    col.name, fk.table, fk.column
                );
                if engine == DbEngine::Postgres {
                    clause.push_str(" DEFERRABLE INITIALLY IMMEDIATE");
                }
                parts.push(clause);
            }
        }

        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.name,
            parts.join(", ")
        )
    }
}

/// Many-to-many junction between two tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationTableDescription {
    pub name: &'static str,
    pub left: ForeignKey,
    pub left_column: &'static str,
    pub right: ForeignKey,
    pub right_column: &'static str,
}

impl RelationTableDescription {
    /// The junction as a plain table with a composite primary key.
    pub fn as_table(&self) -> TableDescription {
        TableDescription {
            name: self.name,
            columns: vec![
                ColumnDescription::new(self.left_column, ColumnType::Integer)
                    .primary_key()
                    .references(self.left.table, self.left.column),
                ColumnDescription::new(self.right_column, ColumnType::Integer)
                    .primary_key()
                    .references(self.right.table, self.right.column),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    /// Regular tables, parents before children.
    pub tables: Vec<TableDescription>,
    pub relations: Vec<RelationTableDescription>,
}

impl Schema {
    pub fn table(&self, name: &str) -> Option<&TableDescription> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Regular tables followed by relation tables, in copy order.
    pub fn all_tables(&self) -> Vec<TableDescription> {
        self.tables
            .iter()
            .cloned()
            .chain(self.relations.iter().map(RelationTableDescription::as_table))
            .collect()
    }
}

pub const RESOURCES: &str = "resources";
pub const COLLECTIONS: &str = "collections";
pub const MIME_TYPES: &str = "mime_types";
pub const PIM_ITEMS: &str = "pim_items";
pub const FLAGS: &str = "flags";
pub const PART_TYPES: &str = "part_types";
pub const PARTS: &str = "parts";
pub const COLLECTION_ATTRIBUTES: &str = "collection_attributes";
pub const TAG_TYPES: &str = "tag_types";
pub const TAGS: &str = "tags";
pub const TAG_REMOTE_IDS: &str = "tag_remote_id_resource_relations";
pub const PIM_ITEM_FLAGS: &str = "pim_item_flag_relation";
pub const PIM_ITEM_TAGS: &str = "pim_item_tag_relation";
pub const COLLECTION_MIME_TYPES: &str = "collection_mime_type_relation";
pub const COLLECTION_PIM_ITEMS: &str = "collection_pim_item_relation";

/// The store's schema.
pub fn schema() -> &'static Schema {
    static SCHEMA: OnceLock<Schema> = OnceLock::new();
    SCHEMA.get_or_init(build_schema)
}

fn build_schema() -> Schema {
    use ColumnDescription as C;
    use ColumnType::*;

    let tables = vec![
        TableDescription {
            name: RESOURCES,
            columns: vec![
                C::id(),
                C::new("name", Text).unique(),
                C::new("is_virtual", Bool),
            ],
        },
        TableDescription {
            name: COLLECTIONS,
            columns: vec![
                C::id(),
                C::new("remote_id", Text).nullable(),
                C::new("remote_revision", Text).nullable(),
                C::new("name", Text),
                C::new("parent_id", Integer)
                    .nullable()
                    .references(COLLECTIONS, "id"),
                C::new("resource_id", Integer).references(RESOURCES, "id"),
                C::new("enabled", Bool),
                C::new("is_virtual", Bool),
                C::new("cache_policy_inherit", Bool),
                C::new("cache_policy_check_interval", Integer),
                C::new("cache_policy_cache_timeout", Integer),
                C::new("cache_policy_sync_on_demand", Bool),
                C::new("cache_policy_local_parts", Text),
            ],
        },
        TableDescription {
            name: MIME_TYPES,
            columns: vec![C::id(), C::new("name", Text).unique()],
        },
        TableDescription {
            name: PIM_ITEMS,
            columns: vec![
                C::id(),
                C::new("rev", Integer),
                C::new("remote_id", Text).nullable(),
                C::new("remote_revision", Text).nullable(),
                C::new("gid", Text).nullable(),
                C::new("collection_id", Integer).references(COLLECTIONS, "id"),
                C::new("mime_type_id", Integer).references(MIME_TYPES, "id"),
                C::new("datetime", Timestamp),
                C::new("atime", Timestamp),
                C::new("dirty", Bool),
                C::new("size", Integer),
                C::new("hidden", Bool),
            ],
        },
        TableDescription {
            name: FLAGS,
            columns: vec![C::id(), C::new("name", Text).unique()],
        },
        TableDescription {
            name: PART_TYPES,
            columns: vec![C::id(), C::new("ns", Text), C::new("name", Text)],
        },
        TableDescription {
            name: PARTS,
            columns: vec![
                C::id(),
                C::new("pim_item_id", Integer).references(PIM_ITEMS, "id"),
                C::new("part_type_id", Integer).references(PART_TYPES, "id"),
                C::new("data", Blob).nullable(),
                C::new("datasize", Integer),
                C::new("version", Integer),
                C::new("storage", Integer),
            ],
        },
        TableDescription {
            name: COLLECTION_ATTRIBUTES,
            columns: vec![
                C::id(),
                C::new("collection_id", Integer).references(COLLECTIONS, "id"),
                C::new("attr_type", Blob),
                C::new("value", Blob).nullable(),
            ],
        },
        TableDescription {
            name: TAG_TYPES,
            columns: vec![C::id(), C::new("name", Text).unique()],
        },
        TableDescription {
            name: TAGS,
            columns: vec![
                C::id(),
                C::new("gid", Text),
                C::new("parent_id", Integer).nullable().references(TAGS, "id"),
                C::new("type_id", Integer).references(TAG_TYPES, "id"),
            ],
        },
        TableDescription {
            name: TAG_REMOTE_IDS,
            columns: vec![
                C::new("tag_id", Integer)
                    .primary_key()
                    .references(TAGS, "id"),
                C::new("resource_id", Integer)
                    .primary_key()
                    .references(RESOURCES, "id"),
                C::new("remote_id", Text),
            ],
        },
    ];

    let relation = |name, left_table, left_column, right_table, right_column| {
        RelationTableDescription {
            name,
            left: ForeignKey {
                table: left_table,
                column: "id",
            },
            left_column,
            right: ForeignKey {
                table: right_table,
                column: "id",
            },
            right_column,
        }
    };

    let relations = vec![
        relation(PIM_ITEM_FLAGS, PIM_ITEMS, "pim_item_id", FLAGS, "flag_id"),
        relation(PIM_ITEM_TAGS, PIM_ITEMS, "pim_item_id", TAGS, "tag_id"),
        relation(
            COLLECTION_MIME_TYPES,
            COLLECTIONS,
            "collection_id",
            MIME_TYPES,
            "mime_type_id",
        ),
        relation(
            COLLECTION_PIM_ITEMS,
            COLLECTIONS,
            "collection_id",
            PIM_ITEMS,
            "pim_item_id",
        ),
    ];

    Schema { tables, relations }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_complete() {
        let schema = schema();
        assert_eq!(schema.tables.len(), 11);
        assert_eq!(schema.relations.len(), 4);
        assert_eq!(schema.all_tables().len(), 15);
        assert!(schema.table(PARTS).is_some());
        assert!(schema.table("nope").is_none());
    }

    #[test]
    fn test_auto_increment_column() {
        let schema = schema();
        let parts = schema.table(PARTS).unwrap();
        assert_eq!(parts.auto_increment_column().unwrap().name, "id");

        let remote_ids = schema.table(TAG_REMOTE_IDS).unwrap();
        assert!(remote_ids.auto_increment_column().is_none());

        let relation = schema.relations[0].as_table();
        assert!(relation.auto_increment_column().is_none());
        assert_eq!(relation.column_names(), vec!["pim_item_id", "flag_id"]);
    }

    #[test]
    fn test_sqlite_create_statement() {
        let flags = schema().table(FLAGS).unwrap();
        assert_eq!(
            flags.create_statement(DbEngine::Sqlite),
            "CREATE TABLE IF NOT EXISTS flags (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL UNIQUE)"
        );
    }

    #[test]
    fn test_relation_create_statement() {
        let sql = schema().relations[0]
            .as_table()
            .create_statement(DbEngine::Postgres);
        assert!(sql.contains("PRIMARY KEY (pim_item_id, flag_id)"));
        assert!(sql.contains(
            "FOREIGN KEY (flag_id) REFERENCES flags (id) ON DELETE CASCADE DEFERRABLE INITIALLY IMMEDIATE"
        ));
    }

    #[test]
    fn test_parents_precede_children() {
        let schema = schema();
        for (idx, table) in schema.tables.iter().enumerate() {
            for col in &table.columns {
                if let Some(fk) = col.references {
                    let parent = schema
                        .tables
                        .iter()
                        .position(|t| t.name == fk.table)
                        .unwrap();
                    assert!(parent <= idx, "{} references later table {}", table.name, fk.table);
                }
            }
        }
    }
}
