//! pimstore storage crate - transactional data store and payload storage.
//!
//! Provides the [`DataStore`] with nested transactions, change
//! notification batching and the item/collection/flag/tag operations,
//! plus the hybrid part store that keeps small payloads inline and large
//! ones in external files. SQLite and PostgreSQL sessions are built in.

pub mod cache;
pub mod connection;
pub mod datastore;
pub mod engine;
pub mod initializer;
pub mod notification;
pub mod parts;
pub mod pg;
pub mod registry;
pub mod schema;
pub mod transaction;
pub mod value;

pub use connection::{DbConnection, InstrumentedConnection, SqliteConnection, StatementLog};
pub use datastore::{
    DataStore, DataStoreFactory, FlagChange, NewPimItem, SqliteStoreFactory, StoreSettings,
    TagChange, HIDDEN_ATTRIBUTE,
};
pub use engine::SqlDialect;
pub use notification::{ChannelSubscriber, NotificationCollector, NotificationSubscriber};
pub use parts::{
    ExternalPartStorage, PartColumn, PartHelper, PartMetaData, PartStreamer, StreamOutcome,
    StreamPeer,
};
pub use pg::PostgresConnection;
pub use registry::{ConnectionInfo, ConnectionRegistry, StoreId};
pub use schema::{schema, ColumnDescription, RelationTableDescription, Schema, TableDescription};
pub use transaction::Transaction;
pub use value::{ColumnType, SqlRow, SqlValue};
