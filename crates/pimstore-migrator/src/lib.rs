//! pimstore migrator crate - moves a store between database engines.
//!
//! The [`DbMigrator`] copies every table of a running installation into a
//! freshly created database of another engine, then swaps it into place.
//! Every step that changes the filesystem registers an undo action, so an
//! interrupted migration leaves the original database and configuration
//! exactly as they were.

pub mod copy;
pub mod dbconfig;
pub mod events;
pub mod janitor;
pub mod migrator;
pub mod rollback;
pub mod service;
pub mod ui;

pub use copy::{copy_table, migrate_tables, MAX_TRANSACTION_SIZE};
pub use dbconfig::{DbConfig, DbConfigFactory, DefaultDbConfigFactory, SqliteDbConfig};
pub use events::{MigrationEvent, QuestionKind, Reporter};
pub use janitor::{BasicJanitor, JanitorReport, StorageJanitor};
pub use migrator::DbMigrator;
pub use rollback::Rollback;
pub use service::{LockFileService, ServiceControl};
pub use ui::{FixedAnswer, UiAnswer, UiDelegate};
