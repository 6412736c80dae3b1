//! The migration worker.
//!
//! A migration stops the service, takes the migration lock, copies every
//! table into a new database built in `db_migration`, parks the old
//! database in `migration_backup` and moves the new one into its place.
//! The server configuration is rewritten last, through a `.new` shadow
//! file, after the previous one was copied to `.bkp`. A database on an
//! external server has no files to park or move; only its rows are copied.
//!
//! Each step that touches the filesystem registers its undo action on a
//! [`Rollback`]. Any failure unwinds them in reverse order, which restores
//! the original database and configuration and discards the new database.

use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use pimstore_core::config::{DbEngine, ServerConfig};
use pimstore_core::error::{PimError, Result};
use pimstore_core::paths::StoragePaths;
use pimstore_storage::StoreSettings;

use crate::copy::{migrate_tables, MAX_TRANSACTION_SIZE};
use crate::dbconfig::{DbConfig, DbConfigFactory, DefaultDbConfigFactory};
use crate::events::{QuestionKind, Reporter};
use crate::janitor::{BasicJanitor, StorageJanitor};
use crate::rollback::Rollback;
use crate::service::{LockFileService, ServiceControl};
use crate::ui::UiAnswer;

/// How long the service gets to shut down before the migration gives up.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const NO_BACKUP_MESSAGE: &str = "Cannot proceed without backup. Migration interrupted.";

pub struct DbMigrator {
    target: String,
    paths: StoragePaths,
    factory: Box<dyn DbConfigFactory>,
    service: Box<dyn ServiceControl>,
    janitor: Box<dyn StorageJanitor>,
    reporter: Reporter,
    batch_size: usize,
}

impl DbMigrator {
    /// Migrator to the engine named `target`. The name is validated when
    /// the migration runs, so a bad name is reported like any other error.
    pub fn new(target: impl Into<String>, paths: StoragePaths, reporter: Reporter) -> Self {
        Self {
            target: target.into(),
            factory: Box::new(DefaultDbConfigFactory::new(paths.clone())),
            service: Box::new(LockFileService::new(paths.data_dir())),
            janitor: Box::new(BasicJanitor::new()),
            paths,
            reporter,
            batch_size: MAX_TRANSACTION_SIZE,
        }
    }

    pub fn with_factory(mut self, factory: impl DbConfigFactory + 'static) -> Self {
        self.factory = Box::new(factory);
        self
    }

    pub fn with_service(mut self, service: impl ServiceControl + 'static) -> Self {
        self.service = Box::new(service);
        self
    }

    pub fn with_janitor(mut self, janitor: impl StorageJanitor + 'static) -> Self {
        self.janitor = Box::new(janitor);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Run the migration on a dedicated thread. The thread's result is the
    /// same value the `Completed` event carries.
    pub fn start(self) -> Result<JoinHandle<bool>> {
        let mut migrator = self;
        let handle = std::thread::Builder::new()
            .name("pimstore-migrator".into())
            .spawn(move || migrator.run())?;
        Ok(handle)
    }

    /// Run the whole migration on the calling thread.
    pub fn run(&mut self) -> bool {
        let mut restart = false;
        if self.service.is_running() {
            self.reporter.info("Stopping pimstore service...");
            if let Err(e) = self.service.stop(SHUTDOWN_TIMEOUT) {
                warn!(error = %e, "Service did not stop");
                self.reporter
                    .error("Error: timeout while waiting for pimstore to stop.");
                self.reporter.completed(false);
                return false;
            }
            restart = true;
        }

        let result = match self.service.acquire_lock() {
            Ok(()) => {
                let result = match self.migrate() {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(error = %e, "Migration failed");
                        false
                    }
                };
                self.service.release_lock();
                result
            }
            Err(e) => {
                self.reporter
                    .error(format!("Error: couldn't acquire the pimstore lock: {}", e));
                false
            }
        };

        if restart {
            self.reporter.info("Starting pimstore service...");
            if let Err(e) = self.service.start() {
                self.reporter
                    .error(format!("Error: failed to start pimstore service: {}", e));
            }
        }

        self.reporter.completed(result);
        result
    }

    /// Report `message` and turn it into an error of the given kind.
    fn fail(&self, kind: fn(String) -> PimError, message: impl Into<String>) -> PimError {
        let message = message.into();
        self.reporter.error(message.clone());
        kind(message)
    }

    fn migrate(&mut self) -> Result<()> {
        let target = self.target.parse::<DbEngine>().map_err(|e| match e {
            PimError::Config(message) => self.fail(PimError::Config, message),
            other => other,
        })?;

        let mut rollback = Rollback::new();

        let config_file = self.paths.server_config_file();
        let backup_file = with_suffix(&config_file, "bkp");
        let new_file = with_suffix(&config_file, "new");
        self.backup_config(&config_file, &backup_file, &mut rollback)?;

        let source_config = ServerConfig::load(&config_file).map_err(|e| {
            warn!(error = %e, "Cannot load server configuration");
            self.fail(
                PimError::Config,
                "Error: failed to configure source database server.",
            )
        })?;
        let mut source_db = self.factory.create(&source_config, None).map_err(|e| {
            warn!(error = %e, "Cannot configure source database");
            self.fail(
                PimError::Config,
                "Error: failed to configure source database server.",
            )
        })?;
        if source_db.engine() == target {
            return Err(self.fail(
                PimError::Config,
                "Source and destination database engines are the same.",
            ));
        }

        let mut new_config = source_config.clone();
        new_config.general.driver = target;
        new_config.save(&new_file).map_err(|e| {
            self.fail(
                PimError::Config,
                format!(
                    "Error: failed to create new server configuration {}: {}",
                    new_file.display(),
                    e
                ),
            )
        })?;
        {
            let new_file = new_file.clone();
            rollback.add(move || {
                if let Err(e) = std::fs::remove_file(&new_file) {
                    warn!(file = %new_file.display(), error = %e, "Cannot remove new configuration");
                }
            });
        }

        let source_path = source_db.database_path();
        if source_db.has_local_data() && !source_path.exists() {
            return Err(self.fail(
                PimError::Config,
                "Error: failed to obtain path to source database data file or directory.",
            ));
        }

        let migration_dir = self.paths.migration_dir();
        let dest_path = StoragePaths::database_location(&migration_dir, target);
        let mut dest_db = self
            .factory
            .create(&new_config, Some(dest_path.as_path()))
            .map_err(|e| {
                warn!(error = %e, "Cannot configure destination database");
                self.fail(
                    PimError::Config,
                    "Error: failed to configure the new database server.",
                )
            })?;

        if migration_dir.exists() {
            warn!(dir = %migration_dir.display(), "Removing leftovers of an earlier migration");
            remove_path(&migration_dir)?;
        }
        {
            let migration_dir = migration_dir.clone();
            let reporter = self.reporter.clone();
            rollback.add(move || {
                if !migration_dir.exists() {
                    return;
                }
                if let Err(e) = remove_path(&migration_dir) {
                    reporter.error(format!(
                        "Error: failed to remove temporary database directory {}: {}",
                        migration_dir.display(),
                        e
                    ));
                }
            });
        }

        let copied = self.copy_databases(
            source_db.as_mut(),
            &source_config,
            dest_db.as_mut(),
            &new_config,
        );
        source_db.stop_internal_server();
        dest_db.stop_internal_server();
        copied?;

        if source_db.has_local_data() {
            self.reporter.info("Backing up original database...");
            if let Some(backup) = self.move_database_to_backup_location(&source_path)? {
                let original = source_path.clone();
                let reporter = self.reporter.clone();
                rollback.add(move || restore_database(&backup, &original, &reporter));
            }
        } else {
            info!(engine = %source_db.engine(), "Source database stays on its server");
        }

        if dest_db.has_local_data() {
            let main_path = self.paths.default_database_path(target);
            std::fs::rename(&dest_path, &main_path).map_err(|e| {
                self.fail(
                    io_error,
                    format!(
                        "Error: failed to move migrated database to the primary location: {}",
                        e
                    ),
                )
            })?;
            {
                let main_path = main_path.clone();
                let reporter = self.reporter.clone();
                rollback.add(move || {
                    if main_path.exists() {
                        if let Err(e) = remove_path(&main_path) {
                            reporter.error(format!(
                                "Error: failed to remove migrated database {}: {}",
                                main_path.display(),
                                e
                            ));
                        }
                    }
                });
            }
            dest_db.set_database_path(&main_path, &mut new_config);
        }

        new_config.save(&new_file).map_err(|e| {
            self.fail(
                PimError::Config,
                format!("Error: failed to update new server configuration: {}", e),
            )
        })?;
        if let Err(e) = remove_path(&migration_dir) {
            debug!(error = %e, "Cannot remove migration directory");
        }

        std::fs::rename(&new_file, &config_file).map_err(|e| {
            self.fail(
                io_error,
                format!(
                    "Error: failed to move new server configuration to the primary location: {}",
                    e
                ),
            )
        })?;

        rollback.reset();
        self.reporter.info(format!(
            "Migration to {} finished successfully",
            target
        ));
        Ok(())
    }

    /// Copy the server configuration to `<config>.bkp`. Undoing this
    /// restores the configuration from the copy and removes the copy.
    fn backup_config(
        &self,
        config_file: &Path,
        backup_file: &Path,
        rollback: &mut Rollback,
    ) -> Result<()> {
        if backup_file.exists() {
            let answer = self.reporter.ask(
                &format!(
                    "Backup file {} already exists. Overwrite?",
                    backup_file.display()
                ),
                QuestionKind::YesNo,
            );
            if answer != UiAnswer::Yes {
                return Err(self.fail(PimError::UserDeclined, NO_BACKUP_MESSAGE));
            }
            std::fs::remove_file(backup_file).map_err(|e| {
                self.fail(
                    io_error,
                    format!(
                        "Error: failed to remove backup file {}: {}",
                        backup_file.display(),
                        e
                    ),
                )
            })?;
        }

        std::fs::copy(config_file, backup_file).map_err(|e| {
            self.fail(
                io_error,
                format!(
                    "Error: failed to back up server configuration {}: {}",
                    config_file.display(),
                    e
                ),
            )
        })?;

        let config_file = config_file.to_path_buf();
        let backup_file = backup_file.to_path_buf();
        let reporter = self.reporter.clone();
        rollback.add(move || {
            if let Err(e) = std::fs::copy(&backup_file, &config_file) {
                reporter.error(format!(
                    "Error: failed to restore server configuration from {}: {}",
                    backup_file.display(),
                    e
                ));
                return;
            }
            if let Err(e) = std::fs::remove_file(&backup_file) {
                warn!(file = %backup_file.display(), error = %e, "Cannot remove configuration backup");
            }
        });
        Ok(())
    }

    /// Open both databases, check the source and copy every table. Both
    /// stores are closed again when this returns.
    fn copy_databases(
        &mut self,
        source_db: &mut dyn DbConfig,
        source_config: &ServerConfig,
        dest_db: &mut dyn DbConfig,
        dest_config: &ServerConfig,
    ) -> Result<()> {
        if source_db.use_internal_server() {
            source_db.start_internal_server().map_err(|e| {
                warn!(error = %e, "Cannot start source database server");
                self.fail(
                    PimError::Connection,
                    "Error: failed to open existing database to migrate data from.",
                )
            })?;
        }
        let mut source = source_db
            .open_store(StoreSettings::from_config(source_config, &self.paths))
            .map_err(|e| {
                warn!(error = %e, "Cannot open source database");
                self.fail(
                    PimError::Connection,
                    "Error: failed to open existing database to migrate data from.",
                )
            })?;

        if dest_db.use_internal_server() {
            dest_db.start_internal_server().map_err(|e| {
                warn!(error = %e, "Cannot start destination database server");
                self.fail(
                    PimError::Connection,
                    "Error: failed to open new database to migrate data to.",
                )
            })?;
        }
        let mut dest = dest_db
            .open_store(StoreSettings::from_config(dest_config, &self.paths))
            .map_err(|e| {
                warn!(error = %e, "Cannot open destination database");
                self.fail(
                    PimError::Connection,
                    "Error: failed to open new database to migrate data to.",
                )
            })?;

        self.reporter.info("Running fsck on the source database");
        self.janitor.check(&mut source).map_err(|e| {
            self.fail(
                PimError::Integrity,
                format!("Error: database fsck failed: {}", e),
            )
        })?;
        self.reporter.info("Database fsck completed");

        migrate_tables(&mut source, &mut dest, dest_db, self.batch_size, &self.reporter)?;

        source.close();
        dest.close();
        info!("Source and destination databases closed");
        Ok(())
    }

    /// Move the source database into `migration_backup`. Returns where it
    /// went, or `None` if the user chose to go on without a backup.
    fn move_database_to_backup_location(&self, source_path: &Path) -> Result<Option<PathBuf>> {
        let backup_dir = self.paths.migration_backup_dir();
        if is_non_empty_dir(&backup_dir) {
            let answer = self.reporter.ask(
                "Backup directory already exists. Do you want to overwrite the previous backup?",
                QuestionKind::YesNoSkip,
            );
            match answer {
                UiAnswer::Skip => {
                    info!("Continuing without a database backup");
                    return Ok(None);
                }
                UiAnswer::No => {
                    return Err(self.fail(PimError::UserDeclined, NO_BACKUP_MESSAGE));
                }
                UiAnswer::Yes => {
                    std::fs::remove_dir_all(&backup_dir).map_err(|e| {
                        warn!(error = %e, "Cannot remove previous backup");
                        self.fail(io_error, "Failed to remove previous backup directory.")
                    })?;
                }
            }
        }

        let file_name = source_path.file_name().ok_or_else(|| {
            self.fail(
                PimError::Config,
                "Error: failed to obtain path to source database data file or directory.",
            )
        })?;
        let backup_path = backup_dir.join(file_name);
        std::fs::create_dir_all(&backup_dir)
            .and_then(|()| std::fs::rename(source_path, &backup_path))
            .map_err(|e| {
                self.fail(
                    io_error,
                    format!("Failed to move database to backup location: {}", e),
                )
            })?;
        info!(backup = %backup_path.display(), "Original database backed up");
        Ok(Some(backup_path))
    }
}

impl std::fmt::Debug for DbMigrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbMigrator")
            .field("target", &self.target)
            .field("paths", &self.paths)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

fn restore_database(backup: &Path, original: &Path, reporter: &Reporter) {
    reporter.info(format!(
        "Restoring database from backup {} to {}",
        backup.display(),
        original.display()
    ));
    let restored = if original.exists() {
        remove_path(original).and_then(|()| Ok(std::fs::rename(backup, original)?))
    } else {
        std::fs::rename(backup, original).map_err(PimError::from)
    };
    if let Err(e) = restored {
        reporter.error(format!(
            "Error: failed to restore database from backup: {}",
            e
        ));
    }
}

fn io_error(message: String) -> PimError {
    PimError::Io(std::io::Error::other(message))
}

/// `server.toml` becomes `server.toml.<suffix>`.
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_path(path: &Path) -> Result<()> {
    if path.is_dir() {
        std::fs::remove_dir_all(path)?;
    } else {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

fn is_non_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MigrationEvent;

    #[test]
    fn test_with_suffix() {
        assert_eq!(
            with_suffix(Path::new("/cfg/server.toml"), "bkp"),
            PathBuf::from("/cfg/server.toml.bkp")
        );
    }

    #[test]
    fn test_is_non_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_non_empty_dir(&dir.path().join("missing")));
        assert!(!is_non_empty_dir(dir.path()));
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        assert!(is_non_empty_dir(dir.path()));
    }

    #[test]
    fn test_invalid_engine_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StoragePaths::new(dir.path().join("cfg"), dir.path().join("data"));
        let (reporter, mut rx) = Reporter::channel();

        let mut migrator = DbMigrator::new("oracle", paths, reporter);
        assert!(!migrator.run());

        let mut errors = Vec::new();
        let mut completed = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                MigrationEvent::Error(text) => errors.push(text),
                MigrationEvent::Completed(ok) => completed = Some(ok),
                _ => {}
            }
        }
        assert_eq!(
            errors,
            vec![
                "Invalid database engine \"oracle\" - valid values are \"sqlite\", \"mysql\" and \"postgres\"."
                    .to_string()
            ]
        );
        assert_eq!(completed, Some(false));
        assert!(!dir.path().join("data").join("pimstore.lock").exists());
    }

    #[test]
    fn test_restore_database_replaces_partial_copy() {
        let dir = tempfile::tempdir().unwrap();
        let backup = dir.path().join("backup.db");
        let original = dir.path().join("pimstore.db");
        std::fs::write(&backup, b"old").unwrap();
        std::fs::write(&original, b"new").unwrap();
        let (reporter, _rx) = Reporter::channel();

        restore_database(&backup, &original, &reporter);
        assert_eq!(std::fs::read(&original).unwrap(), b"old");
        assert!(!backup.exists());
    }
}
