//! Payload files of externally stored parts.
//!
//! Files are named `<part id>_r<revision>` and spread over 100 sub
//! directories keyed by the last two digits of the part id, so single digit
//! ids land in `00` to `09`. A flat layout
//! written by older installations is still found on read.
//!
//! While the owning store has a transaction open, file operations are
//! journaled: files created in the transaction are removed again on
//! rollback, and deletions only happen after the commit. That way a row
//! that gets rolled back never points at a file that is already gone.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use pimstore_core::error::{PimError, Result};
use pimstore_core::types::EntityId;

#[derive(Debug, Clone, PartialEq, Eq)]
enum FileOperation {
    Create(PathBuf),
    Delete(PathBuf),
}

#[derive(Debug)]
pub struct ExternalPartStorage {
    base_dir: PathBuf,
    journal: Option<Vec<FileOperation>>,
}

impl ExternalPartStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            journal: None,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Initial file name of a part's payload.
    pub fn name_for_part_id(part_id: EntityId) -> String {
        Self::update_file_name_revision(&part_id.to_string())
    }

    /// `12_r3` becomes `12_r4`; a name without revision gets `_r0`.
    pub fn update_file_name_revision(name: &str) -> String {
        if let Some(pos) = name.rfind("_r") {
            if let Ok(rev) = name[pos + 2..].parse::<u64>() {
                return format!("{}_r{}", &name[..pos], rev + 1);
            }
        }
        format!("{}_r0", name)
    }

    /// Two character sub directory for a file name.
    fn level_dir(name: &str) -> String {
        let id_part = match name.find('_') {
            Some(pos) => &name[..pos],
            None => name,
        };
        let chars: Vec<char> = id_part.chars().collect();
        match chars.len() {
            0 => "00".to_string(),
            1 => format!("0{}", chars[0]),
            n => format!("{}{}", chars[n - 2], chars[n - 1]),
        }
    }

    fn levelled_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(Self::level_dir(name)).join(name)
    }

    /// Absolute path of a payload file and whether it exists.
    ///
    /// Absolute names (foreign payloads) are returned as they are. For
    /// relative names the levelled location wins, then the flat legacy
    /// location; if neither exists the levelled path is returned.
    pub fn resolve_absolute_path(&self, name: &str) -> (PathBuf, bool) {
        if name.is_empty() {
            return (self.base_dir.clone(), false);
        }
        let path = Path::new(name);
        if path.is_absolute() {
            return (path.to_path_buf(), path.exists());
        }

        let levelled = self.levelled_path(name);
        if levelled.exists() {
            return (levelled, true);
        }
        let legacy = self.base_dir.join(name);
        if legacy.exists() {
            return (legacy, true);
        }
        (levelled, false)
    }

    /// Pick a free file name for a part, the next revision of `current` if
    /// given, and make sure its directory exists.
    pub fn allocate_file(
        &self,
        part_id: EntityId,
        current: Option<&str>,
    ) -> Result<(String, PathBuf)> {
        let mut name = match current.filter(|c| !c.is_empty()) {
            Some(current) => Self::update_file_name_revision(current),
            None => Self::name_for_part_id(part_id),
        };
        let (mut path, mut exists) = self.resolve_absolute_path(&name);
        // A demoted part may still own a file whose deletion is pending.
        while exists {
            name = Self::update_file_name_revision(&name);
            (path, exists) = self.resolve_absolute_path(&name);
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| PimError::payload_io(dir, e))?;
        }
        Ok((name, path))
    }

    /// Take ownership of a file someone else wrote at an allocated path, so
    /// a rollback removes it again.
    pub fn adopt_file(&mut self, path: PathBuf) {
        self.record(FileOperation::Create(path));
    }

    /// Write the first file of a part and return its file name.
    pub fn create_part_file(&mut self, data: &[u8], part_id: EntityId) -> Result<String> {
        let (name, path) = self.allocate_file(part_id, None)?;
        self.write_new_file(&path, data)?;
        self.record(FileOperation::Create(path));
        Ok(name)
    }

    /// Write `data` as the next revision of `current` and retire the old file.
    pub fn update_part_file(&mut self, data: &[u8], current: &str) -> Result<String> {
        check_name(current)?;
        let (current_path, exists) = self.resolve_absolute_path(current);
        if !exists {
            return Err(PimError::PayloadIo(format!(
                "asked to update non-existent part file {}",
                current_path.display()
            )));
        }

        let new_name = Self::update_file_name_revision(current);
        let (new_path, exists) = self.resolve_absolute_path(&new_name);
        if exists {
            return Err(PimError::PayloadIo(format!(
                "cannot update {}: {} already exists",
                current, new_name
            )));
        }

        self.write_new_file(&new_path, data)?;
        self.record(FileOperation::Create(new_path));
        self.remove_file(&current_path)?;
        Ok(new_name)
    }

    /// Remove a payload file, or schedule its removal for commit time.
    pub fn remove_part_file(&mut self, name: &str) -> Result<()> {
        check_name(name)?;
        let (path, exists) = self.resolve_absolute_path(name);
        if !exists {
            return Ok(());
        }
        self.remove_file(&path)
    }

    /// Read the whole payload file.
    pub fn read_part_file(&self, name: &str) -> Result<Vec<u8>> {
        check_name(name)?;
        let (path, exists) = self.resolve_absolute_path(name);
        if !exists {
            return Err(PimError::PayloadIo(format!(
                "payload file {} does not exist",
                path.display()
            )));
        }
        fs::read(&path).map_err(|e| PimError::payload_io(&path, e))
    }

    fn write_new_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| PimError::PayloadIo(format!("{} has no parent", path.display())))?;
        fs::create_dir_all(dir).map_err(|e| PimError::payload_io(dir, e))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| PimError::payload_io(dir, e))?;
        tmp.write_all(data)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| PimError::payload_io(path, e))?;
        tmp.persist_noclobber(path)
            .map_err(|e| PimError::payload_io(path, e.error))?;
        debug!(path = %path.display(), size = data.len(), "Payload file written");
        Ok(())
    }

    fn remove_file(&mut self, path: &Path) -> Result<()> {
        if path.is_dir() {
            return Err(PimError::PayloadIo(format!(
                "cannot remove payload {}: is a directory",
                path.display()
            )));
        }
        if let Some(journal) = self.journal.as_mut() {
            journal.push(FileOperation::Delete(path.to_path_buf()));
            return Ok(());
        }
        fs::remove_file(path).map_err(|e| PimError::payload_io(path, e))?;
        debug!(path = %path.display(), "Payload file removed");
        Ok(())
    }

    fn record(&mut self, op: FileOperation) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(op);
        }
    }

    // =========================================================================
    // Transaction journal
    // =========================================================================

    pub fn in_transaction(&self) -> bool {
        self.journal.is_some()
    }

    pub fn begin_transaction(&mut self) {
        if self.journal.is_some() {
            warn!("External part storage transaction already open");
            return;
        }
        self.journal = Some(Vec::new());
    }

    /// Carry out the deletions requested during the transaction.
    ///
    /// Failures are logged only: the rows no longer reference these files,
    /// so a leftover file is an orphan and does no harm.
    pub fn commit_transaction(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        for op in journal {
            if let FileOperation::Delete(path) = op {
                if let Err(e) = fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %path.display(), error = %e, "Failed to remove payload file");
                    }
                }
            }
        }
    }

    /// Remove the files created during the transaction.
    pub fn rollback_transaction(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        for op in journal.into_iter().rev() {
            if let FileOperation::Create(path) = op {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove payload file on rollback");
                }
            }
        }
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PimError::PayloadIo("empty payload file name".to_string()));
    }
    Ok(())
}
