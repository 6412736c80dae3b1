//! Consistency check run on the source database before it is copied.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use pimstore_core::error::Result;
use pimstore_core::types::PartStorage;
use pimstore_storage::{DataStore, PartHelper};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JanitorReport {
    pub parts_checked: usize,
    /// Parts whose payload file was missing and that were reset to empty.
    pub parts_reset: usize,
    /// Payload files no part refers to. They are reported, never deleted.
    pub orphan_files: Vec<PathBuf>,
}

pub trait StorageJanitor: Send {
    fn check(&mut self, store: &mut DataStore) -> Result<JanitorReport>;
}

/// Verifies the payload file of every file-backed part and looks for
/// payload files nothing refers to.
#[derive(Debug, Default)]
pub struct BasicJanitor;

impl BasicJanitor {
    pub fn new() -> Self {
        Self
    }

    fn payload_files(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if !dir.is_dir() {
            return Ok(files);
        }
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                for inner in std::fs::read_dir(&path)? {
                    let inner = inner?.path();
                    if inner.is_file() {
                        files.push(inner);
                    }
                }
            } else if path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

impl StorageJanitor for BasicJanitor {
    fn check(&mut self, store: &mut DataStore) -> Result<JanitorReport> {
        let mut report = JanitorReport::default();
        let mut referenced = HashSet::new();

        for mut part in store.file_backed_parts()? {
            report.parts_checked += 1;
            let managed = part.storage == PartStorage::External;
            if !PartHelper::verify(store, &mut part)? {
                report.parts_reset += 1;
            } else if managed {
                if let Some(name) = part.file_reference() {
                    referenced.insert(name);
                }
            }
        }

        let payload_dir = store.external_storage().base_dir().to_path_buf();
        for file in Self::payload_files(&payload_dir)? {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !referenced.contains(&name) {
                warn!(file = %file.display(), "Payload file is not referenced by any part");
                report.orphan_files.push(file);
            }
        }

        info!(
            checked = report.parts_checked,
            reset = report.parts_reset,
            orphans = report.orphan_files.len(),
            "Storage check finished"
        );
        Ok(report)
    }
}
