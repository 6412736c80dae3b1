//! Streaming of part payloads from a client.
//!
//! The client first describes the part, then either hands over the bytes
//! or, for payloads that end up in a file, writes the file itself at a
//! path the streamer allocates.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};

use pimstore_core::error::{PimError, Result};
use pimstore_core::types::{Part, PartStorage, PimItem};

use super::helper::PartHelper;
use crate::datastore::DataStore;

/// What a client announces before sending a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartMetaData {
    /// Fully qualified part type name, e.g. `PLD:RFC822`.
    pub name: String,
    /// Advertised payload size in bytes.
    pub size: i64,
    pub version: i32,
    /// Storage the client asks for. Only `Foreign` is honoured as given,
    /// everything else follows the size threshold.
    pub storage: PartStorage,
}

/// The client side of a streaming exchange.
pub trait StreamPeer {
    fn request_metadata(&mut self, part_name: &str) -> Result<PartMetaData>;

    /// The payload bytes, or the absolute path of a foreign payload.
    fn request_data(&mut self, meta: &PartMetaData) -> Result<Vec<u8>>;

    /// Write the payload to `path`.
    fn write_to_file(&mut self, meta: &PartMetaData, path: &Path) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    pub part: Part,
    /// Whether the stored payload differs from what was there before.
    /// Only compared byte-wise when requested; new parts are always changed.
    pub changed: bool,
}

pub struct PartStreamer<'a, P: StreamPeer> {
    store: &'a mut DataStore,
    peer: P,
    item: PimItem,
}

impl<'a, P: StreamPeer> PartStreamer<'a, P> {
    pub fn new(store: &'a mut DataStore, peer: P, item: PimItem) -> Self {
        Self { store, peer, item }
    }

    pub fn into_peer(self) -> P {
        self.peer
    }

    /// Stream one part of the item.
    ///
    /// With `check_exists` or `check_changed` an existing part of the same
    /// type is updated, otherwise a new part is inserted.
    pub fn stream(
        &mut self,
        part_name: &str,
        check_exists: bool,
        check_changed: bool,
    ) -> Result<StreamOutcome> {
        let meta = self.peer.request_metadata(part_name)?;
        let part_type = self.store.part_type_by_fq_name_or_create(&meta.name)?;

        let mut part = if check_exists || check_changed {
            self.store
                .part_by_type(self.item.id, part_type.id)?
                .unwrap_or_default()
        } else {
            Part::default()
        };

        let mut changed = !part.is_valid() || part.datasize != meta.size;
        let check_bytes = check_changed && !changed;

        part.pim_item_id = self.item.id;
        part.part_type_id = part_type.id;
        part.version = meta.version;

        if meta.storage == PartStorage::Foreign {
            self.stream_foreign(&mut part, &meta, check_bytes, &mut changed)?;
        } else if PartHelper::is_external_size(self.store, meta.size) {
            self.stream_to_file(&mut part, &meta, check_bytes, &mut changed)?;
        } else {
            self.stream_inline(&mut part, &meta, check_bytes, &mut changed)?;
        }

        debug!(
            item = self.item.id,
            part = part.id,
            name = %meta.name,
            size = meta.size,
            changed,
            "Part streamed"
        );
        Ok(StreamOutcome { part, changed })
    }

    fn stream_inline(
        &mut self,
        part: &mut Part,
        meta: &PartMetaData,
        check_bytes: bool,
        changed: &mut bool,
    ) -> Result<()> {
        let data = self.peer.request_data(meta)?;
        if data.len() as i64 != meta.size {
            return Err(size_mismatch(meta, data.len() as u64));
        }
        if check_bytes {
            *changed = PartHelper::translate_data(self.store, part)? != data;
        }
        let size = data.len() as i64;
        PartHelper::update(self.store, part, &data, size)
    }

    fn stream_to_file(
        &mut self,
        part: &mut Part,
        meta: &PartMetaData,
        check_bytes: bool,
        changed: &mut bool,
    ) -> Result<()> {
        let original = if check_bytes {
            Some(PartHelper::translate_data(self.store, part)?)
        } else {
            None
        };

        // Only a part that already lives in a file has a revision to bump.
        let previous = match part.storage {
            PartStorage::External if part.is_valid() => part.file_reference(),
            _ => None,
        };

        if !part.is_valid() {
            part.storage = PartStorage::External;
            part.data.clear();
            part.datasize = meta.size;
            part.id = PartHelper::insert_row(self.store, part)?;
        }
        let (name, path) = self
            .store
            .external_storage()
            .allocate_file(part.id, previous.as_deref())?;

        self.store.external_storage_mut().adopt_file(path.clone());
        if let Err(e) = self.receive_file(meta, &path) {
            if !self.store.external_storage().in_transaction() {
                if let Err(remove_err) = fs::remove_file(&path) {
                    if remove_err.kind() != std::io::ErrorKind::NotFound {
                        warn!(
                            path = %path.display(),
                            error = %remove_err,
                            "Failed to remove incomplete payload file"
                        );
                    }
                }
            }
            return Err(e);
        }

        if let Some(previous) = previous {
            self.store.external_storage_mut().remove_part_file(&previous)?;
        }

        part.storage = PartStorage::External;
        part.data = name.into_bytes();
        part.datasize = meta.size;
        PartHelper::update_row(self.store, part)?;

        if let Some(original) = original {
            *changed = original != PartHelper::translate_data(self.store, part)?;
        }
        Ok(())
    }

    fn receive_file(&mut self, meta: &PartMetaData, path: &Path) -> Result<()> {
        self.peer.write_to_file(meta, path)?;
        let size = match fs::metadata(path) {
            Ok(m) => m.len(),
            Err(_) => {
                error!(path = %path.display(), "External payload file does not exist");
                return Err(PimError::Stream(format!(
                    "External payload file {} does not exist",
                    path.display()
                )));
            }
        };
        if size as i64 != meta.size {
            return Err(size_mismatch(meta, size));
        }
        Ok(())
    }

    fn stream_foreign(
        &mut self,
        part: &mut Part,
        meta: &PartMetaData,
        check_bytes: bool,
        changed: &mut bool,
    ) -> Result<()> {
        let reference = self.peer.request_data(meta)?;
        let path = PathBuf::from(String::from_utf8_lossy(&reference).into_owned());
        if !path.is_absolute() {
            return Err(PimError::Stream(format!(
                "Foreign payload path {} is not absolute",
                path.display()
            )));
        }
        let size = fs::metadata(&path)
            .map_err(|_| {
                PimError::Stream(format!(
                    "Foreign payload file {} does not exist",
                    path.display()
                ))
            })?
            .len();
        if size as i64 != meta.size {
            return Err(size_mismatch(meta, size));
        }

        if check_bytes {
            let current = fs::read(&path).map_err(|e| PimError::payload_io(&path, e))?;
            *changed = PartHelper::translate_data(self.store, part)? != current;
        }

        if part.storage == PartStorage::External {
            if let Some(previous) = part.file_reference() {
                self.store.external_storage_mut().remove_part_file(&previous)?;
            }
        }

        part.storage = PartStorage::Foreign;
        part.data = reference;
        part.datasize = meta.size;
        if part.is_valid() {
            PartHelper::update_row(self.store, part)
        } else {
            part.id = PartHelper::insert_row(self.store, part)?;
            Ok(())
        }
    }
}

fn size_mismatch(meta: &PartMetaData, actual: u64) -> PimError {
    error!(
        name = %meta.name,
        advertised = meta.size,
        actual,
        "Payload size mismatch"
    );
    PimError::Stream(format!(
        "Payload size mismatch: client advertised {} bytes, but got {} bytes",
        meta.size, actual
    ))
}
