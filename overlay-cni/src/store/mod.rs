//! Container metadata store.
//!
//! A single JSON file maps container IDs to the [`AttachmentRecord`] written
//! on ADD. The file doubles as its own lock: every operation opens it, takes
//! an exclusive `flock`, does one read-modify-write and closes it again, so
//! unrelated containers only contend for the duration of a single record
//! update.
//!
//! Updates are written to a temporary file next to the store and renamed over
//! it, so a failed write leaves the previous records intact. A waiter that
//! locked a file which has since been replaced opens the path again.

use nix::fcntl::{flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

use crate::types::IpConfig;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("open lock: open {path}: {source}")]
    OpenLock {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("lock {path}: {source}")]
    Lock {
        path: String,
        #[source]
        source: nix::Error,
    },

    #[error("read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("decode {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("encode metadata: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// What ADD attached, kept so DEL can undo it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRecord {
    pub container_id: String,
    pub if_name: String,
    pub namespace_path: String,
    pub host_if_name: String,
    pub ip_config: IpConfig,
}

type Records = BTreeMap<String, AttachmentRecord>;

#[derive(Debug, Clone)]
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take and release the lock once; reports an unusable store before
    /// anything else has been touched.
    pub fn probe(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }

    pub fn write(&self, record: &AttachmentRecord) -> Result<(), StoreError> {
        let mut locked = self.lock()?;
        let mut records = locked.load()?;
        records.insert(record.container_id.clone(), record.clone());
        locked.save(&records)?;
        debug!(container_id = %record.container_id, store = %self.path.display(), "wrote container metadata");
        Ok(())
    }

    pub fn read(&self, container_id: &str) -> Result<Option<AttachmentRecord>, StoreError> {
        let mut locked = self.lock()?;
        Ok(locked.load()?.remove(container_id))
    }

    /// Remove a record. Returns `None` when there was nothing to remove.
    pub fn delete(&self, container_id: &str) -> Result<Option<AttachmentRecord>, StoreError> {
        let mut locked = self.lock()?;
        let mut records = locked.load()?;
        let removed = records.remove(container_id);
        if removed.is_some() {
            locked.save(&records)?;
            debug!(container_id, store = %self.path.display(), "removed container metadata");
        }
        Ok(removed)
    }

    pub fn list(&self) -> Result<Vec<AttachmentRecord>, StoreError> {
        let mut locked = self.lock()?;
        Ok(locked.load()?.into_values().collect())
    }

    fn lock(&self) -> Result<LockedStore, StoreError> {
        let path = self.path.display().to_string();
        loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&self.path)
                .map_err(|source| StoreError::OpenLock {
                    path: path.clone(),
                    source,
                })?;
            flock(file.as_raw_fd(), FlockArg::LockExclusive).map_err(|source| StoreError::Lock {
                path: path.clone(),
                source,
            })?;

            if self.is_current(&file) {
                return Ok(LockedStore {
                    file,
                    store_path: self.path.clone(),
                    path,
                });
            }
            debug!(store = %path, "store replaced while waiting for the lock");
        }
    }

    /// Whether `file` is still the one the store path names.
    fn is_current(&self, file: &File) -> bool {
        match (file.metadata(), fs::metadata(&self.path)) {
            (Ok(held), Ok(current)) => held.dev() == current.dev() && held.ino() == current.ino(),
            _ => false,
        }
    }
}

/// The store file while its lock is held; closing the file releases it.
struct LockedStore {
    file: File,
    store_path: PathBuf,
    path: String,
}

impl LockedStore {
    fn load(&mut self) -> Result<Records, StoreError> {
        let mut contents = String::new();
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.read_to_string(&mut contents))
            .map_err(|source| StoreError::Read {
                path: self.path.clone(),
                source,
            })?;

        if contents.trim().is_empty() {
            return Ok(Records::new());
        }
        serde_json::from_str(&contents).map_err(|source| StoreError::Decode {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&mut self, records: &Records) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(records)?;
        let dir = match self.store_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };

        let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
        tmp.write_all(&data)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(write_err)?;
        tmp.persist(&self.store_path)
            .map_err(|e| write_err(e.error))?;
        Ok(())
    }
}
