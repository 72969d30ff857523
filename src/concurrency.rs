//! Process-level exclusivity for an open storage file.
//!
//! A storage file and its WAL segment are owned by exactly one running
//! instance. Thread-level serialization happens behind the storage mutex;
//! this lock covers the process boundary via an exclusive advisory lock on
//! a `.lock` sibling file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;

use crate::error::{FolioError, Result};

/// Exclusive lock held for the lifetime of an open storage. Released on drop.
pub struct StorageLock {
    lock_file: File,
    #[allow(dead_code)]
    lock_path: PathBuf,
}

impl StorageLock {
    pub fn acquire(db_path: &Path) -> Result<Self> {
        let lock_path = db_path.with_extension("lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| FolioError::AlreadyOpen(db_path.display().to_string()))?;

        Ok(StorageLock {
            lock_file,
            lock_path,
        })
    }
}

impl Drop for StorageLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}
