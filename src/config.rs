//! Storage configuration.
//!
//! Plain option structs handed to [`crate::storage::store::PagedStorage::open`].
//! Defaults match the on-disk format's expectations; setters are chainable so
//! call sites read as a builder.

use crate::crypto::EncryptionKey;
use crate::error::{FolioError, Result};

/// Allowed page sizes (power of two, 4 KiB to 32 KiB).
pub const ALLOWED_PAGE_SIZES: [u32; 4] = [4096, 8192, 16384, 32768];

/// WAL fsync policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// fsync after every appended record.
    Full,
    /// fsync on commit only.
    Normal,
    /// Never fsync explicitly. Commit records still flush and fsync.
    Off,
}

#[derive(Debug, Clone)]
pub struct WalOptions {
    pub sync_mode: SyncMode,
    /// Segment is reset once it grows past this, after a checkpoint.
    pub max_file_size: u64,
    pub checkpoint_interval_bytes: u64,
    pub checkpoint_interval_secs: u64,
    /// Append buffer flushed when it reaches this size.
    pub buffer_size: usize,
}

impl Default for WalOptions {
    fn default() -> Self {
        WalOptions {
            sync_mode: SyncMode::Normal,
            max_file_size: 64 * 1024 * 1024,
            checkpoint_interval_bytes: 16 * 1024 * 1024,
            checkpoint_interval_secs: 60,
            buffer_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryOptions {
    pub delete_wal_after_recovery: bool,
    /// When false, WAL damage yields a best-effort (possibly empty) replay
    /// instead of an error.
    pub throw_on_error: bool,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        RecoveryOptions {
            delete_wal_after_recovery: true,
            throw_on_error: true,
        }
    }
}

#[derive(Clone)]
pub struct StorageOptions {
    pub page_size: u32,
    /// Buffer pool capacity in pages.
    pub buffer_pool_size: usize,
    pub verify_checksums: bool,
    pub enable_transactions: bool,
    /// Upper bound on one serialized record (framing + payload).
    pub max_entity_size: usize,
    pub encryption_key: Option<EncryptionKey>,
    pub read_only: bool,
    pub wal: WalOptions,
    pub recovery: RecoveryOptions,
}

impl Default for StorageOptions {
    fn default() -> Self {
        StorageOptions {
            page_size: 4096,
            buffer_pool_size: 1024,
            verify_checksums: true,
            enable_transactions: true,
            max_entity_size: 1024 * 1024,
            encryption_key: None,
            read_only: false,
            wal: WalOptions::default(),
            recovery: RecoveryOptions::default(),
        }
    }
}

impl StorageOptions {
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn buffer_pool_size(mut self, pages: usize) -> Self {
        self.buffer_pool_size = pages;
        self
    }

    pub fn verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    pub fn enable_transactions(mut self, enable: bool) -> Self {
        self.enable_transactions = enable;
        self
    }

    pub fn max_entity_size(mut self, bytes: usize) -> Self {
        self.max_entity_size = bytes;
        self
    }

    pub fn encryption_key(mut self, key: EncryptionKey) -> Self {
        self.encryption_key = Some(key);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.wal.sync_mode = mode;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !ALLOWED_PAGE_SIZES.contains(&self.page_size) {
            return Err(FolioError::InvalidPageSize(self.page_size));
        }
        if self.buffer_pool_size == 0 {
            return Err(FolioError::OutOfRange(
                "buffer_pool_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for StorageOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageOptions")
            .field("page_size", &self.page_size)
            .field("buffer_pool_size", &self.buffer_pool_size)
            .field("verify_checksums", &self.verify_checksums)
            .field("enable_transactions", &self.enable_transactions)
            .field("max_entity_size", &self.max_entity_size)
            .field("encrypted", &self.encryption_key.is_some())
            .field("read_only", &self.read_only)
            .field("wal", &self.wal)
            .field("recovery", &self.recovery)
            .finish()
    }
}
