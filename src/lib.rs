//! foliodb: an embeddable document database storage engine.
//!
//! A single-file store with:
//! - slotted-page record layout over fixed-size pages with CRC32 checksums
//! - a fixed-capacity buffer cache with pin counts and LRU eviction
//! - CBOR document payloads, optionally sealed with AES-128-GCM
//! - a write-ahead log giving transactions their durability
//! - analysis/redo/undo crash recovery that runs before the storage opens
//!
//! The storage face is [`PagedStorage`]: one collection per file, CRUD plus
//! single-writer transactions. The query, index, and collection layers live
//! above this crate and consume only that interface.

pub mod concurrency;
pub mod config;
pub mod crypto;
pub mod error;
pub mod storage;
pub mod value;
pub mod wal;

pub use config::{RecoveryOptions, StorageOptions, SyncMode, WalOptions};
pub use crypto::EncryptionKey;
pub use error::{FolioError, Result};
pub use storage::store::PagedStorage;
pub use value::{Document, Value};
