//! Write-ahead log: segment format, writer, reader, recovery passes.

pub mod reader;
pub mod record;
pub mod recovery;
pub mod writer;

/// Log sequence number: byte offset of a record within its segment.
/// 0 is invalid; the first valid LSN equals the segment header size.
pub type Lsn = i64;

/// Transaction identifier, monotonically assigned per storage instance.
pub type TxnId = i64;

pub const INVALID_LSN: Lsn = 0;

pub const WAL_MAGIC: u32 = 0x4457_414C;
pub const WAL_VERSION: u32 = 1;
pub const WAL_HEADER_SIZE: usize = 64;
pub const FIRST_LSN: Lsn = WAL_HEADER_SIZE as Lsn;

pub const RECORD_HEADER_SIZE: usize = 34;

/// Sanity bound for one record payload; anything larger in a header is
/// treated as a corrupt suffix.
pub const MAX_RECORD_PAYLOAD: usize = 16 * 1024 * 1024;

// Segment header flags.
pub const SEG_FLAG_OPEN: u32 = 0x01;
pub const SEG_FLAG_CLEAN_CLOSE: u32 = 0x02;
pub const SEG_FLAG_NEEDS_RECOVERY: u32 = 0x04;
