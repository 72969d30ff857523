//! WAL segment writer.
//!
//! Segment header, 64 bytes little-endian:
//!   magic u32 | version u32 | database_id 16B | sequence i64 |
//!   checkpoint_lsn i64 | flags u32 | reserved 20B
//!
//! Records append behind an in-memory buffer that is flushed when full, on
//! commit, and on explicit sync. Commit records always flush and fsync no
//! matter the sync mode. LSNs are byte offsets; a record's LSN is its start
//! offset in the segment.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use uuid::Uuid;

use crate::config::{SyncMode, WalOptions};
use crate::error::{FolioError, Result};
use crate::wal::record::{CheckpointData, WalRecord, WalRecordType};
use crate::wal::{
    Lsn, FIRST_LSN, SEG_FLAG_CLEAN_CLOSE, SEG_FLAG_OPEN, WAL_HEADER_SIZE, WAL_MAGIC, WAL_VERSION,
};

const OFF_CHECKPOINT_LSN: u64 = 32;
const OFF_FLAGS: u64 = 40;

#[derive(Debug, Clone)]
pub struct SegmentHeader {
    pub version: u32,
    pub database_id: Uuid,
    pub sequence: i64,
    pub checkpoint_lsn: Lsn,
    pub flags: u32,
}

impl SegmentHeader {
    pub fn encode(&self) -> [u8; WAL_HEADER_SIZE] {
        let mut buf = [0u8; WAL_HEADER_SIZE];
        buf[0..4].copy_from_slice(&WAL_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..24].copy_from_slice(self.database_id.as_bytes());
        buf[24..32].copy_from_slice(&self.sequence.to_le_bytes());
        buf[32..40].copy_from_slice(&self.checkpoint_lsn.to_le_bytes());
        buf[40..44].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<SegmentHeader> {
        if buf.len() < WAL_HEADER_SIZE {
            return Err(FolioError::Wal("segment header truncated".into()));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != WAL_MAGIC {
            return Err(FolioError::Corrupted(format!(
                "bad WAL segment magic {:#010x}",
                magic
            )));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version > WAL_VERSION {
            return Err(FolioError::VersionMismatch {
                found: version,
                min: 1,
                max: WAL_VERSION,
            });
        }
        let mut db_id = [0u8; 16];
        db_id.copy_from_slice(&buf[8..24]);
        Ok(SegmentHeader {
            version,
            database_id: Uuid::from_bytes(db_id),
            sequence: i64::from_le_bytes(buf[24..32].try_into().unwrap()),
            checkpoint_lsn: i64::from_le_bytes(buf[32..40].try_into().unwrap()),
            flags: u32::from_le_bytes(buf[40..44].try_into().unwrap()),
        })
    }

    pub fn is_clean_close(&self) -> bool {
        self.flags & SEG_FLAG_CLEAN_CLOSE != 0
    }
}

pub struct WalWriter {
    file: File,
    #[allow(dead_code)]
    path: PathBuf,
    header: SegmentHeader,
    sync_mode: SyncMode,
    buffer_size: usize,
    buf: Vec<u8>,
    /// Byte offset of the next record; also the durable+buffered length.
    next_lsn: Lsn,
    bytes_since_checkpoint: u64,
    last_checkpoint_at: Instant,
}

impl WalWriter {
    /// Create a fresh segment, truncating anything at `path`.
    pub fn create(
        path: &Path,
        database_id: Uuid,
        sequence: i64,
        options: &WalOptions,
    ) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let header = SegmentHeader {
            version: WAL_VERSION,
            database_id,
            sequence,
            checkpoint_lsn: 0,
            flags: SEG_FLAG_OPEN,
        };
        file.write_all(&header.encode())?;
        file.sync_all()?;

        Ok(WalWriter {
            file,
            path: path.to_path_buf(),
            header,
            sync_mode: options.sync_mode,
            buffer_size: options.buffer_size.max(1),
            buf: Vec::new(),
            next_lsn: FIRST_LSN,
            bytes_since_checkpoint: 0,
            last_checkpoint_at: Instant::now(),
        })
    }

    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    /// LSN the next appended record will get.
    pub fn current_lsn(&self) -> Lsn {
        self.next_lsn
    }

    /// Segment size including buffered bytes.
    pub fn size(&self) -> u64 {
        self.next_lsn as u64
    }

    pub fn bytes_since_checkpoint(&self) -> u64 {
        self.bytes_since_checkpoint
    }

    pub fn secs_since_checkpoint(&self) -> u64 {
        self.last_checkpoint_at.elapsed().as_secs()
    }

    /// Append a record, assigning its LSN. Commit records flush and fsync
    /// regardless of the sync mode.
    pub fn append(&mut self, mut record: WalRecord) -> Result<Lsn> {
        record.lsn = self.next_lsn;
        let bytes = record.encode();
        self.next_lsn += bytes.len() as Lsn;
        self.bytes_since_checkpoint += bytes.len() as u64;
        self.buf.extend_from_slice(&bytes);

        if record.record_type == WalRecordType::Commit {
            self.flush_buffer()?;
            self.file.sync_data()?;
        } else {
            match self.sync_mode {
                SyncMode::Full => {
                    self.flush_buffer()?;
                    self.file.sync_data()?;
                }
                SyncMode::Normal | SyncMode::Off => {
                    if self.buf.len() >= self.buffer_size {
                        self.flush_buffer()?;
                    }
                }
            }
        }
        Ok(record.lsn)
    }

    /// Flush buffered records and fsync.
    pub fn sync(&mut self) -> Result<()> {
        self.flush_buffer()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Append a checkpoint record, fsync, and advance the header's
    /// checkpoint LSN.
    pub fn checkpoint(&mut self, data: &CheckpointData) -> Result<Lsn> {
        let payload = data.encode()?;
        let lsn = self.append(WalRecord::system(WalRecordType::Checkpoint, payload))?;
        self.sync()?;

        self.header.checkpoint_lsn = lsn;
        self.persist_header_i64(OFF_CHECKPOINT_LSN, lsn)?;
        self.bytes_since_checkpoint = 0;
        self.last_checkpoint_at = Instant::now();
        log::debug!(
            "wal checkpoint at lsn {} (segment {})",
            lsn,
            self.header.sequence
        );
        Ok(lsn)
    }

    /// Truncate to a fresh segment with the next sequence number. Valid only
    /// once everything logged so far is durable in the main file.
    pub fn reset(&mut self) -> Result<()> {
        self.buf.clear();
        self.header.sequence += 1;
        self.header.checkpoint_lsn = 0;
        self.header.flags = SEG_FLAG_OPEN;

        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.encode())?;
        self.file.sync_all()?;

        self.next_lsn = FIRST_LSN;
        self.bytes_since_checkpoint = 0;
        self.last_checkpoint_at = Instant::now();
        log::debug!("wal segment reset to sequence {}", self.header.sequence);
        Ok(())
    }

    /// Write the end-of-log marker, set the clean-close flag, and fsync.
    pub fn close(mut self) -> Result<()> {
        self.append(WalRecord::system(WalRecordType::EndOfLog, Vec::new()))?;
        self.flush_buffer()?;

        self.header.flags = (self.header.flags | SEG_FLAG_CLEAN_CLOSE) & !SEG_FLAG_OPEN;
        self.persist_header_u32(OFF_FLAGS, self.header.flags)?;
        self.file.sync_all()?;
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let start = self.next_lsn as u64 - self.buf.len() as u64;
        self.file.seek(SeekFrom::Start(start))?;
        self.file.write_all(&self.buf)?;
        self.buf.clear();
        Ok(())
    }

    fn persist_header_i64(&mut self, offset: u64, value: i64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    fn persist_header_u32(&mut self, offset: u64, value: u32) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&value.to_le_bytes())?;
        Ok(())
    }
}

/// Read just the segment header of an existing WAL file.
pub fn read_segment_header(path: &Path) -> Result<SegmentHeader> {
    use std::io::Read;
    let mut file = File::open(path)?;
    let mut buf = [0u8; WAL_HEADER_SIZE];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    SegmentHeader::decode(&buf[..filled])
}
