//! WAL segment reader.
//!
//! Sequential scan with the corrupt-suffix policy: a record whose header or
//! payload is truncated, whose CRC fails, whose type byte is unknown, or
//! whose stored LSN disagrees with its file offset ends the scan at that
//! point. Everything before the cut is valid. An end-of-log record ends the
//! scan cleanly.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::Result;
use crate::wal::record::{record_crc, WalRecord};
use crate::wal::writer::SegmentHeader;
use crate::wal::{Lsn, MAX_RECORD_PAYLOAD, RECORD_HEADER_SIZE, WAL_HEADER_SIZE};

/// How a scan reached its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanEnd {
    /// Still scanning.
    None,
    /// Ran off the end of the file.
    Eof,
    /// Hit an end-of-log marker.
    EndOfLog,
    /// Hit a truncated or corrupt record at this offset.
    CorruptSuffix(Lsn),
}

pub struct WalReader {
    file: File,
    header: SegmentHeader,
    pos: u64,
    file_len: u64,
    end: ScanEnd,
}

impl WalReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();

        let mut header_buf = [0u8; WAL_HEADER_SIZE];
        let read = read_up_to(&mut file, &mut header_buf)?;
        let header = SegmentHeader::decode(&header_buf[..read])?;

        Ok(WalReader {
            file,
            header,
            pos: WAL_HEADER_SIZE as u64,
            file_len,
            end: ScanEnd::None,
        })
    }

    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    pub fn end_state(&self) -> ScanEnd {
        self.end
    }

    /// Offset where a corrupt suffix begins, if one was found.
    pub fn truncated_at(&self) -> Option<Lsn> {
        match self.end {
            ScanEnd::CorruptSuffix(lsn) => Some(lsn),
            _ => None,
        }
    }

    /// Next record, or `None` once the scan has ended.
    pub fn next(&mut self) -> Result<Option<WalRecord>> {
        if self.end != ScanEnd::None {
            return Ok(None);
        }

        let lsn = self.pos as Lsn;
        let remaining = self.file_len.saturating_sub(self.pos);
        if remaining == 0 {
            self.end = ScanEnd::Eof;
            return Ok(None);
        }
        if remaining < RECORD_HEADER_SIZE as u64 {
            self.end = ScanEnd::CorruptSuffix(lsn);
            return Ok(None);
        }

        let mut header = [0u8; RECORD_HEADER_SIZE];
        self.file.seek(SeekFrom::Start(self.pos))?;
        self.file.read_exact(&mut header)?;

        let Some((mut record, payload_len, stored_crc)) = WalRecord::decode_header(&header) else {
            self.end = ScanEnd::CorruptSuffix(lsn);
            return Ok(None);
        };

        if record.lsn != lsn
            || payload_len > MAX_RECORD_PAYLOAD
            || payload_len as u64 > remaining - RECORD_HEADER_SIZE as u64
        {
            self.end = ScanEnd::CorruptSuffix(lsn);
            return Ok(None);
        }

        let mut payload = vec![0u8; payload_len];
        self.file.read_exact(&mut payload)?;

        if record_crc(&header[..RECORD_HEADER_SIZE - 4], &payload) != stored_crc {
            self.end = ScanEnd::CorruptSuffix(lsn);
            return Ok(None);
        }

        record.payload = payload;
        self.pos += (RECORD_HEADER_SIZE + payload_len) as u64;

        if record.record_type == crate::wal::record::WalRecordType::EndOfLog {
            self.end = ScanEnd::EndOfLog;
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Read every remaining record.
    pub fn read_all(&mut self) -> Result<Vec<WalRecord>> {
        let mut records = Vec::new();
        while let Some(record) = self.next()? {
            records.push(record);
        }
        Ok(records)
    }
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalOptions;
    use crate::error::FolioError;
    use crate::wal::record::WalRecordType;
    use crate::wal::writer::WalWriter;
    use crate::wal::{FIRST_LSN, INVALID_LSN};
    use std::io::Write;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn write_simple_txn(path: &std::path::Path) -> Uuid {
        let db_id = Uuid::new_v4();
        let mut writer = WalWriter::create(path, db_id, 1, &WalOptions::default()).unwrap();
        let begin = writer
            .append(WalRecord::new(WalRecordType::Begin, 1, INVALID_LSN, Vec::new()))
            .unwrap();
        let insert = writer
            .append(WalRecord::new(
                WalRecordType::Insert,
                1,
                begin,
                vec![0xAA; 20],
            ))
            .unwrap();
        writer
            .append(WalRecord::new(WalRecordType::Commit, 1, insert, Vec::new()))
            .unwrap();
        db_id
    }

    fn append_bytes(path: &std::path::Path, bytes: &[u8]) {
        let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(bytes).unwrap();
        file.sync_all().unwrap();
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");
        let db_id = write_simple_txn(&path);

        let mut reader = WalReader::open(&path).unwrap();
        assert_eq!(reader.header().database_id, db_id);

        let records = reader.read_all().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].record_type, WalRecordType::Begin);
        assert_eq!(records[0].lsn, FIRST_LSN);
        assert_eq!(records[1].record_type, WalRecordType::Insert);
        assert_eq!(records[1].prev_lsn, records[0].lsn);
        assert_eq!(records[2].record_type, WalRecordType::Commit);
        assert_eq!(reader.end_state(), ScanEnd::Eof);
    }

    #[test]
    fn test_lsns_strictly_increase() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");
        write_simple_txn(&path);

        let mut reader = WalReader::open(&path).unwrap();
        let records = reader.read_all().unwrap();
        for pair in records.windows(2) {
            assert!(pair[0].lsn < pair[1].lsn);
        }
    }

    #[test]
    fn test_end_of_log_ends_scan() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");
        {
            let mut writer =
                WalWriter::create(&path, Uuid::new_v4(), 1, &WalOptions::default()).unwrap();
            writer
                .append(WalRecord::new(WalRecordType::Begin, 1, INVALID_LSN, Vec::new()))
                .unwrap();
            writer.close().unwrap();
        }

        let mut reader = WalReader::open(&path).unwrap();
        let records = reader.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(reader.end_state(), ScanEnd::EndOfLog);
    }

    #[test]
    fn test_truncated_tail_tolerated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");
        write_simple_txn(&path);

        // A partial record header at the tail.
        append_bytes(&path, &[0x04, 0x00, 0x01]);

        let mut reader = WalReader::open(&path).unwrap();
        let records = reader.read_all().unwrap();
        assert_eq!(records.len(), 3);
        assert!(matches!(reader.end_state(), ScanEnd::CorruptSuffix(_)));
    }

    #[test]
    fn test_zeroed_tail_tolerated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");
        write_simple_txn(&path);

        append_bytes(&path, &[0u8; 256]);

        let mut reader = WalReader::open(&path).unwrap();
        let records = reader.read_all().unwrap();
        assert_eq!(records.len(), 3);
        // Type byte 0 is unknown, so the zeroed region is a corrupt suffix.
        assert!(matches!(reader.end_state(), ScanEnd::CorruptSuffix(_)));
    }

    #[test]
    fn test_corrupt_record_ends_scan() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");
        write_simple_txn(&path);

        // Flip a byte inside the second record's payload.
        let mut bytes = std::fs::read(&path).unwrap();
        let offset = WAL_HEADER_SIZE + RECORD_HEADER_SIZE + RECORD_HEADER_SIZE + 5;
        bytes[offset] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let mut reader = WalReader::open(&path).unwrap();
        let records = reader.read_all().unwrap();
        // Only the first record survives; the corrupt one and everything
        // after are dropped.
        assert_eq!(records.len(), 1);
        assert_eq!(
            reader.truncated_at(),
            Some((WAL_HEADER_SIZE + RECORD_HEADER_SIZE) as Lsn)
        );
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");
        std::fs::write(&path, vec![0u8; 128]).unwrap();
        assert!(matches!(
            WalReader::open(&path),
            Err(FolioError::Corrupted(_))
        ));
    }

    #[test]
    fn test_future_version_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.wal");
        write_simple_txn(&path);

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[4..8].copy_from_slice(&42u32.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            WalReader::open(&path),
            Err(FolioError::VersionMismatch { found: 42, .. })
        ));
    }
}
