//! WAL record codec.
//!
//! Record header, 34 bytes little-endian:
//!   type u8 | flags u8 | txn_id i64 | lsn i64 | prev_lsn i64 |
//!   payload_len u32 | crc32 u32
//!
//! The CRC covers every header field except itself, then the payload.
//! `prev_lsn` links a transaction's records for undo chaining; it is
//! `INVALID_LSN` for a transaction's first record and for system records.
//! Data-operation and checkpoint payloads are CBOR.

use crate::error::{FolioError, Result};
use crate::storage::page::PageId;
use crate::value::{decode_document, encode_document, Document, Value};
use crate::wal::{Lsn, TxnId, INVALID_LSN, RECORD_HEADER_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalRecordType {
    Begin,
    Commit,
    Abort,
    Insert,
    Update,
    Delete,
    Checkpoint,
    PageWrite,
    Compensation,
    EndOfLog,
}

impl WalRecordType {
    pub fn as_u8(self) -> u8 {
        match self {
            WalRecordType::Begin => 1,
            WalRecordType::Commit => 2,
            WalRecordType::Abort => 3,
            WalRecordType::Insert => 4,
            WalRecordType::Update => 5,
            WalRecordType::Delete => 6,
            WalRecordType::Checkpoint => 7,
            WalRecordType::PageWrite => 8,
            WalRecordType::Compensation => 9,
            WalRecordType::EndOfLog => 255,
        }
    }

    pub fn from_u8(value: u8) -> Option<WalRecordType> {
        Some(match value {
            1 => WalRecordType::Begin,
            2 => WalRecordType::Commit,
            3 => WalRecordType::Abort,
            4 => WalRecordType::Insert,
            5 => WalRecordType::Update,
            6 => WalRecordType::Delete,
            7 => WalRecordType::Checkpoint,
            8 => WalRecordType::PageWrite,
            9 => WalRecordType::Compensation,
            255 => WalRecordType::EndOfLog,
            _ => return None,
        })
    }

    pub fn is_data_operation(self) -> bool {
        matches!(
            self,
            WalRecordType::Insert | WalRecordType::Update | WalRecordType::Delete
        )
    }
}

#[derive(Debug, Clone)]
pub struct WalRecord {
    pub record_type: WalRecordType,
    pub flags: u8,
    pub txn_id: TxnId,
    pub lsn: Lsn,
    pub prev_lsn: Lsn,
    pub payload: Vec<u8>,
}

impl WalRecord {
    /// A record awaiting its LSN from the writer.
    pub fn new(record_type: WalRecordType, txn_id: TxnId, prev_lsn: Lsn, payload: Vec<u8>) -> Self {
        WalRecord {
            record_type,
            flags: 0,
            txn_id,
            lsn: INVALID_LSN,
            prev_lsn,
            payload,
        }
    }

    /// A system record that belongs to no transaction.
    pub fn system(record_type: WalRecordType, payload: Vec<u8>) -> Self {
        WalRecord::new(record_type, 0, INVALID_LSN, payload)
    }

    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(self.record_type.as_u8());
        buf.push(self.flags);
        buf.extend_from_slice(&self.txn_id.to_le_bytes());
        buf.extend_from_slice(&self.lsn.to_le_bytes());
        buf.extend_from_slice(&self.prev_lsn.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        let crc = record_crc(&buf[..RECORD_HEADER_SIZE - 4], &self.payload);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse a header. Returns (record-sans-payload, payload_len, stored_crc)
    /// or `None` when the type byte is unknown.
    pub fn decode_header(header: &[u8; RECORD_HEADER_SIZE]) -> Option<(WalRecord, usize, u32)> {
        let record_type = WalRecordType::from_u8(header[0])?;
        let payload_len = u32::from_le_bytes(header[26..30].try_into().unwrap()) as usize;
        let stored_crc = u32::from_le_bytes(header[30..34].try_into().unwrap());
        let record = WalRecord {
            record_type,
            flags: header[1],
            txn_id: i64::from_le_bytes(header[2..10].try_into().unwrap()),
            lsn: i64::from_le_bytes(header[10..18].try_into().unwrap()),
            prev_lsn: i64::from_le_bytes(header[18..26].try_into().unwrap()),
            payload: Vec::new(),
        };
        Some((record, payload_len, stored_crc))
    }
}

/// CRC32 over the header bytes preceding the crc field, then the payload.
pub fn record_crc(header_prefix: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header_prefix);
    hasher.update(payload);
    hasher.finalize()
}

/// Payload of insert/update/delete records: `{collection, entityId,
/// before?, after?}` as a CBOR map. Insert carries only `after`, delete
/// only `before`, update both.
#[derive(Debug, Clone, PartialEq)]
pub struct DataOp {
    pub collection: String,
    pub entity_id: String,
    pub before: Option<Document>,
    pub after: Option<Document>,
}

impl DataOp {
    pub fn insert(collection: &str, entity_id: &str, after: Document) -> Self {
        DataOp {
            collection: collection.to_string(),
            entity_id: entity_id.to_string(),
            before: None,
            after: Some(after),
        }
    }

    pub fn update(collection: &str, entity_id: &str, before: Document, after: Document) -> Self {
        DataOp {
            collection: collection.to_string(),
            entity_id: entity_id.to_string(),
            before: Some(before),
            after: Some(after),
        }
    }

    pub fn delete(collection: &str, entity_id: &str, before: Document) -> Self {
        DataOp {
            collection: collection.to_string(),
            entity_id: entity_id.to_string(),
            before: Some(before),
            after: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut map = Document::new();
        map.insert("collection".into(), Value::String(self.collection.clone()));
        map.insert("entityId".into(), Value::String(self.entity_id.clone()));
        if let Some(before) = &self.before {
            map.insert("before".into(), Value::Map(before.clone()));
        }
        if let Some(after) = &self.after {
            map.insert("after".into(), Value::Map(after.clone()));
        }
        encode_document(&map)
    }

    pub fn decode(bytes: &[u8]) -> Result<DataOp> {
        let mut map = decode_document(bytes)?;
        let text = |map: &mut Document, key: &str| -> Result<String> {
            match map.remove(key) {
                Some(Value::String(s)) => Ok(s),
                other => Err(FolioError::Corrupted(format!(
                    "data operation payload: bad {:?} field: {:?}",
                    key, other
                ))),
            }
        };
        let image = |map: &mut Document, key: &str| -> Result<Option<Document>> {
            match map.remove(key) {
                None => Ok(None),
                Some(Value::Map(doc)) => Ok(Some(doc)),
                other => Err(FolioError::Corrupted(format!(
                    "data operation payload: bad {:?} field: {:?}",
                    key, other
                ))),
            }
        };

        Ok(DataOp {
            collection: text(&mut map, "collection")?,
            entity_id: text(&mut map, "entityId")?,
            before: image(&mut map, "before")?,
            after: image(&mut map, "after")?,
        })
    }
}

/// Payload of a checkpoint record: the active transaction set and the dirty
/// page list at the checkpoint instant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointData {
    pub active_transactions: Vec<TxnId>,
    pub dirty_pages: Vec<PageId>,
}

impl CheckpointData {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut map = Document::new();
        map.insert(
            "activeTransactions".into(),
            Value::Array(self.active_transactions.iter().map(|&t| Value::Int(t)).collect()),
        );
        map.insert(
            "dirtyPages".into(),
            Value::Array(
                self.dirty_pages
                    .iter()
                    .map(|&p| Value::Int(p as i64))
                    .collect(),
            ),
        );
        encode_document(&map)
    }

    pub fn decode(bytes: &[u8]) -> Result<CheckpointData> {
        let map = decode_document(bytes)?;
        let ints = |key: &str| -> Result<Vec<i64>> {
            match map.get(key) {
                Some(Value::Array(items)) => items
                    .iter()
                    .map(|v| {
                        v.as_i64().ok_or_else(|| {
                            FolioError::Corrupted(format!("checkpoint payload: bad {:?} item", key))
                        })
                    })
                    .collect(),
                _ => Err(FolioError::Corrupted(format!(
                    "checkpoint payload: missing {:?}",
                    key
                ))),
            }
        };
        Ok(CheckpointData {
            active_transactions: ints("activeTransactions")?,
            dirty_pages: ints("dirtyPages")?
                .into_iter()
                .map(|p| p as PageId)
                .collect(),
        })
    }
}
