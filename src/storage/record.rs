//! Per-record framing over the CBOR document bytes.
//!
//! On-page form: id_length u16 | id bytes | data_length u32 | data bytes.
//! Data bytes are the document's CBOR, optionally sealed with AES-GCM when
//! the storage is encrypted. The frame invariant
//! `2 + id_len + 4 + data_len == slot length` is checked on decode.

use crate::crypto::{EncryptionKey, RecordCrypto};
use crate::error::{FolioError, Result};
use crate::value::{decode_document, encode_document, Document};

pub struct RecordCodec {
    crypto: Option<RecordCrypto>,
    max_entity_size: usize,
}

impl RecordCodec {
    pub fn new(key: Option<&EncryptionKey>, max_entity_size: usize) -> Self {
        RecordCodec {
            crypto: key.map(RecordCrypto::new),
            max_entity_size,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.crypto.is_some()
    }

    /// Serialize a record to its framed on-page bytes.
    pub fn encode(&self, id: &str, doc: &Document) -> Result<Vec<u8>> {
        let id_bytes = id.as_bytes();
        if id_bytes.is_empty() || id_bytes.len() > u16::MAX as usize {
            return Err(FolioError::OutOfRange(format!(
                "entity id length {} outside 1..={}",
                id_bytes.len(),
                u16::MAX
            )));
        }

        let mut data = encode_document(doc)?;
        if let Some(crypto) = &self.crypto {
            data = crypto.encrypt(&data)?;
        }

        let total = 2 + id_bytes.len() + 4 + data.len();
        if total > self.max_entity_size {
            return Err(FolioError::EntityTooLarge {
                size: total,
                limit: self.max_entity_size,
            });
        }

        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&(id_bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(id_bytes);
        buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&data);
        Ok(buf)
    }

    /// Parse framed bytes back into (id, document).
    pub fn decode(&self, bytes: &[u8]) -> Result<(String, Document)> {
        let (id, data) = split_frame(bytes)?;

        let plain;
        let cbor = match &self.crypto {
            Some(crypto) => {
                plain = crypto.decrypt(data)?;
                plain.as_slice()
            }
            None => data,
        };

        Ok((id.to_string(), decode_document(cbor)?))
    }

    /// Parse only the id out of framed bytes.
    pub fn decode_id<'a>(&self, bytes: &'a [u8]) -> Result<&'a str> {
        Ok(split_frame(bytes)?.0)
    }
}

fn split_frame(bytes: &[u8]) -> Result<(&str, &[u8])> {
    if bytes.len() < 6 {
        return Err(FolioError::Corrupted("record frame truncated".into()));
    }
    let id_len = u16::from_le_bytes(bytes[0..2].try_into().unwrap()) as usize;
    if bytes.len() < 2 + id_len + 4 {
        return Err(FolioError::Corrupted("record id truncated".into()));
    }
    let id = std::str::from_utf8(&bytes[2..2 + id_len])
        .map_err(|_| FolioError::Corrupted("record id is not valid UTF-8".into()))?;

    let data_off = 2 + id_len + 4;
    let data_len =
        u32::from_le_bytes(bytes[2 + id_len..data_off].try_into().unwrap()) as usize;
    if bytes.len() != data_off + data_len {
        return Err(FolioError::Corrupted(format!(
            "record frame length mismatch: {} != {}",
            bytes.len(),
            data_off + data_len
        )));
    }
    Ok((id, &bytes[data_off..]))
}
