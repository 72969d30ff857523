//! Fixed-size page with a 16-byte header and CRC32 body checksum.
//!
//! Header layout (little-endian):
//!   page_id:            u32 (0..4)
//!   page_type:          u8  (4)
//!   flags:              u8  (5)
//!   free_space_offset:  u16 (6..8)
//!   checksum:           u32 (8..12), CRC32 of the page excluding this field
//!   reserved:           u32 (12..16)

use crate::error::{FolioError, Result};

pub type PageId = u32;

pub const PAGE_HEADER_SIZE: usize = 16;

const CHECKSUM_OFFSET: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Header,
    Data,
    BtreeIndex,
    Overflow,
    FreeList,
    Schema,
    Wal,
    Unknown,
}

impl PageType {
    pub fn as_u8(self) -> u8 {
        match self {
            PageType::Header => 0,
            PageType::Data => 1,
            PageType::BtreeIndex => 2,
            PageType::Overflow => 3,
            PageType::FreeList => 4,
            PageType::Schema => 5,
            PageType::Wal => 6,
            PageType::Unknown => 255,
        }
    }

    pub fn from_u8(value: u8) -> PageType {
        match value {
            0 => PageType::Header,
            1 => PageType::Data,
            2 => PageType::BtreeIndex,
            3 => PageType::Overflow,
            4 => PageType::FreeList,
            5 => PageType::Schema,
            6 => PageType::Wal,
            _ => PageType::Unknown,
        }
    }
}

#[derive(Clone)]
pub struct Page {
    data: Vec<u8>,
}

impl Page {
    /// A zeroed page with the header initialized for the given id and type.
    pub fn new(page_id: PageId, page_type: PageType, page_size: usize) -> Self {
        let mut page = Page {
            data: vec![0u8; page_size],
        };
        page.set_page_id(page_id);
        page.set_page_type(page_type);
        page.set_free_space_offset(PAGE_HEADER_SIZE as u16);
        page
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Page { data }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    // --- Header accessors ---

    pub fn page_id(&self) -> PageId {
        self.get_u32(0)
    }

    pub fn set_page_id(&mut self, id: PageId) {
        self.put_u32(0, id);
    }

    pub fn page_type(&self) -> PageType {
        PageType::from_u8(self.data[4])
    }

    pub fn set_page_type(&mut self, page_type: PageType) {
        self.data[4] = page_type.as_u8();
    }

    pub fn flags(&self) -> u8 {
        self.data[5]
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.data[5] = flags;
    }

    pub fn free_space_offset(&self) -> u16 {
        self.get_u16(6)
    }

    pub fn set_free_space_offset(&mut self, offset: u16) {
        self.put_u16(6, offset);
    }

    pub fn stored_checksum(&self) -> u32 {
        self.get_u32(CHECKSUM_OFFSET)
    }

    // --- Checksum ---

    /// CRC32 over the whole page excluding the checksum field itself.
    pub fn compute_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.data[..CHECKSUM_OFFSET]);
        hasher.update(&self.data[CHECKSUM_OFFSET + 4..]);
        hasher.finalize()
    }

    pub fn update_checksum(&mut self) {
        let crc = self.compute_checksum();
        self.put_u32(CHECKSUM_OFFSET, crc);
    }

    pub fn verify_checksum(&self) -> Result<()> {
        let stored = self.stored_checksum();
        let computed = self.compute_checksum();
        if stored != computed {
            return Err(FolioError::Corrupted(format!(
                "checksum mismatch on page {}: stored {:#010x}, computed {:#010x}",
                self.page_id(),
                stored,
                computed
            )));
        }
        Ok(())
    }

    // --- Raw access ---

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn get_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes(self.data[offset..offset + 2].try_into().unwrap())
    }

    pub(crate) fn put_u16(&mut self, offset: usize, value: u16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn get_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.data[offset..offset + 4].try_into().unwrap())
    }

    pub(crate) fn put_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    pub(crate) fn put_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("page_id", &self.page_id())
            .field("page_type", &self.page_type())
            .field("free_space_offset", &self.free_space_offset())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_page_header() {
        let page = Page::new(42, PageType::Data, 4096);
        assert_eq!(page.page_id(), 42);
        assert_eq!(page.page_type(), PageType::Data);
        assert_eq!(page.free_space_offset(), PAGE_HEADER_SIZE as u16);
        assert_eq!(page.size(), 4096);
    }

    #[test]
    fn test_checksum_roundtrip() {
        let mut page = Page::new(1, PageType::Data, 4096);
        page.put_bytes(100, b"payload");
        page.update_checksum();
        page.verify_checksum().unwrap();
    }

    #[test]
    fn test_checksum_detects_flip() {
        let mut page = Page::new(1, PageType::Data, 4096);
        page.update_checksum();

        let mut bytes = page.as_bytes().to_vec();
        bytes[2000] ^= 0xFF;
        let tampered = Page::from_bytes(bytes);
        assert!(matches!(
            tampered.verify_checksum(),
            Err(FolioError::Corrupted(_))
        ));
    }

    #[test]
    fn test_checksum_excludes_own_field() {
        let mut page = Page::new(7, PageType::Schema, 4096);
        let before = page.compute_checksum();
        page.update_checksum();
        assert_eq!(before, page.compute_checksum());
    }

    #[test]
    fn test_page_type_codes() {
        assert_eq!(PageType::Header.as_u8(), 0);
        assert_eq!(PageType::Data.as_u8(), 1);
        assert_eq!(PageType::FreeList.as_u8(), 4);
        assert_eq!(PageType::Schema.as_u8(), 5);
        assert_eq!(PageType::from_u8(255), PageType::Unknown);
        assert_eq!(PageType::from_u8(99), PageType::Unknown);
        for t in [
            PageType::Header,
            PageType::Data,
            PageType::BtreeIndex,
            PageType::Overflow,
            PageType::FreeList,
            PageType::Schema,
            PageType::Wal,
        ] {
            assert_eq!(PageType::from_u8(t.as_u8()), t);
        }
    }
}
