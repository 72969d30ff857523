//! Raw page file I/O: file header, page allocation, free-list.
//!
//! Page 0 holds the file header at fixed offsets; all other pages carry the
//! 16-byte page header and are read/written as whole units. Freed pages are
//! chained into a free-list whose head lives in the file header; the first
//! body word of a freed page points at the next free page.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use rand::RngCore;
use uuid::Uuid;

use crate::error::{FolioError, Result};
use crate::storage::page::{Page, PageId, PageType, PAGE_HEADER_SIZE};

pub const FILE_MAGIC: u32 = 0x4443_4442;
pub const FILE_VERSION: u32 = 1;
const MIN_SUPPORTED_VERSION: u32 = 1;
const MAX_SUPPORTED_VERSION: u32 = 1;

/// Fixed header fields plus the database id stored in the reserved region.
pub const FILE_HEADER_SIZE: usize = 80;

/// Offset of the first body word in a free-list page (next free page id).
const FREE_NEXT_OFFSET: usize = PAGE_HEADER_SIZE;

pub const FLAG_ENCRYPTED: u32 = 0x01;
pub const FLAG_COMPRESSED: u32 = 0x02;
pub const FLAG_DIRTY_SHUTDOWN: u32 = 0x04;
pub const FLAG_WAL_ENABLED: u32 = 0x08;

// Offsets of the header fields updated in place after creation.
const OFF_PAGE_COUNT: u64 = 12;
const OFF_FREE_LIST_HEAD: u64 = 16;
const OFF_FREE_PAGE_COUNT: u64 = 20;
const OFF_SCHEMA_ROOT: u64 = 24;
const OFF_MODIFIED_AT: u64 = 36;
const OFF_FLAGS: u64 = 60;

#[derive(Debug, Clone)]
pub struct FileHeader {
    pub version: u32,
    pub page_size: u32,
    pub page_count: u32,
    pub free_list_head: PageId,
    pub free_page_count: u32,
    pub schema_root: PageId,
    pub created_at: i64,
    pub modified_at: i64,
    pub salt: [u8; 16],
    pub flags: u32,
    pub database_id: Uuid,
}

impl FileHeader {
    fn new(page_size: u32) -> Self {
        let now = Utc::now().timestamp();
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        FileHeader {
            version: FILE_VERSION,
            page_size,
            page_count: 1,
            free_list_head: 0,
            free_page_count: 0,
            schema_root: 0,
            created_at: now,
            modified_at: now,
            salt,
            flags: FLAG_DIRTY_SHUTDOWN,
            database_id: Uuid::new_v4(),
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&FILE_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.page_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.page_count.to_le_bytes());
        buf[16..20].copy_from_slice(&self.free_list_head.to_le_bytes());
        buf[20..24].copy_from_slice(&self.free_page_count.to_le_bytes());
        buf[24..28].copy_from_slice(&self.schema_root.to_le_bytes());
        buf[28..36].copy_from_slice(&self.created_at.to_le_bytes());
        buf[36..44].copy_from_slice(&self.modified_at.to_le_bytes());
        buf[44..60].copy_from_slice(&self.salt);
        buf[60..64].copy_from_slice(&self.flags.to_le_bytes());
        buf[64..80].copy_from_slice(self.database_id.as_bytes());
    }

    fn decode(buf: &[u8]) -> Result<FileHeader> {
        if buf.len() < FILE_HEADER_SIZE {
            return Err(FolioError::Corrupted("file header truncated".into()));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != FILE_MAGIC {
            return Err(FolioError::Corrupted(format!(
                "bad file magic {:#010x}",
                magic
            )));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if !(MIN_SUPPORTED_VERSION..=MAX_SUPPORTED_VERSION).contains(&version) {
            return Err(FolioError::VersionMismatch {
                found: version,
                min: MIN_SUPPORTED_VERSION,
                max: MAX_SUPPORTED_VERSION,
            });
        }
        let mut salt = [0u8; 16];
        salt.copy_from_slice(&buf[44..60]);
        let mut db_id = [0u8; 16];
        db_id.copy_from_slice(&buf[64..80]);
        Ok(FileHeader {
            version,
            page_size: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            page_count: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            free_list_head: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            free_page_count: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            schema_root: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            created_at: i64::from_le_bytes(buf[28..36].try_into().unwrap()),
            modified_at: i64::from_le_bytes(buf[36..44].try_into().unwrap()),
            salt,
            flags: u32::from_le_bytes(buf[60..64].try_into().unwrap()),
            database_id: Uuid::from_bytes(db_id),
        })
    }

    pub fn is_dirty_shutdown(&self) -> bool {
        self.flags & FLAG_DIRTY_SHUTDOWN != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }
}

pub struct Pager {
    file: File,
    #[allow(dead_code)]
    path: PathBuf,
    header: FileHeader,
    page_size: usize,
    read_only: bool,
    verify_checksums: bool,
}

impl Pager {
    /// Open a page file, creating and initializing it when absent or empty.
    /// For an existing file the recorded page size wins over `page_size`.
    pub fn open(
        path: &Path,
        page_size: u32,
        read_only: bool,
        verify_checksums: bool,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(path)?;
        let file_len = file.metadata()?.len();

        if file_len == 0 {
            if read_only {
                return Err(FolioError::NotOpen);
            }
            let header = FileHeader::new(page_size);
            let mut pager = Pager {
                file,
                path: path.to_path_buf(),
                header,
                page_size: page_size as usize,
                read_only,
                verify_checksums,
            };
            pager.write_header()?;
            pager.flush()?;
            Ok(pager)
        } else {
            let mut pager = Pager {
                file,
                path: path.to_path_buf(),
                header: FileHeader::new(page_size),
                page_size: page_size as usize,
                read_only,
                verify_checksums,
            };
            pager.header = pager.read_header()?;
            pager.page_size = pager.header.page_size as usize;
            Ok(pager)
        }
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Re-read the file header from disk.
    pub fn read_header(&mut self) -> Result<FileHeader> {
        let mut buf = [0u8; FILE_HEADER_SIZE];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut buf)?;
        FileHeader::decode(&buf)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> u32 {
        self.header.page_count
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Allocate a page, preferring the free-list head over extending the
    /// file. The returned page is freshly initialized and not yet on disk;
    /// the caller owns writing it back.
    pub fn allocate(&mut self, page_type: PageType) -> Result<Page> {
        self.check_writable()?;

        let page_id = if self.header.free_list_head != 0 {
            let free_id = self.header.free_list_head;
            let free_page = self.read(free_id, self.verify_checksums)?;
            let next = free_page.get_u32(FREE_NEXT_OFFSET);
            self.header.free_list_head = next;
            self.header.free_page_count = self.header.free_page_count.saturating_sub(1);
            self.persist_u32(OFF_FREE_LIST_HEAD, next)?;
            self.persist_u32(OFF_FREE_PAGE_COUNT, self.header.free_page_count)?;
            free_id
        } else {
            let id = self.header.page_count;
            self.header.page_count += 1;
            self.persist_u32(OFF_PAGE_COUNT, self.header.page_count)?;
            // Extend the file so a read of the new id cannot hit EOF before
            // the first write-back.
            self.file
                .set_len(self.header.page_count as u64 * self.page_size as u64)?;
            id
        };

        Ok(Page::new(page_id, page_type, self.page_size))
    }

    /// Push a page onto the free-list. Page 0 is the file header and can
    /// never be freed.
    pub fn free(&mut self, page_id: PageId) -> Result<()> {
        self.check_writable()?;
        if page_id == 0 {
            return Err(FolioError::OutOfRange("page 0 cannot be freed".into()));
        }
        if page_id >= self.header.page_count {
            return Err(FolioError::OutOfRange(format!(
                "page {} beyond page count {}",
                page_id, self.header.page_count
            )));
        }

        let mut page = Page::new(page_id, PageType::FreeList, self.page_size);
        page.put_u32(FREE_NEXT_OFFSET, self.header.free_list_head);
        self.write(&mut page)?;

        self.header.free_list_head = page_id;
        self.header.free_page_count += 1;
        self.persist_u32(OFF_FREE_LIST_HEAD, page_id)?;
        self.persist_u32(OFF_FREE_PAGE_COUNT, self.header.free_page_count)?;
        Ok(())
    }

    /// Read one page. Verifies the stored page id and, when requested, the
    /// body checksum.
    pub fn read(&mut self, page_id: PageId, verify_checksum: bool) -> Result<Page> {
        if page_id == 0 {
            return Err(FolioError::OutOfRange(
                "page 0 is the file header, not a data page".into(),
            ));
        }
        if page_id >= self.header.page_count {
            return Err(FolioError::OutOfRange(format!(
                "page {} beyond page count {}",
                page_id, self.header.page_count
            )));
        }

        let mut buf = vec![0u8; self.page_size];
        self.file
            .seek(SeekFrom::Start(page_id as u64 * self.page_size as u64))?;
        self.file.read_exact(&mut buf)?;

        let page = Page::from_bytes(buf);
        if page.page_id() != page_id {
            return Err(FolioError::Corrupted(format!(
                "page id mismatch: expected {}, header says {}",
                page_id,
                page.page_id()
            )));
        }
        if verify_checksum {
            page.verify_checksum()?;
        }
        Ok(page)
    }

    /// Write one page, refreshing its checksum first.
    pub fn write(&mut self, page: &mut Page) -> Result<()> {
        self.check_writable()?;
        let page_id = page.page_id();
        if page_id == 0 {
            return Err(FolioError::OutOfRange(
                "page 0 is written through header updates only".into(),
            ));
        }
        if page_id >= self.header.page_count {
            return Err(FolioError::OutOfRange(format!(
                "page {} beyond page count {}",
                page_id, self.header.page_count
            )));
        }
        if page.size() != self.page_size {
            return Err(FolioError::OutOfRange(format!(
                "page size {} does not match file page size {}",
                page.size(),
                self.page_size
            )));
        }

        page.update_checksum();
        self.file
            .seek(SeekFrom::Start(page_id as u64 * self.page_size as u64))?;
        self.file.write_all(page.as_bytes())?;
        Ok(())
    }

    pub fn write_many(&mut self, pages: &mut [Page]) -> Result<()> {
        for page in pages {
            self.write(page)?;
        }
        Ok(())
    }

    // --- Field-level header updates ---

    pub fn set_schema_root(&mut self, page_id: PageId) -> Result<()> {
        self.header.schema_root = page_id;
        self.persist_u32(OFF_SCHEMA_ROOT, page_id)
    }

    pub fn set_dirty_shutdown(&mut self, dirty: bool) -> Result<()> {
        if dirty {
            self.header.flags |= FLAG_DIRTY_SHUTDOWN;
        } else {
            self.header.flags &= !FLAG_DIRTY_SHUTDOWN;
        }
        self.persist_u32(OFF_FLAGS, self.header.flags)
    }

    pub fn set_flag(&mut self, flag: u32, on: bool) -> Result<()> {
        if on {
            self.header.flags |= flag;
        } else {
            self.header.flags &= !flag;
        }
        self.persist_u32(OFF_FLAGS, self.header.flags)
    }

    pub fn touch_modified(&mut self) -> Result<()> {
        self.header.modified_at = Utc::now().timestamp();
        self.check_writable()?;
        self.file.seek(SeekFrom::Start(OFF_MODIFIED_AT))?;
        self.file.write_all(&self.header.modified_at.to_le_bytes())?;
        Ok(())
    }

    /// fsync the page file.
    pub fn flush(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        if !self.read_only {
            self.flush()?;
        }
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        self.check_writable()?;
        let mut page = vec![0u8; self.page_size];
        self.header.encode(&mut page);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&page)?;
        Ok(())
    }

    fn persist_u32(&mut self, offset: u64, value: u32) -> Result<()> {
        self.check_writable()?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(FolioError::ReadOnly);
        }
        Ok(())
    }
}
