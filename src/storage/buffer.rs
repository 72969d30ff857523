//! Fixed-capacity page cache with pin counts, dirty tracking and LRU
//! eviction.
//!
//! The pool is the only path between components and mutable pages. A frame
//! stays resident while its pin count is non-zero; unpinned frames are
//! eviction candidates in least-recently-used order. Evicting a dirty frame
//! writes it through the pager first.

use std::collections::HashMap;

use lru::LruCache;

use crate::error::{FolioError, Result};
use crate::storage::page::{Page, PageId, PageType};
use crate::storage::pager::Pager;

struct Frame {
    page: Page,
    pins: u32,
    dirty: bool,
}

pub struct BufferPool {
    pager: Pager,
    capacity: usize,
    frames: HashMap<PageId, Frame>,
    /// Unpinned resident pages in recency order; victims pop from the LRU end.
    lru: LruCache<PageId, ()>,
    verify_checksums: bool,
}

impl BufferPool {
    pub fn new(pager: Pager, capacity: usize, verify_checksums: bool) -> Self {
        BufferPool {
            pager,
            capacity: capacity.max(1),
            frames: HashMap::new(),
            lru: LruCache::unbounded(),
            verify_checksums,
        }
    }

    pub fn pager(&mut self) -> &mut Pager {
        &mut self.pager
    }

    pub fn pager_ref(&self) -> &Pager {
        &self.pager
    }

    /// Fetch a page, pinning its frame. Every successful fetch must be
    /// paired with an `unpin` on all paths.
    pub fn fetch(&mut self, page_id: PageId) -> Result<Page> {
        if let Some(frame) = self.frames.get_mut(&page_id) {
            frame.pins += 1;
            self.lru.pop(&page_id);
            return Ok(frame.page.clone());
        }

        self.make_room()?;
        let page = self.pager.read(page_id, self.verify_checksums)?;
        self.frames.insert(
            page_id,
            Frame {
                page: page.clone(),
                pins: 1,
                dirty: false,
            },
        );
        Ok(page)
    }

    /// Allocate a fresh page through the pager. The frame starts pinned and
    /// dirty so an uninitialized page can never be dropped silently.
    pub fn allocate(&mut self, page_type: PageType) -> Result<Page> {
        self.make_room()?;
        let page = self.pager.allocate(page_type)?;
        self.frames.insert(
            page.page_id(),
            Frame {
                page: page.clone(),
                pins: 1,
                dirty: true,
            },
        );
        Ok(page)
    }

    /// Drop one pin. At zero pins the frame becomes an eviction candidate.
    pub fn unpin(&mut self, page_id: PageId) {
        if let Some(frame) = self.frames.get_mut(&page_id) {
            if frame.pins > 0 {
                frame.pins -= 1;
                if frame.pins == 0 {
                    self.lru.put(page_id, ());
                }
            }
        }
    }

    /// Store a modified copy back into its frame and mark it dirty.
    pub fn write(&mut self, page: &Page) {
        let page_id = page.page_id();
        if let Some(frame) = self.frames.get_mut(&page_id) {
            frame.page = page.clone();
            frame.dirty = true;
        } else {
            // Frame was evicted after the caller unpinned; re-admit it.
            self.frames.insert(
                page_id,
                Frame {
                    page: page.clone(),
                    pins: 0,
                    dirty: true,
                },
            );
            self.lru.put(page_id, ());
        }
    }

    pub fn mark_dirty(&mut self, page_id: PageId) {
        if let Some(frame) = self.frames.get_mut(&page_id) {
            frame.dirty = true;
        }
    }

    pub fn flush_page(&mut self, page_id: PageId) -> Result<()> {
        if let Some(frame) = self.frames.get_mut(&page_id) {
            if frame.dirty {
                self.pager.write(&mut frame.page)?;
                frame.dirty = false;
            }
        }
        Ok(())
    }

    /// Write back every dirty frame. Does not fsync; the pager flush does.
    pub fn flush_all(&mut self) -> Result<()> {
        let ids: Vec<PageId> = self
            .frames
            .iter()
            .filter(|(_, f)| f.dirty)
            .map(|(&id, _)| id)
            .collect();
        for id in ids {
            self.flush_page(id)?;
        }
        Ok(())
    }

    /// Drop the frame (must be unpinned) and return the page to the pager's
    /// free-list.
    pub fn free(&mut self, page_id: PageId) -> Result<()> {
        if let Some(frame) = self.frames.get(&page_id) {
            if frame.pins > 0 {
                return Err(FolioError::OutOfRange(format!(
                    "page {} freed while pinned",
                    page_id
                )));
            }
            self.frames.remove(&page_id);
            self.lru.pop(&page_id);
        }
        self.pager.free(page_id)
    }

    pub fn dirty_page_ids(&self) -> Vec<PageId> {
        let mut ids: Vec<PageId> = self
            .frames
            .iter()
            .filter(|(_, f)| f.dirty)
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn resident(&self) -> usize {
        self.frames.len()
    }

    fn make_room(&mut self) -> Result<()> {
        while self.frames.len() >= self.capacity {
            let (victim, _) = self.lru.pop_lru().ok_or(FolioError::CacheExhausted)?;
            let mut frame = self
                .frames
                .remove(&victim)
                .expect("lru entries always have a frame");
            if frame.dirty {
                self.pager.write(&mut frame.page)?;
            }
        }
        Ok(())
    }
}
