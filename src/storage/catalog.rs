//! Catalog page codec.
//!
//! One Schema-type page holds the collection name, the ordered list of data
//! pages, and the entity index mapping logical id to (page, slot). The page
//! is rewritten whole on every flush. A catalog that no longer fits in one
//! page is a hard error; chaining is intentionally not implemented.
//!
//! Body layout after the page header (little-endian):
//!   name_len u16 | name bytes
//!   data_page_count u32 | page_id u32 ...
//!   entity_count u32 | (id_len u16 | id bytes | page_id u32 | slot u16) ...

use std::collections::BTreeMap;

use crate::error::{FolioError, Result};
use crate::storage::page::{Page, PageId, PAGE_HEADER_SIZE};
use crate::storage::slotted::SlotId;

#[derive(Debug, Clone)]
pub struct Catalog {
    pub name: String,
    pub data_pages: Vec<PageId>,
    pub entities: BTreeMap<String, (PageId, SlotId)>,
}

impl Catalog {
    pub fn new(name: &str) -> Self {
        Catalog {
            name: name.to_string(),
            data_pages: Vec::new(),
            entities: BTreeMap::new(),
        }
    }

    fn encoded_len(&self) -> usize {
        let mut len = 2 + self.name.len() + 4 + self.data_pages.len() * 4 + 4;
        for id in self.entities.keys() {
            len += 2 + id.len() + 4 + 2;
        }
        len
    }

    /// Serialize into the body of a catalog page.
    pub fn encode_into(&self, page: &mut Page) -> Result<()> {
        let capacity = page.size() - PAGE_HEADER_SIZE;
        if self.encoded_len() > capacity {
            return Err(FolioError::CatalogOverflow);
        }

        let mut off = PAGE_HEADER_SIZE;
        page.put_u16(off, self.name.len() as u16);
        off += 2;
        page.put_bytes(off, self.name.as_bytes());
        off += self.name.len();

        page.put_u32(off, self.data_pages.len() as u32);
        off += 4;
        for &page_id in &self.data_pages {
            page.put_u32(off, page_id);
            off += 4;
        }

        page.put_u32(off, self.entities.len() as u32);
        off += 4;
        for (id, &(page_id, slot)) in &self.entities {
            page.put_u16(off, id.len() as u16);
            off += 2;
            page.put_bytes(off, id.as_bytes());
            off += id.len();
            page.put_u32(off, page_id);
            off += 4;
            page.put_u16(off, slot);
            off += 2;
        }

        // Zero the tail so stale entries from a larger previous catalog
        // cannot survive.
        let tail = vec![0u8; page.size() - off];
        page.put_bytes(off, &tail);
        Ok(())
    }

    pub fn decode_from(page: &Page) -> Result<Catalog> {
        let corrupt = |what: &str| FolioError::Corrupted(format!("catalog page: {}", what));
        let end = page.size();
        let mut off = PAGE_HEADER_SIZE;

        let need = |off: usize, n: usize| -> Result<()> {
            if off + n > end {
                Err(corrupt("truncated"))
            } else {
                Ok(())
            }
        };

        need(off, 2)?;
        let name_len = page.get_u16(off) as usize;
        off += 2;
        need(off, name_len)?;
        let name = std::str::from_utf8(page.bytes(off, name_len))
            .map_err(|_| corrupt("name is not valid UTF-8"))?
            .to_string();
        off += name_len;

        need(off, 4)?;
        let page_count = page.get_u32(off) as usize;
        off += 4;
        need(off, page_count * 4)?;
        let mut data_pages = Vec::with_capacity(page_count);
        for _ in 0..page_count {
            data_pages.push(page.get_u32(off));
            off += 4;
        }

        need(off, 4)?;
        let entity_count = page.get_u32(off) as usize;
        off += 4;
        let mut entities = BTreeMap::new();
        for _ in 0..entity_count {
            need(off, 2)?;
            let id_len = page.get_u16(off) as usize;
            off += 2;
            need(off, id_len + 6)?;
            let id = std::str::from_utf8(page.bytes(off, id_len))
                .map_err(|_| corrupt("entity id is not valid UTF-8"))?
                .to_string();
            off += id_len;
            let page_id = page.get_u32(off);
            off += 4;
            let slot = page.get_u16(off);
            off += 2;
            entities.insert(id, (page_id, slot));
        }

        Ok(Catalog {
            name,
            data_pages,
            entities,
        })
    }
}
