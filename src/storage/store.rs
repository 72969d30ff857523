//! Paged document storage: the CRUD face over the pager, buffer pool,
//! slotted pages, catalog, and WAL.
//!
//! One collection per file. Writes are serialized behind a storage-wide
//! mutex; at most one transaction is active at a time. Non-transactional
//! mutations reach pages immediately and become durable on flush/close;
//! transactional mutations buffer in memory, reach the WAL at commit, and
//! materialize only after the commit record is durable.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::concurrency::StorageLock;
use crate::config::StorageOptions;
use crate::error::{FolioError, Result};
use crate::storage::buffer::BufferPool;
use crate::storage::catalog::Catalog;
use crate::storage::page::{PageId, PageType};
use crate::storage::pager::{Pager, FLAG_ENCRYPTED, FLAG_WAL_ENABLED};
use crate::storage::record::RecordCodec;
use crate::value::Document;
use crate::wal::record::{CheckpointData, DataOp, WalRecord, WalRecordType};
use crate::wal::recovery::{Recovery, RecoveryHandler, RecoveryReport};
use crate::wal::writer::{read_segment_header, WalWriter};
use crate::wal::{Lsn, TxnId, INVALID_LSN};

/// Buffered state of the single active transaction.
struct TxnState {
    id: TxnId,
    /// Tail of the prev-lsn chain.
    last_lsn: Lsn,
    pending_inserts: BTreeMap<String, Document>,
    pending_updates: BTreeMap<String, Document>,
    /// Before images for updates and deletes.
    original: BTreeMap<String, Document>,
    /// Ids that exist in the committed store and are deleted in this txn.
    deleted: BTreeSet<String>,
}

impl TxnState {
    fn new(id: TxnId, begin_lsn: Lsn) -> Self {
        TxnState {
            id,
            last_lsn: begin_lsn,
            pending_inserts: BTreeMap::new(),
            pending_updates: BTreeMap::new(),
            original: BTreeMap::new(),
            deleted: BTreeSet::new(),
        }
    }
}

struct StoreInner {
    pool: BufferPool,
    wal: Option<WalWriter>,
    codec: RecordCodec,
    catalog: Catalog,
    catalog_page: PageId,
    options: StorageOptions,
    txn: Option<TxnState>,
    next_txn_id: TxnId,
    open: bool,
    /// Held for the storage lifetime; released at close.
    _lock: Option<StorageLock>,
}

/// An open document storage bound to one file and one collection.
pub struct PagedStorage {
    name: String,
    path: PathBuf,
    inner: Mutex<StoreInner>,
}

impl std::fmt::Debug for PagedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedStorage")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn wal_path(db_path: &Path) -> PathBuf {
    db_path.with_extension("wal")
}

/// Remove a recovered WAL segment and fsync the directory so the removal
/// survives a crash.
fn remove_file_durably(path: &Path) -> Result<()> {
    std::fs::remove_file(path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

impl PagedStorage {
    /// Open a storage file, creating it when absent. Recovery runs first
    /// when the previous shutdown was unclean and an unclean WAL segment
    /// exists; only then does the storage accept operations.
    pub fn open(path: &Path, collection: &str, options: StorageOptions) -> Result<Self> {
        options.validate()?;
        let lock = StorageLock::acquire(path)?;

        let pager = Pager::open(
            path,
            options.page_size,
            options.read_only,
            options.verify_checksums,
        )?;
        let was_dirty = pager.header().is_dirty_shutdown();
        let was_encrypted = pager.header().is_encrypted();
        let creating = pager.header().schema_root == 0;
        let database_id = pager.header().database_id;

        if !creating && was_encrypted != options.encryption_key.is_some() {
            // Key withheld from an encrypted file (or supplied for a plain
            // one): fail before any record is misread.
            return Err(FolioError::AuthenticationFailed
                .context(collection, "open"));
        }

        let codec = RecordCodec::new(options.encryption_key.as_ref(), options.max_entity_size);
        let mut pool = BufferPool::new(pager, options.buffer_pool_size, options.verify_checksums);

        // Load or initialize the catalog.
        let (catalog, catalog_page) = if creating {
            let catalog = Catalog::new(collection);
            let mut page = pool.allocate(PageType::Schema)?;
            let page_id = page.page_id();
            catalog.encode_into(&mut page)?;
            pool.write(&page);
            pool.unpin(page_id);
            pool.pager().set_schema_root(page_id)?;
            pool.pager().set_flag(FLAG_ENCRYPTED, codec.is_encrypted())?;
            (catalog, page_id)
        } else {
            let page_id = pool.pager_ref().header().schema_root;
            let page = pool.fetch(page_id)?;
            let catalog = Catalog::decode_from(&page);
            pool.unpin(page_id);
            (catalog?, page_id)
        };

        let mut inner = StoreInner {
            pool,
            wal: None,
            codec,
            catalog,
            catalog_page,
            options: options.clone(),
            txn: None,
            next_txn_id: 1,
            open: true,
            _lock: Some(lock),
        };

        // Crash recovery, before any mutation is accepted.
        let wp = wal_path(path);
        let mut prior_sequence = 0;
        if wp.exists() {
            match read_segment_header(&wp) {
                Ok(header) => {
                    prior_sequence = header.sequence;
                    if was_dirty && !header.is_clean_close() && options.read_only {
                        log::warn!(
                            "{}: unclean shutdown but opened read-only; skipping recovery",
                            collection
                        );
                    } else if was_dirty && !header.is_clean_close() {
                        let report = Self::recover(&mut inner, &wp, database_id)?;
                        log::info!(
                            "{}: recovered {} committed transaction(s), {} operation(s) redone",
                            collection,
                            report.committed.len(),
                            report.operations_redone
                        );
                    }
                }
                Err(e) => {
                    if was_dirty && options.recovery.throw_on_error {
                        return Err(FolioError::RecoveryFailed(format!(
                            "unreadable segment header: {}",
                            e
                        ))
                        .context(collection, "open"));
                    }
                    log::warn!("{}: ignoring unreadable WAL segment: {}", collection, e);
                }
            }
            if !options.read_only {
                if inner.options.recovery.delete_wal_after_recovery {
                    remove_file_durably(&wp)?;
                } else {
                    // Keep the recovered segment out of the way of the fresh
                    // one created below.
                    std::fs::rename(&wp, path.with_extension("wal.recovered"))?;
                }
            }
        }

        if !options.read_only {
            // Mark the file open; cleared again only by a clean close.
            inner.pool.pager().set_dirty_shutdown(true)?;
            inner
                .pool
                .pager()
                .set_flag(FLAG_WAL_ENABLED, options.enable_transactions)?;
            inner.pool.pager().flush()?;

            if options.enable_transactions {
                inner.wal = Some(WalWriter::create(
                    &wp,
                    database_id,
                    prior_sequence + 1,
                    &options.wal,
                )?);
            }
        }

        let name = inner.catalog.name.clone();
        log::debug!("{}: opened ({} entities)", name, inner.catalog.entities.len());
        Ok(PagedStorage {
            name,
            path: path.to_path_buf(),
            inner: Mutex::new(inner),
        })
    }

    fn recover(inner: &mut StoreInner, wp: &Path, database_id: uuid::Uuid) -> Result<RecoveryReport> {
        let recovery =
            Recovery::new(&inner.options.recovery).expect_database_id(database_id);
        let report = recovery.run(wp, inner, None)?;
        inner.flush_committed()?;
        Ok(report)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn supports_transactions(&self) -> bool {
        self.inner.lock().options.enable_transactions
    }

    // --- Reads ---

    pub fn get(&self, id: &str) -> Result<Option<Document>> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.get_visible(id).map_err(|e| e.context(&self.name, "get"))
    }

    pub fn exists(&self, id: &str) -> Result<bool> {
        let inner = self.inner.lock();
        inner.check_open()?;
        Ok(inner.is_visible(id))
    }

    pub fn get_many(&self, ids: &[&str]) -> Result<BTreeMap<String, Document>> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        let mut out = BTreeMap::new();
        for &id in ids {
            if let Some(doc) = inner
                .get_visible(id)
                .map_err(|e| e.context(&self.name, "get_many"))?
            {
                out.insert(id.to_string(), doc);
            }
        }
        Ok(out)
    }

    pub fn get_all(&self) -> Result<BTreeMap<String, Document>> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        let ids = inner.visible_ids();
        let mut out = BTreeMap::new();
        for id in ids {
            if let Some(doc) = inner
                .get_visible(&id)
                .map_err(|e| e.context(&self.name, "get_all"))?
            {
                out.insert(id, doc);
            }
        }
        Ok(out)
    }

    /// Lazy sequence of (id, document). The id set is snapshotted up front;
    /// documents are fetched one at a time as the iterator advances. Entries
    /// deleted between snapshot and visit are skipped.
    pub fn stream(&self) -> Result<impl Iterator<Item = Result<(String, Document)>> + '_> {
        let ids = {
            let inner = self.inner.lock();
            inner.check_open()?;
            inner.visible_ids()
        };
        Ok(ids.into_iter().filter_map(move |id| match self.get(&id) {
            Ok(Some(doc)) => Some(Ok((id, doc))),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }))
    }

    pub fn count(&self) -> Result<usize> {
        let inner = self.inner.lock();
        inner.check_open()?;
        let mut count = inner.catalog.entities.len();
        if let Some(txn) = &inner.txn {
            count += txn.pending_inserts.len();
            count -= txn.deleted.len();
        }
        Ok(count)
    }

    // --- Writes ---

    pub fn insert(&self, id: &str, doc: Document) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_writable()?;
        inner
            .insert_op(id, doc)
            .map_err(|e| e.context(&self.name, "insert"))
    }

    /// Insert a batch. Duplicate ids are rejected before any write; a
    /// mid-batch I/O failure leaves earlier entities in place.
    pub fn insert_many(&self, docs: BTreeMap<String, Document>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_writable()?;
        for id in docs.keys() {
            if inner.is_visible(id) {
                return Err(FolioError::AlreadyExists(id.clone())
                    .context(&self.name, "insert_many"));
            }
        }
        for (id, doc) in docs {
            inner
                .insert_op(&id, doc)
                .map_err(|e| e.context(&self.name, "insert_many"))?;
        }
        Ok(())
    }

    pub fn update(&self, id: &str, doc: Document) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_writable()?;
        inner
            .update_op(id, doc)
            .map_err(|e| e.context(&self.name, "update"))
    }

    pub fn upsert(&self, id: &str, doc: Document) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_writable()?;
        let result = if inner.is_visible(id) {
            inner.update_op(id, doc)
        } else {
            inner.insert_op(id, doc)
        };
        result.map_err(|e| e.context(&self.name, "upsert"))
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.check_writable()?;
        inner
            .delete_op(id)
            .map_err(|e| e.context(&self.name, "delete"))
    }

    pub fn delete_many(&self, ids: &[&str]) -> Result<usize> {
        let mut inner = self.inner.lock();
        inner.check_writable()?;
        let mut removed = 0;
        for &id in ids {
            if inner
                .delete_op(id)
                .map_err(|e| e.context(&self.name, "delete_many"))?
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Remove every entity. Outside a transaction the data pages themselves
    /// are returned to the free-list.
    pub fn delete_all(&self) -> Result<usize> {
        let mut inner = self.inner.lock();
        inner.check_writable()?;
        if inner.txn.is_some() {
            let ids = inner.visible_ids();
            let mut removed = 0;
            for id in ids {
                if inner
                    .delete_op(&id)
                    .map_err(|e| e.context(&self.name, "delete_all"))?
                {
                    removed += 1;
                }
            }
            return Ok(removed);
        }

        let removed = inner.catalog.entities.len();
        inner.catalog.entities.clear();
        let pages = std::mem::take(&mut inner.catalog.data_pages);
        for page_id in pages {
            inner
                .pool
                .free(page_id)
                .map_err(|e| e.context(&self.name, "delete_all"))?;
        }
        inner
            .flush_committed()
            .map_err(|e| e.context(&self.name, "delete_all"))?;
        Ok(removed)
    }

    /// Rewrite the catalog and push every dirty page and the file header to
    /// disk.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_writable()?;
        inner
            .flush_committed()
            .map_err(|e| e.context(&self.name, "flush"))
    }

    // --- Transactions ---

    pub fn begin(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_writable()?;
        if !inner.options.enable_transactions {
            return Err(FolioError::TransactionsDisabled.context(&self.name, "begin"));
        }
        if inner.txn.is_some() {
            return Err(FolioError::TransactionActive.context(&self.name, "begin"));
        }

        let txn_id = inner.next_txn_id;
        inner.next_txn_id += 1;
        let begin_lsn = inner
            .wal_mut()?
            .append(WalRecord::new(
                WalRecordType::Begin,
                txn_id,
                INVALID_LSN,
                Vec::new(),
            ))
            .map_err(|e| e.context(&self.name, "begin"))?;
        inner.txn = Some(TxnState::new(txn_id, begin_lsn));
        Ok(())
    }

    /// Commit the active transaction: log every buffered operation, make
    /// the commit record durable, then materialize.
    pub fn commit(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_writable()?;
        inner.commit_txn().map_err(|e| e.context(&self.name, "commit"))
    }

    /// Discard the active transaction. No on-disk effect beyond an abort
    /// record in the log.
    pub fn rollback(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_writable()?;
        inner
            .rollback_txn()
            .map_err(|e| e.context(&self.name, "rollback"))
    }

    /// Flush, close the WAL segment cleanly, and clear the dirty-shutdown
    /// flag. An active transaction is rolled back first.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.open {
            return Ok(());
        }
        if inner.options.read_only {
            inner.open = false;
            inner._lock = None;
            return Ok(());
        }
        if inner.txn.is_some() {
            inner
                .rollback_txn()
                .map_err(|e| e.context(&self.name, "close"))?;
        }
        inner
            .flush_committed()
            .map_err(|e| e.context(&self.name, "close"))?;

        if let Some(wal) = inner.wal.take() {
            wal.close().map_err(|e| e.context(&self.name, "close"))?;
        }
        inner
            .pool
            .pager()
            .set_dirty_shutdown(false)
            .map_err(|e| e.context(&self.name, "close"))?;
        inner
            .pool
            .pager()
            .flush()
            .map_err(|e| e.context(&self.name, "close"))?;
        inner.open = false;
        inner._lock = None;
        log::debug!("{}: closed", self.name);
        Ok(())
    }
}

impl StoreInner {
    fn check_open(&self) -> Result<()> {
        if !self.open {
            return Err(FolioError::NotOpen);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.options.read_only {
            return Err(FolioError::ReadOnly);
        }
        Ok(())
    }

    fn wal_mut(&mut self) -> Result<&mut WalWriter> {
        self.wal
            .as_mut()
            .ok_or_else(|| FolioError::Wal("write-ahead log is not open".into()))
    }

    // --- Visibility: txn-local state layered over the committed store ---

    fn is_visible(&self, id: &str) -> bool {
        if let Some(txn) = &self.txn {
            if txn.deleted.contains(id) {
                return false;
            }
            if txn.pending_inserts.contains_key(id) || txn.pending_updates.contains_key(id) {
                return true;
            }
        }
        self.catalog.entities.contains_key(id)
    }

    fn get_visible(&mut self, id: &str) -> Result<Option<Document>> {
        if let Some(txn) = &self.txn {
            if txn.deleted.contains(id) {
                return Ok(None);
            }
            if let Some(doc) = txn.pending_inserts.get(id) {
                return Ok(Some(doc.clone()));
            }
            if let Some(doc) = txn.pending_updates.get(id) {
                return Ok(Some(doc.clone()));
            }
        }
        self.read_committed(id)
    }

    fn visible_ids(&self) -> Vec<String> {
        let mut ids: BTreeSet<String> = self.catalog.entities.keys().cloned().collect();
        if let Some(txn) = &self.txn {
            for id in &txn.deleted {
                ids.remove(id);
            }
            for id in txn.pending_inserts.keys() {
                ids.insert(id.clone());
            }
        }
        ids.into_iter().collect()
    }

    fn read_committed(&mut self, id: &str) -> Result<Option<Document>> {
        let Some(&(page_id, slot)) = self.catalog.entities.get(id) else {
            return Ok(None);
        };
        let page = self.pool.fetch(page_id)?;
        let result = (|| {
            let bytes = page.record(slot).ok_or_else(|| {
                FolioError::Corrupted(format!(
                    "index entry {:?} points at dead slot {} on page {}",
                    id, slot, page_id
                ))
            })?;
            let (stored_id, doc) = self.codec.decode(bytes)?;
            if stored_id != id {
                return Err(FolioError::Corrupted(format!(
                    "index entry {:?} resolves to record {:?}",
                    id, stored_id
                )));
            }
            Ok(doc)
        })();
        self.pool.unpin(page_id);
        result.map(Some)
    }

    // --- Operations (transactional buffering or direct materialization) ---

    fn insert_op(&mut self, id: &str, doc: Document) -> Result<()> {
        if self.is_visible(id) {
            return Err(FolioError::AlreadyExists(id.to_string()));
        }
        // Size limits apply identically inside and outside transactions.
        self.codec.encode(id, &doc)?;

        if let Some(txn) = &mut self.txn {
            if txn.deleted.remove(id) {
                // Deleted then re-inserted in the same txn: net effect is an
                // update of the committed record.
                txn.pending_updates.insert(id.to_string(), doc);
            } else {
                txn.pending_inserts.insert(id.to_string(), doc);
            }
            return Ok(());
        }

        self.materialize_insert(id, &doc)
    }

    fn update_op(&mut self, id: &str, doc: Document) -> Result<()> {
        if !self.is_visible(id) {
            return Err(FolioError::NotFound(id.to_string()));
        }
        self.codec.encode(id, &doc)?;

        if self.txn.is_some() {
            if self
                .txn
                .as_ref()
                .is_some_and(|t| t.pending_inserts.contains_key(id))
            {
                let txn = self.txn.as_mut().unwrap();
                txn.pending_inserts.insert(id.to_string(), doc);
                return Ok(());
            }
            if self
                .txn
                .as_ref()
                .is_some_and(|t| t.pending_updates.contains_key(id))
            {
                let txn = self.txn.as_mut().unwrap();
                txn.pending_updates.insert(id.to_string(), doc);
                return Ok(());
            }
            // First touch of a committed entity: capture the before image.
            let before = self
                .read_committed(id)?
                .ok_or_else(|| FolioError::NotFound(id.to_string()))?;
            let txn = self.txn.as_mut().unwrap();
            txn.original.insert(id.to_string(), before);
            txn.pending_updates.insert(id.to_string(), doc);
            return Ok(());
        }

        // Free-standing update is delete-then-insert.
        self.materialize_delete(id)?;
        self.materialize_insert(id, &doc)
    }

    fn delete_op(&mut self, id: &str) -> Result<bool> {
        if !self.is_visible(id) {
            return Ok(false);
        }

        if self.txn.is_some() {
            let was_pending_insert = self
                .txn
                .as_ref()
                .is_some_and(|t| t.pending_inserts.contains_key(id));
            if was_pending_insert {
                self.txn.as_mut().unwrap().pending_inserts.remove(id);
                return Ok(true);
            }
            let had_update = self
                .txn
                .as_ref()
                .is_some_and(|t| t.pending_updates.contains_key(id));
            if had_update {
                let txn = self.txn.as_mut().unwrap();
                txn.pending_updates.remove(id);
                txn.deleted.insert(id.to_string());
                return Ok(true);
            }
            let before = self
                .read_committed(id)?
                .ok_or_else(|| FolioError::NotFound(id.to_string()))?;
            let txn = self.txn.as_mut().unwrap();
            txn.original.insert(id.to_string(), before);
            txn.deleted.insert(id.to_string());
            return Ok(true);
        }

        self.materialize_delete(id)?;
        Ok(true)
    }

    // --- Materialization: committed state on pages ---

    fn materialize_insert(&mut self, id: &str, doc: &Document) -> Result<()> {
        let bytes = self.codec.encode(id, doc)?;

        // First data page with room wins.
        for i in 0..self.catalog.data_pages.len() {
            let page_id = self.catalog.data_pages[i];
            let mut page = self.pool.fetch(page_id)?;
            if let Some(slot) = page.try_insert_record(&bytes) {
                self.pool.write(&page);
                self.pool.unpin(page_id);
                self.catalog.entities.insert(id.to_string(), (page_id, slot));
                return Ok(());
            }
            self.pool.unpin(page_id);
        }

        // No room anywhere: extend with a fresh data page.
        let mut page = self.pool.allocate(PageType::Data)?;
        let page_id = page.page_id();
        page.init_data_page();
        let Some(slot) = page.try_insert_record(&bytes) else {
            self.pool.unpin(page_id);
            self.pool.free(page_id)?;
            // Larger than an empty page can hold; the effective limit is the
            // page capacity.
            return Err(FolioError::EntityTooLarge {
                size: bytes.len(),
                limit: self.pool.pager_ref().page_size(),
            });
        };
        self.pool.write(&page);
        self.pool.unpin(page_id);
        self.catalog.data_pages.push(page_id);
        self.catalog.entities.insert(id.to_string(), (page_id, slot));
        Ok(())
    }

    fn materialize_delete(&mut self, id: &str) -> Result<bool> {
        let Some((page_id, slot)) = self.catalog.entities.remove(id) else {
            return Ok(false);
        };
        let mut page = self.pool.fetch(page_id)?;
        page.tombstone_slot(slot);
        self.pool.write(&page);
        self.pool.unpin(page_id);
        Ok(true)
    }

    fn materialize_update(&mut self, id: &str, doc: &Document) -> Result<()> {
        self.materialize_delete(id)?;
        self.materialize_insert(id, doc)
    }

    /// Rewrite the catalog page, write back dirty frames, fsync the file,
    /// and bump the modified timestamp.
    fn flush_committed(&mut self) -> Result<()> {
        let mut page = self.pool.fetch(self.catalog_page)?;
        let encode_result = self.catalog.encode_into(&mut page);
        if encode_result.is_ok() {
            self.pool.write(&page);
        }
        self.pool.unpin(self.catalog_page);
        encode_result?;

        self.pool.flush_all()?;
        self.pool.pager().touch_modified()?;
        self.pool.pager().flush()?;
        Ok(())
    }

    // --- Commit / rollback ---

    fn commit_txn(&mut self) -> Result<()> {
        let txn = self.txn.take().ok_or(FolioError::NoActiveTransaction)?;
        let collection = self.catalog.name.clone();

        // Step 1: log every buffered operation, chained by prev-lsn.
        let result = (|| -> Result<()> {
            let mut prev = txn.last_lsn;
            {
                let wal = self.wal_mut()?;
                for (id, doc) in &txn.pending_inserts {
                    let payload = DataOp::insert(&collection, id, doc.clone()).encode()?;
                    prev = wal.append(WalRecord::new(
                        WalRecordType::Insert,
                        txn.id,
                        prev,
                        payload,
                    ))?;
                }
                for (id, doc) in &txn.pending_updates {
                    let before = txn.original.get(id).cloned().unwrap_or_default();
                    let payload =
                        DataOp::update(&collection, id, before, doc.clone()).encode()?;
                    prev = wal.append(WalRecord::new(
                        WalRecordType::Update,
                        txn.id,
                        prev,
                        payload,
                    ))?;
                }
                for id in &txn.deleted {
                    let before = txn.original.get(id).cloned().unwrap_or_default();
                    let payload = DataOp::delete(&collection, id, before).encode()?;
                    prev = wal.append(WalRecord::new(
                        WalRecordType::Delete,
                        txn.id,
                        prev,
                        payload,
                    ))?;
                }

                // Steps 2-3: the commit record; its append flushes and fsyncs.
                wal.append(WalRecord::new(
                    WalRecordType::Commit,
                    txn.id,
                    prev,
                    Vec::new(),
                ))?;
            }

            // Step 4: the commit is durable; apply to pages. A failure past
            // this point is repaired by redo on the next open.
            for (id, doc) in &txn.pending_inserts {
                self.materialize_insert(id, doc)?;
            }
            for (id, doc) in &txn.pending_updates {
                self.materialize_update(id, doc)?;
            }
            for id in &txn.deleted {
                self.materialize_delete(id)?;
            }
            self.flush_committed()?;
            Ok(())
        })();
        result?;

        self.maybe_checkpoint()?;
        Ok(())
    }

    fn rollback_txn(&mut self) -> Result<()> {
        let txn = self.txn.take().ok_or(FolioError::NoActiveTransaction)?;
        self.wal_mut()?.append(WalRecord::new(
            WalRecordType::Abort,
            txn.id,
            txn.last_lsn,
            Vec::new(),
        ))?;
        Ok(())
    }

    /// After a commit: checkpoint when enough log has accumulated, and
    /// reset the segment when it outgrew its size budget. Everything the
    /// log describes is durable in the main file at this point.
    fn maybe_checkpoint(&mut self) -> Result<()> {
        let interval_bytes = self.options.wal.checkpoint_interval_bytes;
        let interval_secs = self.options.wal.checkpoint_interval_secs;
        let max_size = self.options.wal.max_file_size;

        let Some(wal) = self.wal.as_mut() else {
            return Ok(());
        };
        let due = wal.bytes_since_checkpoint() >= interval_bytes
            || wal.secs_since_checkpoint() >= interval_secs;
        if !due {
            return Ok(());
        }

        let data = CheckpointData {
            active_transactions: Vec::new(),
            dirty_pages: self.pool.dirty_page_ids(),
        };
        let wal = self.wal_mut()?;
        wal.checkpoint(&data)?;
        if wal.size() > max_size {
            wal.reset()?;
        }
        Ok(())
    }
}

/// The recovery back-edge: logical redo of committed operations. All three
/// handlers are idempotent against already-applied state.
impl RecoveryHandler for StoreInner {
    fn redo_insert(&mut self, collection: &str, id: &str, after: &Document) -> Result<()> {
        if collection != self.catalog.name {
            log::warn!(
                "redo for foreign collection {:?} ignored (this is {:?})",
                collection,
                self.catalog.name
            );
            return Ok(());
        }
        if self.catalog.entities.contains_key(id) {
            self.materialize_update(id, after)
        } else {
            self.materialize_insert(id, after)
        }
    }

    fn redo_update(&mut self, collection: &str, id: &str, after: &Document) -> Result<()> {
        self.redo_insert(collection, id, after)
    }

    fn redo_delete(&mut self, collection: &str, id: &str) -> Result<()> {
        if collection != self.catalog.name {
            return Ok(());
        }
        self.materialize_delete(id)?;
        Ok(())
    }
}
