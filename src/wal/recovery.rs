//! Crash recovery over a WAL segment.
//!
//! Three passes:
//!   1. analysis — classify every transaction as committed, aborted, or
//!      uncommitted, and collect each transaction's prev-lsn chain;
//!   2. redo — replay committed data operations in LSN order through the
//!      storage's [`RecoveryHandler`];
//!   3. undo — optional: walk uncommitted chains in reverse and apply the
//!      inverse operation from the before image.
//!
//! A corrupt suffix truncates the scan; records before the cut are honored.
//! A transaction whose commit record fell past the cut is uncommitted.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use uuid::Uuid;

use crate::config::RecoveryOptions;
use crate::error::{FolioError, Result};
use crate::value::Document;
use crate::wal::reader::{ScanEnd, WalReader};
use crate::wal::record::{DataOp, WalRecord, WalRecordType};
use crate::wal::{Lsn, TxnId};

/// Replay callbacks the storage provides to the WAL reader. Redo must be
/// idempotent: re-inserting an existing id overwrites, deleting an absent
/// id is a no-op.
pub trait RecoveryHandler {
    fn redo_insert(&mut self, collection: &str, id: &str, after: &Document) -> Result<()>;
    fn redo_update(&mut self, collection: &str, id: &str, after: &Document) -> Result<()>;
    fn redo_delete(&mut self, collection: &str, id: &str) -> Result<()>;
}

/// Optional inverse callbacks for rolling back uncommitted work.
pub trait UndoHandler {
    fn undo_insert(&mut self, collection: &str, id: &str) -> Result<()>;
    fn undo_update(&mut self, collection: &str, id: &str, before: &Document) -> Result<()>;
    fn undo_delete(&mut self, collection: &str, id: &str, before: &Document) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub committed: Vec<TxnId>,
    pub aborted: Vec<TxnId>,
    pub uncommitted: Vec<TxnId>,
    pub records_scanned: usize,
    pub operations_redone: usize,
    pub operations_undone: usize,
    /// Offset where a corrupt suffix was truncated, if any.
    pub truncated_at: Option<Lsn>,
}

/// Analysis-pass output, also consumed by the WAL inspector.
#[derive(Debug, Default)]
pub struct WalAnalysis {
    pub committed: BTreeSet<TxnId>,
    pub aborted: BTreeSet<TxnId>,
    pub uncommitted: BTreeSet<TxnId>,
    pub records: Vec<WalRecord>,
    pub truncated_at: Option<Lsn>,
}

/// Pass 1: scan and classify. Shared between recovery and inspection.
pub fn analyze(reader: &mut WalReader) -> Result<WalAnalysis> {
    let mut analysis = WalAnalysis::default();
    let mut seen: BTreeSet<TxnId> = BTreeSet::new();

    while let Some(record) = reader.next()? {
        match record.record_type {
            WalRecordType::Begin => {
                seen.insert(record.txn_id);
            }
            WalRecordType::Commit => {
                seen.insert(record.txn_id);
                analysis.committed.insert(record.txn_id);
            }
            WalRecordType::Abort => {
                seen.insert(record.txn_id);
                analysis.aborted.insert(record.txn_id);
            }
            t if t.is_data_operation() => {
                seen.insert(record.txn_id);
            }
            _ => {}
        }
        analysis.records.push(record);
    }

    analysis.uncommitted = seen
        .into_iter()
        .filter(|t| !analysis.committed.contains(t) && !analysis.aborted.contains(t))
        .collect();
    analysis.truncated_at = reader.truncated_at();

    if analysis.end_is_corrupt() {
        log::warn!(
            "wal scan truncated at offset {}; earlier records honored",
            analysis.truncated_at.unwrap_or_default()
        );
    }
    Ok(analysis)
}

impl WalAnalysis {
    fn end_is_corrupt(&self) -> bool {
        self.truncated_at.is_some()
    }

    /// Per-transaction data operations, in LSN order, for uncommitted
    /// transactions. Chains are validated against prev-lsn linkage.
    fn uncommitted_chains(&self) -> BTreeMap<TxnId, Vec<&WalRecord>> {
        let mut chains: BTreeMap<TxnId, Vec<&WalRecord>> = BTreeMap::new();
        for record in &self.records {
            if record.record_type.is_data_operation()
                && self.uncommitted.contains(&record.txn_id)
            {
                chains.entry(record.txn_id).or_default().push(record);
            }
        }
        for (txn, chain) in &chains {
            for pair in chain.windows(2) {
                if pair[1].prev_lsn != pair[0].lsn {
                    log::warn!(
                        "transaction {} has a broken prev-lsn chain at lsn {}",
                        txn,
                        pair[1].lsn
                    );
                }
            }
        }
        chains
    }
}

pub struct Recovery {
    options: RecoveryOptions,
    expected_database_id: Option<Uuid>,
}

impl Recovery {
    pub fn new(options: &RecoveryOptions) -> Self {
        Recovery {
            options: options.clone(),
            expected_database_id: None,
        }
    }

    /// Require the segment to belong to the given database.
    pub fn expect_database_id(mut self, id: Uuid) -> Self {
        self.expected_database_id = Some(id);
        self
    }

    /// Run analysis, redo, and (when an undo handler is supplied) undo.
    pub fn run(
        &self,
        wal_path: &Path,
        handler: &mut dyn RecoveryHandler,
        mut undo: Option<&mut dyn UndoHandler>,
    ) -> Result<RecoveryReport> {
        let mut reader = match WalReader::open(wal_path) {
            Ok(reader) => reader,
            Err(e) => return self.fail_or_empty("open", e),
        };

        if let Some(expected) = self.expected_database_id {
            let found = reader.header().database_id;
            if found != expected {
                return self.fail_or_empty(
                    "open",
                    FolioError::Wal(format!(
                        "segment belongs to database {}, expected {}",
                        found, expected
                    )),
                );
            }
        }

        let analysis = match analyze(&mut reader) {
            Ok(a) => a,
            Err(e) => return self.fail_or_empty("analysis", e),
        };
        if reader.end_state() == ScanEnd::None {
            // next() always moves the scan to a terminal state.
            return self.fail_or_empty(
                "analysis",
                FolioError::Wal("scan ended in a non-terminal state".into()),
            );
        }

        log::info!(
            "recovery: {} records, {} committed / {} aborted / {} uncommitted transactions",
            analysis.records.len(),
            analysis.committed.len(),
            analysis.aborted.len(),
            analysis.uncommitted.len()
        );

        let mut report = RecoveryReport {
            committed: analysis.committed.iter().copied().collect(),
            aborted: analysis.aborted.iter().copied().collect(),
            uncommitted: analysis.uncommitted.iter().copied().collect(),
            records_scanned: analysis.records.len(),
            truncated_at: analysis.truncated_at,
            ..RecoveryReport::default()
        };

        // Pass 2: redo committed operations in LSN order.
        for record in &analysis.records {
            if !record.record_type.is_data_operation()
                || !analysis.committed.contains(&record.txn_id)
            {
                continue;
            }
            let op = match DataOp::decode(&record.payload) {
                Ok(op) => op,
                Err(e) => return self.fail_or_empty("redo", e),
            };
            let result = match record.record_type {
                WalRecordType::Insert => match &op.after {
                    Some(after) => handler.redo_insert(&op.collection, &op.entity_id, after),
                    None => Err(FolioError::Wal(format!(
                        "insert record at lsn {} has no after image",
                        record.lsn
                    ))),
                },
                WalRecordType::Update => match &op.after {
                    Some(after) => handler.redo_update(&op.collection, &op.entity_id, after),
                    None => Err(FolioError::Wal(format!(
                        "update record at lsn {} has no after image",
                        record.lsn
                    ))),
                },
                WalRecordType::Delete => handler.redo_delete(&op.collection, &op.entity_id),
                _ => unreachable!(),
            };
            if let Err(e) = result {
                return self.fail_or_empty("redo", e);
            }
            report.operations_redone += 1;
        }

        // Pass 3: undo uncommitted chains in reverse LSN order.
        if let Some(undo) = undo.as_deref_mut() {
            for (_, chain) in analysis.uncommitted_chains() {
                for record in chain.into_iter().rev() {
                    let op = match DataOp::decode(&record.payload) {
                        Ok(op) => op,
                        Err(e) => return self.fail_or_empty("undo", e),
                    };
                    let result = match record.record_type {
                        WalRecordType::Insert => undo.undo_insert(&op.collection, &op.entity_id),
                        WalRecordType::Update => match &op.before {
                            Some(before) => {
                                undo.undo_update(&op.collection, &op.entity_id, before)
                            }
                            None => Err(FolioError::Wal(format!(
                                "update record at lsn {} has no before image",
                                record.lsn
                            ))),
                        },
                        WalRecordType::Delete => match &op.before {
                            Some(before) => {
                                undo.undo_delete(&op.collection, &op.entity_id, before)
                            }
                            None => Err(FolioError::Wal(format!(
                                "delete record at lsn {} has no before image",
                                record.lsn
                            ))),
                        },
                        _ => unreachable!(),
                    };
                    if let Err(e) = result {
                        return self.fail_or_empty("undo", e);
                    }
                    report.operations_undone += 1;
                }
            }
        }

        log::info!(
            "recovery finished: {} redone, {} undone",
            report.operations_redone,
            report.operations_undone
        );
        Ok(report)
    }

    fn fail_or_empty(&self, phase: &str, err: FolioError) -> Result<RecoveryReport> {
        if self.options.throw_on_error {
            Err(FolioError::RecoveryFailed(format!("{}: {}", phase, err)))
        } else {
            log::warn!("recovery {} error ignored: {}", phase, err);
            Ok(RecoveryReport::default())
        }
    }
}
