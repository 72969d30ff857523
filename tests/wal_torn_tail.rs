//! WAL tail corruption: recovery honors every intact committed transaction
//! and silently drops the damaged suffix.

use std::io::Write;

use foliodb::storage::pager::Pager;
use foliodb::wal::record::{DataOp, WalRecord, WalRecordType};
use foliodb::wal::writer::WalWriter;
use foliodb::wal::INVALID_LSN;
use foliodb::{
    Document, PagedStorage, RecoveryOptions, StorageOptions, Value, WalOptions,
};
use tempfile::TempDir;

fn doc(v: i64) -> Document {
    let mut d = Document::new();
    d.insert("v".into(), Value::Int(v));
    d
}

fn append_bytes(path: &std::path::Path, bytes: &[u8]) {
    let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(bytes).unwrap();
    file.sync_all().unwrap();
}

/// Create a closed, empty database and return its id.
fn setup_db(path: &std::path::Path) -> uuid::Uuid {
    let store = PagedStorage::open(path, "things", StorageOptions::default()).unwrap();
    store.close().unwrap();
    let id = Pager::open(path, 4096, true, true)
        .unwrap()
        .header()
        .database_id;
    let mut pager = Pager::open(path, 4096, false, true).unwrap();
    pager.set_dirty_shutdown(true).unwrap();
    pager.flush().unwrap();
    id
}

/// Write `count` committed single-insert transactions to a fresh segment.
fn write_committed_txns(wal: &std::path::Path, database_id: uuid::Uuid, count: i64) {
    let mut writer =
        WalWriter::create(wal, database_id, 1, &WalOptions::default()).unwrap();
    for txn in 1..=count {
        let mut prev = writer
            .append(WalRecord::new(WalRecordType::Begin, txn, INVALID_LSN, Vec::new()))
            .unwrap();
        prev = writer
            .append(WalRecord::new(
                WalRecordType::Insert,
                txn,
                prev,
                DataOp::insert("things", &format!("id-{}", txn), doc(txn))
                    .encode()
                    .unwrap(),
            ))
            .unwrap();
        writer
            .append(WalRecord::new(WalRecordType::Commit, txn, prev, Vec::new()))
            .unwrap();
    }
    // Dropped without close: the segment stays unclean, as after a crash.
}

#[test]
fn test_zeroed_suffix_drops_only_the_torn_transaction() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    let wal = dir.path().join("test.wal");

    let database_id = setup_db(&path);
    write_committed_txns(&wal, database_id, 10);

    // Destroy the last 20 bytes: the final commit record is torn.
    let mut bytes = std::fs::read(&wal).unwrap();
    let len = bytes.len();
    bytes[len - 20..].fill(0);
    std::fs::write(&wal, &bytes).unwrap();

    let store = PagedStorage::open(
        &path,
        "things",
        StorageOptions {
            recovery: RecoveryOptions {
                throw_on_error: false,
                ..RecoveryOptions::default()
            },
            ..StorageOptions::default()
        },
    )
    .unwrap();

    // Transactions 1..=9 are intact and replayed; txn 10 lost its commit
    // record and is treated as uncommitted.
    assert_eq!(store.count().unwrap(), 9);
    for txn in 1..=9 {
        assert_eq!(
            store.get(&format!("id-{}", txn)).unwrap(),
            Some(doc(txn)),
            "txn {} should have been replayed",
            txn
        );
    }
    assert_eq!(store.get("id-10").unwrap(), None);
    store.close().unwrap();
}

#[test]
fn test_garbage_appended_after_valid_records() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    let wal = dir.path().join("test.wal");

    let database_id = setup_db(&path);
    write_committed_txns(&wal, database_id, 3);

    let garbage: Vec<u8> = (0..37).map(|i| (i * 7 + 13) as u8).collect();
    append_bytes(&wal, &garbage);

    let store = PagedStorage::open(&path, "things", StorageOptions::default()).unwrap();
    assert_eq!(store.count().unwrap(), 3);
    store.close().unwrap();
}

#[test]
fn test_partial_record_header_at_tail() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    let wal = dir.path().join("test.wal");

    let database_id = setup_db(&path);
    write_committed_txns(&wal, database_id, 2);

    // A record header that claims a large payload which never arrives.
    append_bytes(&wal, &[WalRecordType::Insert.as_u8(), 0, 0, 0]);

    let store = PagedStorage::open(&path, "things", StorageOptions::default()).unwrap();
    assert_eq!(store.count().unwrap(), 2);
    store.close().unwrap();
}

#[test]
fn test_zero_filled_preallocated_tail() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    let wal = dir.path().join("test.wal");

    let database_id = setup_db(&path);
    write_committed_txns(&wal, database_id, 2);

    append_bytes(&wal, &[0u8; 512]);

    let store = PagedStorage::open(&path, "things", StorageOptions::default()).unwrap();
    assert_eq!(store.count().unwrap(), 2);
    assert_eq!(store.get("id-1").unwrap(), Some(doc(1)));
    assert_eq!(store.get("id-2").unwrap(), Some(doc(2)));
    store.close().unwrap();
}

#[test]
fn test_uncommitted_suffix_discarded() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    let wal = dir.path().join("test.wal");

    let database_id = setup_db(&path);
    {
        let mut writer =
            WalWriter::create(&wal, database_id, 1, &WalOptions::default()).unwrap();
        // Committed transaction.
        let mut prev = writer
            .append(WalRecord::new(WalRecordType::Begin, 1, INVALID_LSN, Vec::new()))
            .unwrap();
        prev = writer
            .append(WalRecord::new(
                WalRecordType::Insert,
                1,
                prev,
                DataOp::insert("things", "kept", doc(1)).encode().unwrap(),
            ))
            .unwrap();
        writer
            .append(WalRecord::new(WalRecordType::Commit, 1, prev, Vec::new()))
            .unwrap();

        // Crash mid-transaction: begin + insert, no commit.
        let prev = writer
            .append(WalRecord::new(WalRecordType::Begin, 2, INVALID_LSN, Vec::new()))
            .unwrap();
        writer
            .append(WalRecord::new(
                WalRecordType::Insert,
                2,
                prev,
                DataOp::insert("things", "ghost", doc(2)).encode().unwrap(),
            ))
            .unwrap();
        writer.sync().unwrap();
    }
    append_bytes(&wal, &[0xFF; 20]);

    let store = PagedStorage::open(&path, "things", StorageOptions::default()).unwrap();
    assert_eq!(store.get("kept").unwrap(), Some(doc(1)));
    assert_eq!(store.get("ghost").unwrap(), None);
    assert_eq!(store.count().unwrap(), 1);
    store.close().unwrap();
}
