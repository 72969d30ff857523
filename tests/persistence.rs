//! Flush/reopen durability and page-size boundaries.

use chrono::{TimeZone, Utc};
use foliodb::storage::pager::Pager;
use foliodb::{Document, PagedStorage, StorageOptions, Value};
use tempfile::TempDir;

fn sample_doc(i: i64) -> Document {
    let mut d = Document::new();
    d.insert("n".into(), Value::Int(i));
    d.insert("name".into(), Value::String(format!("entity {}", i)));
    d.insert("flag".into(), Value::Bool(i % 2 == 0));
    d.insert(
        "created".into(),
        Value::DateTime(Utc.timestamp_opt(1_700_000_000 + i, 0).single().unwrap()),
    );
    d.insert(
        "tags".into(),
        Value::Array(vec![Value::String("a".into()), Value::Int(i)]),
    );
    d
}

#[test]
fn test_simple_persistence() {
    // Open empty, insert one entity, close, reopen: same content.
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");

    {
        let store =
            PagedStorage::open(&path, "things", StorageOptions::default()).unwrap();
        let mut d = Document::new();
        d.insert("a".into(), Value::Int(1));
        store.insert("x", d).unwrap();
        store.close().unwrap();
    }

    {
        let store =
            PagedStorage::open(&path, "things", StorageOptions::default()).unwrap();
        let mut expected = Document::new();
        expected.insert("a".into(), Value::Int(1));
        assert_eq!(store.get("x").unwrap(), Some(expected));
        assert_eq!(store.count().unwrap(), 1);
        store.close().unwrap();
    }
}

#[test]
fn test_reopen_returns_same_entity_set() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");

    let expected: Vec<(String, Document)> = (0..50)
        .map(|i| (format!("id-{:02}", i), sample_doc(i)))
        .collect();

    {
        let store =
            PagedStorage::open(&path, "things", StorageOptions::default()).unwrap();
        for (id, doc) in &expected {
            store.insert(id, doc.clone()).unwrap();
        }
        store.flush().unwrap();
        store.close().unwrap();
    }

    {
        let store =
            PagedStorage::open(&path, "things", StorageOptions::default()).unwrap();
        let all = store.get_all().unwrap();
        assert_eq!(all.len(), expected.len());
        for (id, doc) in &expected {
            assert_eq!(&all[id], doc);
        }
        store.close().unwrap();
    }
}

#[test]
fn test_collection_name_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    {
        let store =
            PagedStorage::open(&path, "inventory", StorageOptions::default()).unwrap();
        assert_eq!(store.name(), "inventory");
        store.close().unwrap();
    }
    // The stored name wins over whatever the caller passes on reopen.
    let store = PagedStorage::open(&path, "other", StorageOptions::default()).unwrap();
    assert_eq!(store.name(), "inventory");
    store.close().unwrap();
}

#[test]
fn test_min_and_max_page_sizes() {
    for page_size in [4096u32, 32768] {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        {
            let store = PagedStorage::open(
                &path,
                "things",
                StorageOptions::default().page_size(page_size),
            )
            .unwrap();
            for i in 0..20 {
                store.insert(&format!("id-{}", i), sample_doc(i)).unwrap();
            }
            store.close().unwrap();
        }

        let pager = Pager::open(&path, 4096, true, true).unwrap();
        assert_eq!(pager.page_size() as u32, page_size);
        drop(pager);

        let store = PagedStorage::open(&path, "things", StorageOptions::default()).unwrap();
        assert_eq!(store.count().unwrap(), 20);
        assert_eq!(store.get("id-7").unwrap(), Some(sample_doc(7)));
        store.close().unwrap();
    }
}

#[test]
fn test_invalid_page_size_rejected() {
    let dir = TempDir::new().unwrap();
    let result = PagedStorage::open(
        &dir.path().join("test.db"),
        "things",
        StorageOptions::default().page_size(1234),
    );
    assert!(matches!(
        result.unwrap_err().root_cause(),
        foliodb::FolioError::InvalidPageSize(1234)
    ));
}

#[test]
fn test_clean_close_clears_dirty_flag() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    {
        let store =
            PagedStorage::open(&path, "things", StorageOptions::default()).unwrap();
        store.insert("x", sample_doc(1)).unwrap();
        store.close().unwrap();
    }
    let pager = Pager::open(&path, 4096, true, true).unwrap();
    assert!(!pager.header().is_dirty_shutdown());
}

#[test]
fn test_drop_without_close_leaves_dirty_flag() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    {
        let store =
            PagedStorage::open(&path, "things", StorageOptions::default()).unwrap();
        store.insert("x", sample_doc(1)).unwrap();
        store.flush().unwrap();
        // Dropped without close: simulated crash.
    }
    let pager = Pager::open(&path, 4096, true, true).unwrap();
    assert!(pager.header().is_dirty_shutdown());
}

#[test]
fn test_checksum_verification_can_be_disabled() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    {
        let store =
            PagedStorage::open(&path, "things", StorageOptions::default()).unwrap();
        store.insert("x", sample_doc(1)).unwrap();
        store.close().unwrap();
    }

    let store = PagedStorage::open(
        &path,
        "things",
        StorageOptions::default().verify_checksums(false),
    )
    .unwrap();
    assert_eq!(store.get("x").unwrap(), Some(sample_doc(1)));
    store.close().unwrap();
}

#[test]
fn test_read_only_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    {
        let store =
            PagedStorage::open(&path, "things", StorageOptions::default()).unwrap();
        store.insert("x", sample_doc(1)).unwrap();
        store.close().unwrap();
    }

    let store = PagedStorage::open(
        &path,
        "things",
        StorageOptions::default().read_only(true),
    )
    .unwrap();
    assert_eq!(store.get("x").unwrap(), Some(sample_doc(1)));
    let err = store.insert("y", sample_doc(2)).unwrap_err();
    assert!(matches!(
        err.root_cause(),
        foliodb::FolioError::ReadOnly
    ));
    store.close().unwrap();
}
