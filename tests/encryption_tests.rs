//! Encrypted record round trips and key mismatch behavior.

use foliodb::{
    Document, EncryptionKey, FolioError, PagedStorage, StorageOptions, Value,
};
use tempfile::TempDir;

fn secret_doc() -> Document {
    let mut d = Document::new();
    d.insert("secret".into(), Value::String("s".into()));
    d
}

fn key_a() -> EncryptionKey {
    EncryptionKey::new([0x11; 16])
}

fn key_b() -> EncryptionKey {
    EncryptionKey::new([0x22; 16])
}

#[test]
fn test_encrypted_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vault.db");

    {
        let store = PagedStorage::open(
            &path,
            "vault",
            StorageOptions::default().encryption_key(key_a()),
        )
        .unwrap();
        store.insert("x", secret_doc()).unwrap();
        store.close().unwrap();
    }

    let store = PagedStorage::open(
        &path,
        "vault",
        StorageOptions::default().encryption_key(key_a()),
    )
    .unwrap();
    assert_eq!(store.get("x").unwrap(), Some(secret_doc()));
    store.close().unwrap();
}

#[test]
fn test_wrong_key_fails_authentication() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vault.db");

    {
        let store = PagedStorage::open(
            &path,
            "vault",
            StorageOptions::default().encryption_key(key_a()),
        )
        .unwrap();
        store.insert("x", secret_doc()).unwrap();
        store.close().unwrap();
    }

    let store = PagedStorage::open(
        &path,
        "vault",
        StorageOptions::default().encryption_key(key_b()),
    )
    .unwrap();
    let err = store.get("x").unwrap_err();
    assert!(matches!(
        err.root_cause(),
        FolioError::AuthenticationFailed
    ));
    store.close().unwrap();
}

#[test]
fn test_missing_key_rejected_at_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vault.db");

    {
        let store = PagedStorage::open(
            &path,
            "vault",
            StorageOptions::default().encryption_key(key_a()),
        )
        .unwrap();
        store.insert("x", secret_doc()).unwrap();
        store.close().unwrap();
    }

    let err =
        PagedStorage::open(&path, "vault", StorageOptions::default()).unwrap_err();
    assert!(matches!(
        err.root_cause(),
        FolioError::AuthenticationFailed
    ));
}

#[test]
fn test_key_supplied_for_plaintext_file_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("plain.db");

    {
        let store =
            PagedStorage::open(&path, "plain", StorageOptions::default()).unwrap();
        store.insert("x", secret_doc()).unwrap();
        store.close().unwrap();
    }

    let err = PagedStorage::open(
        &path,
        "plain",
        StorageOptions::default().encryption_key(key_a()),
    )
    .unwrap_err();
    assert!(matches!(
        err.root_cause(),
        FolioError::AuthenticationFailed
    ));
}

#[test]
fn test_ciphertext_not_in_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vault.db");

    {
        let store = PagedStorage::open(
            &path,
            "vault",
            StorageOptions::default().encryption_key(key_a()),
        )
        .unwrap();
        let mut d = Document::new();
        d.insert(
            "secret".into(),
            Value::String("very-recognizable-plaintext-marker".into()),
        );
        store.insert("x", d).unwrap();
        store.close().unwrap();
    }

    let bytes = std::fs::read(&path).unwrap();
    let needle = b"very-recognizable-plaintext-marker";
    let found = bytes.windows(needle.len()).any(|w| w == needle);
    assert!(!found, "plaintext leaked into the encrypted file");
}

#[test]
fn test_encrypted_transactions() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vault.db");

    {
        let store = PagedStorage::open(
            &path,
            "vault",
            StorageOptions::default().encryption_key(key_a()),
        )
        .unwrap();
        store.begin().unwrap();
        store.insert("a", secret_doc()).unwrap();
        store.insert("b", secret_doc()).unwrap();
        store.commit().unwrap();
        store.close().unwrap();
    }

    let store = PagedStorage::open(
        &path,
        "vault",
        StorageOptions::default().encryption_key(key_a()),
    )
    .unwrap();
    assert_eq!(store.count().unwrap(), 2);
    assert_eq!(store.get("a").unwrap(), Some(secret_doc()));
    store.close().unwrap();
}
