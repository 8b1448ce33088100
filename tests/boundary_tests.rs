// Boundary Tests for drhdb
// These tests check the size limits of keys, values and table names

use drhdb::codec::{MAX_KEY_SIZE, MAX_TABLE_NAME_SIZE, MAX_VALUE_SIZE};
use drhdb::{Error, Options, DB};
use tempfile::TempDir;

fn manual_options() -> Options {
    Options::default().partition_count(128).auto_sync(false)
}

/// Test the smallest and largest accepted keys
#[test]
fn test_key_sizes() {
    let dir = TempDir::new().unwrap();
    let db = DB::open(dir.path(), manual_options()).unwrap();

    let shortest = vec![b'a'];
    let longest = vec![b'z'; MAX_KEY_SIZE];
    db.set(&shortest, b"short").unwrap();
    db.set(&longest, b"long").unwrap();
    db.sync().unwrap();

    assert_eq!(db.get(&shortest).unwrap(), Some(b"short".to_vec()));
    assert_eq!(db.get(&longest).unwrap(), Some(b"long".to_vec()));

    let too_long = vec![b'z'; MAX_KEY_SIZE + 1];
    assert!(matches!(db.set(&too_long, b"v"), Err(Error::InvalidArgument(_))));
    assert!(matches!(db.get(&too_long), Err(Error::InvalidArgument(_))));
    assert!(matches!(db.set(b"", b"v"), Err(Error::InvalidArgument(_))));
    assert!(matches!(db.get(b""), Err(Error::InvalidArgument(_))));
    assert!(matches!(db.remove(b""), Err(Error::InvalidArgument(_))));
}

/// Test the empty and the largest accepted value
#[test]
fn test_value_sizes() {
    let dir = TempDir::new().unwrap();
    let db = DB::open(dir.path(), manual_options()).unwrap();

    db.set(b"k", b"v").unwrap();
    db.set(b"k", b"").unwrap();
    assert_eq!(db.get(b"k").unwrap(), None);

    let largest = vec![0xA5u8; MAX_VALUE_SIZE];
    db.set(b"big", &largest).unwrap();
    db.sync().unwrap();
    assert_eq!(db.get(b"big").unwrap(), Some(largest));

    let too_large = vec![0u8; MAX_VALUE_SIZE + 1];
    assert!(matches!(db.set(b"big", &too_large), Err(Error::InvalidArgument(_))));
    assert_eq!(db.get(b"big").unwrap().map(|v| v.len()), Some(MAX_VALUE_SIZE));
}

/// Test table name limits
#[test]
fn test_table_names() {
    let dir = TempDir::new().unwrap();
    let db = DB::open(dir.path(), manual_options()).unwrap();

    let long_name = "t".repeat(200);
    db.set_to(b"k", b"v", &long_name).unwrap();
    assert_eq!(db.get_from(b"k", &long_name).unwrap(), Some(b"v".to_vec()));

    let too_long = "t".repeat(MAX_TABLE_NAME_SIZE + 1);
    for name in ["", ".", "..", "a/b", "a\\b", "a\0b", too_long.as_str()] {
        assert!(
            matches!(db.table(name), Err(Error::InvalidArgument(_))),
            "table name {:?} must be rejected",
            name
        );
        assert!(matches!(db.set_to(b"k", b"v", name), Err(Error::InvalidArgument(_))));
    }
    assert!(!dir.path().join("a").exists());
}

/// Test keys made of arbitrary bytes
#[test]
fn test_binary_keys_and_values() {
    let dir = TempDir::new().unwrap();
    let db = DB::open(dir.path(), manual_options()).unwrap();

    let keys: Vec<Vec<u8>> = vec![vec![0], vec![0, 0], vec![0xFF; 3], vec![0, 1, 2, 3, 255], b"\n\r\t".to_vec()];
    for (i, key) in keys.iter().enumerate() {
        db.set(key, &[i as u8, 0, 0xFF]).unwrap();
    }
    db.sync().unwrap();

    for (i, key) in keys.iter().enumerate() {
        assert_eq!(db.get(key).unwrap(), Some(vec![i as u8, 0, 0xFF]));
    }
    assert_eq!(db.keys(None).unwrap().len(), keys.len());
}

/// Test that a missing key reads as absent in a fresh and in a filled table
#[test]
fn test_missing_keys() {
    let dir = TempDir::new().unwrap();
    let db = DB::open(dir.path(), manual_options()).unwrap();

    assert_eq!(db.get(b"nothing").unwrap(), None);
    db.remove(b"nothing").unwrap();
    db.sync().unwrap();
    assert_eq!(db.get(b"nothing").unwrap(), None);

    for i in 0..100 {
        db.set(format!("k{}", i).as_bytes(), b"v").unwrap();
    }
    db.sync().unwrap();
    assert_eq!(db.get(b"nothing").unwrap(), None);
    assert_eq!(db.items(None).unwrap().len(), 100);
}
