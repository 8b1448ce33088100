// Integration Tests for drhdb
// These tests exercise the public API end to end

use drhdb::{Options, DB};
use std::time::Duration;
use tempfile::TempDir;

fn manual_options() -> Options {
    Options::default().partition_count(1024).auto_sync(false)
}

/// Test set, get and remove on the default table
#[test]
fn test_set_get_remove() {
    let dir = TempDir::new().unwrap();
    let db = DB::open(dir.path(), manual_options()).unwrap();

    db.set(b"name", b"john").unwrap();
    assert_eq!(db.get(b"name").unwrap(), Some(b"john".to_vec()));

    db.remove(b"name").unwrap();
    assert_eq!(db.get(b"name").unwrap(), None);

    db.sync().unwrap();
    assert_eq!(db.get(b"name").unwrap(), None);
}

/// Test that the same scenario holds once writes reach the table files
#[test]
fn test_set_get_remove_through_files() {
    let dir = TempDir::new().unwrap();
    let db = DB::open(dir.path(), manual_options()).unwrap();

    db.set(b"name", b"john").unwrap();
    db.sync().unwrap();
    assert_eq!(db.get(b"name").unwrap(), Some(b"john".to_vec()));

    db.remove(b"name").unwrap();
    db.sync().unwrap();
    assert_eq!(db.get(b"name").unwrap(), None);
}

/// Test overwriting values of different sizes
#[test]
fn test_overwrite_values() {
    let dir = TempDir::new().unwrap();
    let db = DB::open(dir.path(), manual_options()).unwrap();

    let sizes = [1usize, 30, 31, 32, 33, 500, 5, 4096, 2];
    for (round, size) in sizes.iter().enumerate() {
        let value = vec![round as u8 + 1; *size];
        db.set(b"key", &value).unwrap();
        db.sync().unwrap();
        assert_eq!(db.get(b"key").unwrap(), Some(value));
    }

    let table = db.table("default").unwrap();
    let report = table.verify().unwrap();
    assert_eq!(report.items, 1);
    let space = table.space();
    assert_eq!(report.data_bytes + space.data_free_bytes(), space.data_len);
}

/// Test that the pending byte count follows overwrites and drops to zero on sync
#[test]
fn test_pending_bytes() {
    let dir = TempDir::new().unwrap();
    let db = DB::open(dir.path(), manual_options()).unwrap();
    let table = db.table("default").unwrap();
    assert_eq!(table.pending_bytes(), 0);

    table.set(b"key", &[1u8; 100]).unwrap();
    assert_eq!(table.pending_bytes(), 103);
    table.set(b"key", b"short").unwrap();
    assert_eq!(table.pending_bytes(), 8);
    table.remove(b"key").unwrap();
    assert_eq!(table.pending_bytes(), 3);
    assert_eq!(table.pending(), 1);

    db.sync().unwrap();
    assert_eq!(table.pending_bytes(), 0);
    assert_eq!(table.pending(), 0);
}

/// Test that repeating a write with the same value leaves the files alone
#[test]
fn test_unchanged_set_is_noop() {
    let dir = TempDir::new().unwrap();
    let db = DB::open(dir.path(), manual_options()).unwrap();
    let table = db.table("default").unwrap();

    table.set(b"k", b"v").unwrap();
    db.sync().unwrap();
    let before = table.space();

    table.set(b"k", b"v").unwrap();
    db.sync().unwrap();
    assert_eq!(table.space(), before);
    assert_eq!(table.get(b"k").unwrap(), Some(b"v".to_vec()));
}

/// Test persistence across a clean close and reopen
#[test]
fn test_persistence_across_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let db = DB::open(dir.path(), manual_options()).unwrap();
        for i in 0..500 {
            db.set(format!("key_{}", i).as_bytes(), format!("value_{}", i).as_bytes()).unwrap();
        }
        db.set_to(b"alice", b"admin", "users").unwrap();
        db.close().unwrap();
    }

    let db = DB::open(dir.path(), manual_options()).unwrap();
    for i in 0..500 {
        assert_eq!(
            db.get(format!("key_{}", i).as_bytes()).unwrap(),
            Some(format!("value_{}", i).into_bytes())
        );
    }
    assert_eq!(db.get_from(b"alice", "users").unwrap(), Some(b"admin".to_vec()));
    assert_eq!(std::fs::metadata(dir.path().join("binlog")).unwrap().len(), 0);
}

/// Test items, keys and values with and without a limit
#[test]
fn test_items_keys_values() {
    let dir = TempDir::new().unwrap();
    let db = DB::open(dir.path(), manual_options()).unwrap();

    for i in 0..20 {
        db.set(format!("key_{:02}", i).as_bytes(), format!("value_{}", i).as_bytes()).unwrap();
    }
    db.sync().unwrap();
    // Pending writes are listed together with stored ones.
    db.set(b"pending", b"yes").unwrap();
    db.remove(b"key_00").unwrap();

    let items = db.items(None).unwrap();
    assert_eq!(items.len(), 20);
    assert!(!items.contains_key(&b"key_00".to_vec()));
    assert_eq!(items[&b"pending".to_vec()], b"yes".to_vec());
    assert_eq!(items[&b"key_05".to_vec()], b"value_5".to_vec());

    assert_eq!(db.items(Some(5)).unwrap().len(), 5);
    assert_eq!(db.keys(None).unwrap().len(), 20);
    assert!(db.values(None).unwrap().contains(&b"value_19".to_vec()));
    assert!(db.items(Some(0)).unwrap().is_empty());
}

/// Test that tables keep separate key spaces and files
#[test]
fn test_multiple_tables() {
    let dir = TempDir::new().unwrap();
    let db = DB::open(dir.path(), manual_options()).unwrap();

    let users = db.table("users").unwrap();
    let orders = db.table("orders").unwrap();
    users.set(b"id", b"user").unwrap();
    orders.set(b"id", b"order").unwrap();
    db.sync().unwrap();

    assert_eq!(users.get(b"id").unwrap(), Some(b"user".to_vec()));
    assert_eq!(orders.get(b"id").unwrap(), Some(b"order".to_vec()));
    assert_eq!(db.get(b"id").unwrap(), None);
    assert_eq!(users.name(), "users");

    for ext in ["ix", "mt", "db"] {
        assert!(dir.path().join(format!("users.{}", ext)).exists());
        assert!(dir.path().join(format!("orders.{}", ext)).exists());
    }
}

/// Test that the index file is pre-sized to one entry per partition
#[test]
fn test_index_file_presized() {
    let dir = TempDir::new().unwrap();
    let db = DB::open(dir.path(), manual_options()).unwrap();
    db.table("t").unwrap();

    let len = std::fs::metadata(dir.path().join("t.ix")).unwrap().len();
    assert_eq!(len, 1024 * 7);
}

/// Test value cache statistics on repeated reads
#[test]
fn test_value_cache_hits() {
    let dir = TempDir::new().unwrap();
    let db = DB::open(dir.path(), manual_options()).unwrap();
    let table = db.table("cached").unwrap();

    table.set(b"k", b"v").unwrap();
    db.sync().unwrap();
    for _ in 0..5 {
        assert_eq!(table.get(b"k").unwrap(), Some(b"v".to_vec()));
    }
    let stats = table.cache_stats().unwrap();
    assert_eq!(stats.hits, 4);
    assert_eq!(stats.misses, 1);

    // Writes invalidate the cached value.
    table.set(b"k", b"v2").unwrap();
    db.sync().unwrap();
    assert_eq!(table.get(b"k").unwrap(), Some(b"v2".to_vec()));
}

/// Test that the cache can be disabled
#[test]
fn test_value_cache_disabled() {
    let dir = TempDir::new().unwrap();
    let db = DB::open(dir.path(), manual_options().value_cache_ttl(None)).unwrap();
    let table = db.table("t").unwrap();
    table.set(b"k", b"v").unwrap();
    db.sync().unwrap();
    assert_eq!(table.get(b"k").unwrap(), Some(b"v".to_vec()));
    assert!(table.cache_stats().is_none());
}

/// Test the background tasks with default scheduling
#[test]
fn test_background_tasks() {
    let dir = TempDir::new().unwrap();
    let options = Options::default()
        .partition_count(1024)
        .flush_interval(Duration::from_millis(5))
        .compaction_interval(Duration::from_millis(5))
        .compaction_min_size(1);
    let db = DB::open(dir.path(), options).unwrap();
    let table = db.table("default").unwrap();

    for i in 0..200 {
        db.set(format!("key_{}", i).as_bytes(), &vec![b'x'; i]).unwrap();
    }
    for i in 0..200 {
        if i % 2 == 0 {
            db.remove(format!("key_{}", i).as_bytes()).unwrap();
        }
    }

    let mut waited = 0;
    while (table.pending() > 0 || !table.space().data_free.is_empty()) && waited < 1000 {
        std::thread::sleep(Duration::from_millis(10));
        waited += 1;
    }
    assert_eq!(table.pending(), 0);
    assert!(table.space().data_free.is_empty());

    for i in 0..200 {
        let expected = if i % 2 == 0 { None } else { Some(vec![b'x'; i]) };
        assert_eq!(db.get(format!("key_{}", i).as_bytes()).unwrap(), expected);
    }
    table.verify().unwrap();
    db.close().unwrap();
}
