// Crash Recovery Tests for drhdb
// These tests drop the database without closing it and check what the binlog restores

use drhdb::{Options, DB};
use std::fs::OpenOptions;
use tempfile::TempDir;

/// Size of one frame holding a `key_N` / `value_N` write to the default table.
const SMALL_FRAME_SIZE: u64 = 45;

fn manual_options() -> Options {
    Options::default().partition_count(256).auto_sync(false)
}

/// Simulates a crash: no flush, no close, no snapshot.
fn simulate_crash(db: DB) {
    std::mem::forget(db);
}

fn write_numbered(db: &DB, range: std::ops::Range<usize>) {
    for i in range {
        db.set(format!("key_{}", i).as_bytes(), format!("value_{}", i).as_bytes()).unwrap();
    }
}

/// Test that unsynced writes come back after a crash
#[test]
fn test_recover_unsynced_writes() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();
    {
        let db = DB::open(dir.path(), manual_options()).unwrap();
        write_numbered(&db, 0..100);
        db.remove(b"key_50").unwrap();
        simulate_crash(db);
    }

    let db = DB::open(dir.path(), manual_options()).unwrap();
    for i in 0..100 {
        let expected = if i == 50 { None } else { Some(format!("value_{}", i).into_bytes()) };
        assert_eq!(db.get(format!("key_{}", i).as_bytes()).unwrap(), expected);
    }

    db.sync().unwrap();
    assert_eq!(db.table("default").unwrap().pending(), 0);
    assert_eq!(db.get(b"key_99").unwrap(), Some(b"value_99".to_vec()));
}

/// Test recovery of writes made on top of already synced state
#[test]
fn test_recover_on_top_of_synced_state() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();
    {
        let db = DB::open(dir.path(), manual_options()).unwrap();
        write_numbered(&db, 0..10);
        db.set(b"changed", b"v1").unwrap();
        db.set(b"dropped", b"v1").unwrap();
        db.sync().unwrap();

        write_numbered(&db, 10..20);
        db.set(b"changed", b"v2").unwrap();
        db.remove(b"dropped").unwrap();
        simulate_crash(db);
    }

    let db = DB::open(dir.path(), manual_options()).unwrap();
    // Only the writes after the sync are replayed.
    assert_eq!(db.table("default").unwrap().pending(), 12);
    assert_eq!(db.get(b"changed").unwrap(), Some(b"v2".to_vec()));
    assert_eq!(db.get(b"dropped").unwrap(), None);
    assert_eq!(db.keys(None).unwrap().len(), 21);

    db.sync().unwrap();
    assert_eq!(db.get(b"changed").unwrap(), Some(b"v2".to_vec()));
    assert_eq!(db.get(b"dropped").unwrap(), None);
}

/// Test that a torn last frame is dropped and everything before it survives
#[test]
fn test_torn_tail_is_ignored() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();
    {
        let db = DB::open(dir.path(), manual_options()).unwrap();
        write_numbered(&db, 0..10);
        simulate_crash(db);
    }

    let binlog = dir.path().join("binlog");
    let len = std::fs::metadata(&binlog).unwrap().len();
    assert_eq!(len, SMALL_FRAME_SIZE * 10);
    OpenOptions::new().write(true).open(&binlog).unwrap().set_len(len - 3).unwrap();

    let db = DB::open(dir.path(), manual_options()).unwrap();
    for i in 0..9 {
        assert_eq!(
            db.get(format!("key_{}", i).as_bytes()).unwrap(),
            Some(format!("value_{}", i).into_bytes())
        );
    }
    assert_eq!(db.get(b"key_9").unwrap(), None);

    // New commits land after the torn bytes and survive the next crash.
    db.set(b"after", b"tear").unwrap();
    simulate_crash(db);

    let db = DB::open(dir.path(), manual_options()).unwrap();
    assert_eq!(db.get(b"after").unwrap(), Some(b"tear".to_vec()));
    assert_eq!(db.get(b"key_8").unwrap(), Some(b"value_8".to_vec()));
}

/// Test that a corrupted frame in the middle is skipped and later frames are kept
#[test]
fn test_corrupt_frame_is_skipped() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();
    {
        let db = DB::open(dir.path(), manual_options()).unwrap();
        write_numbered(&db, 0..10);
        simulate_crash(db);
    }

    let binlog = dir.path().join("binlog");
    let mut bytes = std::fs::read(&binlog).unwrap();
    // Break the trailing transaction id of the fourth frame.
    let pos = (SMALL_FRAME_SIZE * 3 + 40) as usize;
    bytes[pos] ^= 0xFF;
    std::fs::write(&binlog, &bytes).unwrap();

    let db = DB::open(dir.path(), manual_options()).unwrap();
    for i in 0..10 {
        let expected = if i == 3 { None } else { Some(format!("value_{}", i).into_bytes()) };
        assert_eq!(db.get(format!("key_{}", i).as_bytes()).unwrap(), expected);
    }

    db.sync().unwrap();
    assert_eq!(std::fs::metadata(&binlog).unwrap().len(), 0);
    assert_eq!(db.keys(None).unwrap().len(), 9);
}

/// Test that one transaction over several tables is recovered as a whole
#[test]
fn test_recover_multi_table_transaction() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();
    {
        let db = DB::open(dir.path(), manual_options()).unwrap();
        let mut tx = db.begin();
        tx.set_to(b"alice", b"admin", "users").unwrap();
        tx.set_to(b"order-1", b"alice", "orders").unwrap();
        tx.set(b"counter", b"1").unwrap();
        tx.commit().unwrap();
        simulate_crash(db);
    }

    let db = DB::open(dir.path(), manual_options()).unwrap();
    assert_eq!(db.get_from(b"alice", "users").unwrap(), Some(b"admin".to_vec()));
    assert_eq!(db.get_from(b"order-1", "orders").unwrap(), Some(b"alice".to_vec()));
    assert_eq!(db.get(b"counter").unwrap(), Some(b"1".to_vec()));
    assert!(dir.path().join("orders.ix").exists());
}

/// Test that a crash after sync keeps the table files usable without a snapshot
#[test]
fn test_crash_without_space_snapshot() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();
    let before;
    {
        let db = DB::open(dir.path(), manual_options()).unwrap();
        write_numbered(&db, 0..300);
        for i in (0..300).step_by(3) {
            db.remove(format!("key_{}", i).as_bytes()).unwrap();
        }
        db.sync().unwrap();
        before = db.table("default").unwrap().space();
        simulate_crash(db);
    }
    assert!(!dir.path().join("default.fs").exists());

    let db = DB::open(dir.path(), manual_options()).unwrap();
    let table = db.table("default").unwrap();
    assert_eq!(table.space(), before);
    table.verify().unwrap();
    assert_eq!(db.keys(None).unwrap().len(), 200);
}

/// Test repeated crash and reopen cycles
#[test]
fn test_repeated_crashes() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();
    for round in 0..5 {
        let db = DB::open(dir.path(), manual_options()).unwrap();
        if round > 0 {
            assert_eq!(
                db.get(format!("round_{}", round - 1).as_bytes()).unwrap(),
                Some(vec![round as u8 - 1; 64])
            );
        }
        if round % 2 == 0 {
            db.sync().unwrap();
        }
        db.set(format!("round_{}", round).as_bytes(), &[round as u8; 64]).unwrap();
        simulate_crash(db);
    }

    let db = DB::open(dir.path(), manual_options()).unwrap();
    db.sync().unwrap();
    assert_eq!(db.keys(None).unwrap().len(), 5);
}
