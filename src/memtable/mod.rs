//! # MemTable - In-Memory Overlay
//!
//! The MemTable holds every committed write that has not yet been flushed
//! from the binlog into the hashed files of its table. Reads consult it
//! before the table.
//!
//! ## Design
//!
//! - Based on crossbeam-skiplist for lock-free concurrent access
//! - Deletes are kept as tombstones so a pending delete hides the stored value
//! - Cleared only after the binlog has been fully drained and truncated

use crossbeam_skiplist::SkipMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A value held by the overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemEntry {
    /// The key was set to this value.
    Value(Vec<u8>),
    /// The key was removed.
    Tombstone,
}

impl MemEntry {
    /// Converts a log value (`None` = delete) into an entry.
    pub fn from_option(value: Option<Vec<u8>>) -> Self {
        match value {
            Some(v) => MemEntry::Value(v),
            None => MemEntry::Tombstone,
        }
    }

    /// The value, or `None` for a tombstone.
    pub fn into_option(self) -> Option<Vec<u8>> {
        match self {
            MemEntry::Value(v) => Some(v),
            MemEntry::Tombstone => None,
        }
    }
}

fn entry_size(key: &[u8], entry: &MemEntry) -> usize {
    key.len()
        + match entry {
            MemEntry::Value(v) => v.len(),
            MemEntry::Tombstone => 0,
        }
}

/// Overlay of unflushed writes of one table.
///
/// # Example
///
/// ```rust
/// use drhdb::memtable::{MemEntry, MemTable};
///
/// let memtable = MemTable::new();
/// memtable.put(b"key", b"value");
/// assert_eq!(memtable.get(b"key"), Some(MemEntry::Value(b"value".to_vec())));
/// memtable.delete(b"key");
/// assert_eq!(memtable.get(b"key"), Some(MemEntry::Tombstone));
/// assert_eq!(memtable.get(b"other"), None);
/// ```
#[derive(Debug, Default)]
pub struct MemTable {
    data: SkipMap<Vec<u8>, MemEntry>,
    /// Approximate size in bytes (keys + values)
    size: AtomicUsize,
}

impl MemTable {
    /// Creates a new empty MemTable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` to `value`.
    pub fn put(&self, key: &[u8], value: &[u8]) {
        self.insert(key.to_vec(), MemEntry::Value(value.to_vec()));
    }

    /// Records a tombstone for `key`.
    pub fn delete(&self, key: &[u8]) {
        self.insert(key.to_vec(), MemEntry::Tombstone);
    }

    /// Inserts an entry, replacing any previous one for the key.
    ///
    /// Writers of one key are serialized by the binlog, so the size
    /// accounting of a replaced entry does not race with itself.
    pub fn insert(&self, key: Vec<u8>, entry: MemEntry) {
        let added = entry_size(&key, &entry);
        let replaced = self.data.get(&key).map(|e| entry_size(e.key(), e.value()));
        self.data.insert(key, entry);
        self.size.fetch_add(added, Ordering::Relaxed);
        if let Some(replaced) = replaced {
            let _ = self
                .size
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |size| Some(size.saturating_sub(replaced)));
        }
    }

    /// Applies a batch of writes, `None` meaning delete.
    pub fn apply<'a, I>(&self, writes: I)
    where
        I: IntoIterator<Item = (&'a Vec<u8>, &'a Option<Vec<u8>>)>,
    {
        for (key, value) in writes {
            self.insert(key.clone(), MemEntry::from_option(value.clone()));
        }
    }

    /// Looks up `key`.
    ///
    /// `None` means the overlay knows nothing about the key and the table
    /// must be consulted; `Some(MemEntry::Tombstone)` means it is deleted.
    pub fn get(&self, key: &[u8]) -> Option<MemEntry> {
        self.data.get(key).map(|entry| entry.value().clone())
    }

    /// Up to `max` live key/value pairs (`None` = all). Tombstones are
    /// left out; use [`MemTable::get`] to tell a deleted key apart.
    pub fn items(&self, max: Option<usize>) -> BTreeMap<Vec<u8>, Vec<u8>> {
        let mut live = BTreeMap::new();
        for entry in self.data.iter() {
            if max.is_some_and(|m| live.len() >= m) {
                break;
            }
            if let MemEntry::Value(v) = entry.value() {
                live.insert(entry.key().clone(), v.clone());
            }
        }
        live
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.data.clear();
        self.size.store(0, Ordering::Relaxed);
    }

    /// Returns the bytes of keys and values currently held.
    pub fn approximate_size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Returns the number of entries, tombstones included.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the MemTable contains no entries.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
