//! Hashed on-disk tables.
//!
//! A table lives in three files:
//!
//! - `<name>.ix`: index entries, pre-sized to one entry per top-level partition
//!   and extended by deep rehash
//! - `<name>.mt`: sorted metadata lists
//! - `<name>.db`: data records
//!
//! plus an optional `<name>.fs` snapshot of the free-space allocators.
//!
//! All mutation runs under the table's exclusive lock, lookups under its
//! shared lock, so the multi-step index -> metadata -> data chain is always
//! observed whole.

mod compaction;
mod resolver;
mod scan;

pub use scan::IntegrityReport;

use crate::cache::ValueCache;
use crate::codec::INDEX_ENTRY_SIZE;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::file::FileHandle;
use crate::filespace::{FileSpace, SpaceSnapshot};
use crate::memtable::MemTable;
use parking_lot::RwLock;
use resolver::MetaMatch;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Format parameters of a table.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Layout {
    pub partitions: u64,
    pub max_items: usize,
    pub meta_bucket: u64,
    pub data_bucket: u64,
}

impl Layout {
    fn from_options(options: &Options) -> Self {
        Self {
            partitions: options.partition_count as u64,
            max_items: options.max_meta_list_items as usize,
            meta_bucket: options.meta_bucket_size(),
            data_bucket: options.data_bucket_size as u64,
        }
    }
}

/// The three files of a table.
#[derive(Debug)]
pub(crate) struct TableStore {
    pub layout: Layout,
    pub index: FileHandle,
    pub meta: FileHandle,
    pub data: FileHandle,
}

/// Allocator state of a table, guarded by the table lock.
#[derive(Debug, Clone)]
pub(crate) struct TableSpace {
    pub meta: FileSpace,
    pub data: FileSpace,
    pub index_len: u64,
}

impl TableSpace {
    fn snapshot(&self) -> SpaceSnapshot {
        SpaceSnapshot {
            index_len: self.index_len,
            meta_len: self.meta.end(),
            data_len: self.data.end(),
            meta_blocks: self.meta.blocks(),
            data_blocks: self.data.blocks(),
        }
    }
}

/// Free-space report of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceInfo {
    /// Index file length.
    pub index_len: u64,
    /// Metadata file length.
    pub meta_len: u64,
    /// Free blocks of the metadata file.
    pub meta_free: Vec<(u64, u64)>,
    /// Data file length.
    pub data_len: u64,
    /// Free blocks of the data file.
    pub data_free: Vec<(u64, u64)>,
}

impl SpaceInfo {
    /// Free bytes in the metadata file.
    pub fn meta_free_bytes(&self) -> u64 {
        self.meta_free.iter().map(|&(_, size)| size).sum()
    }

    /// Free bytes in the data file.
    pub fn data_free_bytes(&self) -> u64 {
        self.data_free.iter().map(|&(_, size)| size).sum()
    }
}

/// One opened table: its files, allocators, overlay and cache.
pub(crate) struct DiskTable {
    name: String,
    store: TableStore,
    space: RwLock<TableSpace>,
    memtable: MemTable,
    cache: Option<ValueCache>,
    compaction_min_size: u64,
    space_path: Option<PathBuf>,
    /// The side file matches the in-memory allocators.
    snapshot_on_disk: AtomicBool,
    /// A compaction pass is running.
    compacting: AtomicBool,
}

impl DiskTable {
    /// Opens or creates table `name` under `dir`.
    pub(crate) fn open(dir: &Path, name: &str, options: &Options) -> Result<Self> {
        let layout = Layout::from_options(options);
        let store = TableStore {
            layout,
            index: FileHandle::open(dir.join(format!("{}.ix", name)))?,
            meta: FileHandle::open(dir.join(format!("{}.mt", name)))?,
            data: FileHandle::open(dir.join(format!("{}.db", name)))?,
        };

        let index_min = layout.partitions * INDEX_ENTRY_SIZE as u64;
        let index_len = store.index.len()?;
        if index_len == 0 {
            store.index.set_len(index_min)?;
        } else if index_len < index_min || index_len % INDEX_ENTRY_SIZE as u64 != 0 {
            return Err(Error::corruption(format!(
                "index file of table {} has length {}, expected at least {} in {}-byte entries",
                name, index_len, index_min, INDEX_ENTRY_SIZE
            )));
        }

        let space_path = options.persist_free_space.then(|| dir.join(format!("{}.fs", name)));
        let (space, restored) = Self::load_space(&store, name, space_path.as_deref())?;
        log::info!(
            "Opened table {}: {} free metadata blocks, {} free data blocks ({})",
            name,
            space.meta.len(),
            space.data.len(),
            if restored { "snapshot" } else { "recounted" }
        );

        let cache = options
            .value_cache_ttl
            .map(|ttl| ValueCache::new(options.value_cache_capacity, ttl));

        Ok(Self {
            name: name.to_string(),
            store,
            space: RwLock::new(space),
            memtable: MemTable::new(),
            cache,
            compaction_min_size: options.compaction_min_size,
            space_path,
            snapshot_on_disk: AtomicBool::new(restored),
            compacting: AtomicBool::new(false),
        })
    }

    /// Restores the allocators from the side file when it matches the files
    /// on disk, and recounts them otherwise.
    fn load_space(store: &TableStore, name: &str, path: Option<&Path>) -> Result<(TableSpace, bool)> {
        if let Some(path) = path {
            match SpaceSnapshot::load(path) {
                Ok(Some(snapshot)) => {
                    let fresh = snapshot.index_len == store.index.len()?
                        && snapshot.meta_len == store.meta.len()?
                        && snapshot.data_len == store.data.len()?;
                    if fresh {
                        let space = TableSpace {
                            meta: FileSpace::from_blocks(snapshot.meta_len, snapshot.meta_blocks),
                            data: FileSpace::from_blocks(snapshot.data_len, snapshot.data_blocks),
                            index_len: snapshot.index_len,
                        };
                        return Ok((space, true));
                    }
                    log::warn!("Free-space snapshot of table {} is stale, recounting", name);
                    SpaceSnapshot::remove(path)?;
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("Ignoring free-space snapshot of table {}: {}", name, e);
                    SpaceSnapshot::remove(path)?;
                }
            }
        }
        Ok((store.recount_space()?, false))
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn memtable(&self) -> &MemTable {
        &self.memtable
    }

    /// Reads `key` through the overlay, then the cache, then the files.
    pub(crate) fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(entry) = self.memtable.get(key) {
            return Ok(entry.into_option());
        }
        self.get_stored(key)
    }

    /// Reads `key` from the hashed files only.
    pub(crate) fn get_stored(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(cache) = &self.cache {
            if let Some(value) = cache.get(key) {
                return Ok(Some(value.to_vec()));
            }
        }

        let _space = self.space.read();
        let record = self.store.locate(key)?;
        if let (Some(cache), Some(value)) = (&self.cache, &record.value) {
            cache.insert(key, value);
        }
        Ok(record.value)
    }

    /// Writes `key` into the hashed files.
    pub(crate) fn apply_set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut space = self.space.write();
        let mut record = self.store.locate(key)?;
        if matches!(record.meta.found, MetaMatch::Equal(_)) && record.value.as_deref() == Some(value) {
            return Ok(());
        }
        self.begin_mutation()?;
        if let Some(cache) = &self.cache {
            cache.invalidate(key);
        }
        self.store.insert(&mut space, &mut record, value)
    }

    /// Removes `key` from the hashed files.
    pub(crate) fn apply_remove(&self, key: &[u8]) -> Result<()> {
        let mut space = self.space.write();
        let record = self.store.locate(key)?;
        if !matches!(record.meta.found, MetaMatch::Equal(_)) {
            return Ok(());
        }
        self.begin_mutation()?;
        if let Some(cache) = &self.cache {
            cache.invalidate(key);
        }
        self.store.remove(&mut space, &record)?;
        Ok(())
    }

    /// Drops the free-space side file before the allocators change.
    fn begin_mutation(&self) -> Result<()> {
        if self.snapshot_on_disk.swap(false, Ordering::AcqRel) {
            if let Some(path) = &self.space_path {
                if let Err(e) = SpaceSnapshot::remove(path) {
                    self.snapshot_on_disk.store(true, Ordering::Release);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Up to `max` items (`None` = all): overlay entries first, then the
    /// hashed files, leaving out keys the overlay has deleted.
    pub(crate) fn items(&self, max: Option<usize>) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        let mut out = self.memtable.items(max);
        let pending = |key: &[u8]| self.memtable.get(key).is_some();
        let space = self.space.read();
        self.store.scan_into(&space, max, &pending, &mut out)?;
        Ok(out)
    }

    /// Runs one compaction step on each file. Returns whether anything moved.
    ///
    /// A pass that finds another pass running returns immediately.
    pub(crate) fn compact_step(&self) -> Result<bool> {
        if self.compacting.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        let result = self.compact_step_locked();
        self.compacting.store(false, Ordering::Release);
        result
    }

    fn compact_step_locked(&self) -> Result<bool> {
        let mut space = self.space.write();
        let min = self.compaction_min_size;
        if space.data.max_block_size() < min.max(1) && space.meta.max_block_size() < min.max(1) {
            return Ok(false);
        }
        self.begin_mutation()?;
        let data_moved = self.store.compact_data(&mut space, min)?;
        let meta_moved = self.store.compact_meta(&mut space, min)?;
        if data_moved || meta_moved {
            log::debug!(
                "Compacted table {}: data {} bytes / {} free, meta {} bytes / {} free",
                self.name,
                space.data.end(),
                space.data.free_bytes(),
                space.meta.end(),
                space.meta.free_bytes()
            );
        }
        Ok(data_moved || meta_moved)
    }

    /// Whether a compaction pass is running right now.
    pub(crate) fn is_compacting(&self) -> bool {
        self.compacting.load(Ordering::Acquire)
    }

    /// Writes the free-space side file if it is out of date.
    pub(crate) fn persist_space(&self) -> Result<()> {
        let path = match &self.space_path {
            Some(path) => path,
            None => return Ok(()),
        };
        // Mutations take the write lock, so the allocators cannot change
        // between the snapshot and the flag update.
        let space = self.space.read();
        if self.snapshot_on_disk.load(Ordering::Acquire) {
            return Ok(());
        }
        space.snapshot().save(path)?;
        self.snapshot_on_disk.store(true, Ordering::Release);
        Ok(())
    }

    /// Current allocator state.
    pub(crate) fn space_info(&self) -> SpaceInfo {
        let space = self.space.read();
        SpaceInfo {
            index_len: space.index_len,
            meta_len: space.meta.end(),
            meta_free: space.meta.blocks(),
            data_len: space.data.end(),
            data_free: space.data.blocks(),
        }
    }

    /// Checks ordering and consistency of every reachable list.
    pub(crate) fn verify(&self) -> Result<IntegrityReport> {
        let _space = self.space.read();
        self.store.verify()
    }

    /// Flushes the three files to stable storage.
    pub(crate) fn sync_files(&self) -> Result<()> {
        let _space = self.space.read();
        self.store.index.sync()?;
        self.store.meta.sync()?;
        self.store.data.sync()
    }

    pub(crate) fn cache(&self) -> Option<&ValueCache> {
        self.cache.as_ref()
    }
}
