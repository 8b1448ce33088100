//! Configuration options for the drhdb storage engine.

use crate::codec::{COUNT_FIELD_MAX, META_ITEM_SIZE};
use std::time::Duration;

/// Default number of top-level hash partitions.
pub const DEFAULT_PARTITION_COUNT: u32 = 100_000;

/// Default number of items a metadata list may hold before it is split.
pub const DEFAULT_MAX_META_LIST_ITEMS: u32 = 65_535;

/// Configuration options for opening a database.
///
/// `partition_count`, `meta_bucket_items` and `data_bucket_size` describe the
/// on-disk format. They must stay the same across opens of one directory.
#[derive(Debug, Clone)]
pub struct Options {
    /// Create the database directory if it doesn't exist.
    /// Default: true
    pub create_if_missing: bool,

    /// Number of top-level partitions in every index file.
    /// Default: 100000
    pub partition_count: u32,

    /// A metadata list reaching this many items is split by deep rehash.
    /// Default: 65535
    pub max_meta_list_items: u32,

    /// Metadata allocation granularity, in metadata items.
    /// Default: 5 (85 bytes)
    pub meta_bucket_items: u32,

    /// Data allocation granularity in bytes.
    /// Default: 32
    pub data_bucket_size: u32,

    /// fsync the binlog after every appended transaction.
    /// Default: false
    pub sync_binlog: bool,

    /// Unsynced bytes queued in the binlog before committers block.
    /// Default: 20MB
    pub binlog_queue_limit: usize,

    /// Run the background flush and compaction tasks.
    /// When disabled, use `DB::sync` and `Table::compact` explicitly.
    /// Default: true
    pub auto_sync: bool,

    /// Interval of the background flush task.
    /// Default: 100ms
    pub flush_interval: Duration,

    /// Interval of the background compaction task.
    /// Default: 100ms
    pub compaction_interval: Duration,

    /// Free blocks smaller than this are left alone by compaction.
    /// Default: 512
    pub compaction_min_size: u64,

    /// Time-to-live of cached values. `None` disables the value cache.
    /// Default: 10s
    pub value_cache_ttl: Option<Duration>,

    /// Per-table value cache capacity in bytes.
    /// Default: 8MB
    pub value_cache_capacity: usize,

    /// Keep a snapshot of the free-space allocators next to each table.
    /// Default: true
    pub persist_free_space: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            partition_count: DEFAULT_PARTITION_COUNT,
            max_meta_list_items: DEFAULT_MAX_META_LIST_ITEMS,
            meta_bucket_items: 5,
            data_bucket_size: 32,
            sync_binlog: false,
            binlog_queue_limit: 20 * 1024 * 1024, // 20MB
            auto_sync: true,
            flush_interval: Duration::from_millis(100),
            compaction_interval: Duration::from_millis(100),
            compaction_min_size: 512,
            value_cache_ttl: Some(Duration::from_millis(10_000)),
            value_cache_capacity: 8 * 1024 * 1024, // 8MB
            persist_free_space: true,
        }
    }
}

impl Options {
    /// Creates a new Options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the database if it doesn't exist.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the number of top-level partitions.
    pub fn partition_count(mut self, count: u32) -> Self {
        self.partition_count = count;
        self
    }

    /// Sets the item count at which a metadata list is split.
    pub fn max_meta_list_items(mut self, items: u32) -> Self {
        self.max_meta_list_items = items;
        self
    }

    /// Sets the data allocation granularity.
    pub fn data_bucket_size(mut self, size: u32) -> Self {
        self.data_bucket_size = size;
        self
    }

    /// Enables or disables fsync of every binlog append.
    pub fn sync_binlog(mut self, value: bool) -> Self {
        self.sync_binlog = value;
        self
    }

    /// Sets the binlog backpressure limit.
    pub fn binlog_queue_limit(mut self, bytes: usize) -> Self {
        self.binlog_queue_limit = bytes;
        self
    }

    /// Enables or disables the background tasks.
    pub fn auto_sync(mut self, value: bool) -> Self {
        self.auto_sync = value;
        self
    }

    /// Sets the flush task interval.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Sets the compaction task interval.
    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    /// Sets the minimum free block size worth compacting.
    pub fn compaction_min_size(mut self, size: u64) -> Self {
        self.compaction_min_size = size;
        self
    }

    /// Sets the value cache TTL, `None` disables the cache.
    pub fn value_cache_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.value_cache_ttl = ttl;
        self
    }

    /// Enables or disables the free-space snapshot file.
    pub fn persist_free_space(mut self, value: bool) -> Self {
        self.persist_free_space = value;
        self
    }

    /// Metadata bucket size in bytes.
    pub fn meta_bucket_size(&self) -> u64 {
        self.meta_bucket_items as u64 * META_ITEM_SIZE as u64
    }

    /// Validates the options and returns an error if any are invalid.
    pub fn validate(&self) -> crate::Result<()> {
        // Split entries store partition counts in the 19-bit field and every
        // split grows the count, so the top level must leave room above it.
        if self.partition_count == 0 || self.partition_count as u64 >= COUNT_FIELD_MAX {
            return Err(crate::Error::invalid_argument(format!(
                "partition_count must be in 1..{}",
                COUNT_FIELD_MAX
            )));
        }
        if self.max_meta_list_items < 2 || self.max_meta_list_items as u64 > COUNT_FIELD_MAX {
            return Err(crate::Error::invalid_argument(format!(
                "max_meta_list_items must be in 2..={}",
                COUNT_FIELD_MAX
            )));
        }
        if self.meta_bucket_items == 0 {
            return Err(crate::Error::invalid_argument("meta_bucket_items must be > 0"));
        }
        if self.data_bucket_size == 0 {
            return Err(crate::Error::invalid_argument("data_bucket_size must be > 0"));
        }
        if self.binlog_queue_limit == 0 {
            return Err(crate::Error::invalid_argument("binlog_queue_limit must be > 0"));
        }
        if self.flush_interval.is_zero() || self.compaction_interval.is_zero() {
            return Err(crate::Error::invalid_argument("background intervals must be > 0"));
        }
        Ok(())
    }
}
