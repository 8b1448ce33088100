//! Record resolution over the index -> metadata -> data chain.
//!
//! A key hashes into one of `partition_count` top-level index slots. A slot
//! is either empty, a leaf pointing at a sorted metadata list, or a split
//! pointing at a sub-index region created by deep rehash, in which case the
//! hash is re-addressed modulo the sub-region's partition count.

use super::{TableSpace, TableStore};
use crate::codec::{
    bkdr_hash64, capacity_for, encode_data_record, IndexEntry, MetaItem, COUNT_FIELD_MAX,
    DATA_OFFSET_MAX, INDEX_ENTRY_SIZE, META_ITEM_SIZE,
};
use crate::error::{Error, Result};

/// Deepest index chain a lookup will follow.
pub(crate) const MAX_INDEX_DEPTH: u32 = 256;

/// Partition counts tried by one deep rehash before giving up.
const MAX_REHASH_ATTEMPTS: u64 = 1024;

/// Where a record's index slot lives.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct IndexLocation {
    pub start: u64,
    /// Partition count of the region holding the slot.
    pub partitions: u64,
    pub depth: u32,
}

/// Outcome of the binary search over a metadata list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum MetaMatch {
    /// The slot has no list.
    #[default]
    NoList,
    /// The key is absent; it would be inserted at this item index.
    Insert(usize),
    /// The key is stored at this item index.
    Equal(usize),
}

/// The metadata list owning a record.
#[derive(Debug, Clone, Default)]
pub(crate) struct MetaLocation {
    pub start: u64,
    pub size: u64,
    pub cap: u64,
    pub buffer: Vec<u8>,
    pub found: MetaMatch,
}

/// A record's data block.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DataLocation {
    pub start: u64,
    pub size: u64,
    pub cap: u64,
}

/// Transient view of one key in a table.
#[derive(Debug, Clone, Default)]
pub(crate) struct Record {
    pub hash: u64,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub index: IndexLocation,
    pub meta: MetaLocation,
    pub data: DataLocation,
}

impl Record {
    fn new(key: &[u8]) -> Self {
        Self { hash: bkdr_hash64(key), key: key.to_vec(), ..Default::default() }
    }

    /// A record carrying only a hash, used to find the slot of a list.
    pub(crate) fn for_hash(hash: u64) -> Self {
        Self { hash, ..Default::default() }
    }

    pub(crate) fn items(&self) -> usize {
        self.meta.buffer.len() / META_ITEM_SIZE
    }
}

/// Decodes item `idx` of a metadata list.
pub(crate) fn meta_at(list: &[u8], idx: usize) -> MetaItem {
    MetaItem::decode(&list[idx * META_ITEM_SIZE..(idx + 1) * META_ITEM_SIZE])
}

impl TableStore {
    /// Finds the record of `key`.
    pub(crate) fn locate(&self, key: &[u8]) -> Result<Record> {
        let mut record = Record::new(key);
        self.resolve_index(&mut record)?;
        if record.meta.size == 0 {
            return Ok(record);
        }
        record.meta.buffer = self.meta.read_at(record.meta.start, record.meta.size as usize)?;
        self.search(&mut record)?;
        Ok(record)
    }

    /// Walks split entries down to the leaf or empty slot of `record.hash`.
    pub(crate) fn resolve_index(&self, record: &mut Record) -> Result<()> {
        let mut base = 0u64;
        let mut partitions = self.layout.partitions;

        for depth in 0..MAX_INDEX_DEPTH {
            let start = base + (record.hash % partitions) * INDEX_ENTRY_SIZE as u64;
            let entry = IndexEntry::decode(&self.index.read_at(start, INDEX_ENTRY_SIZE)?);
            match entry {
                IndexEntry::Split { sub_index, partitions: sub } => {
                    if sub == 0 {
                        return Err(Error::corruption(format!(
                            "split index entry at {} has no partitions",
                            start
                        )));
                    }
                    base = sub_index * INDEX_ENTRY_SIZE as u64;
                    partitions = sub as u64;
                }
                IndexEntry::Leaf { meta_offset, items } => {
                    record.index = IndexLocation { start, partitions, depth };
                    record.meta.start = meta_offset * self.layout.meta_bucket;
                    record.meta.size = items as u64 * META_ITEM_SIZE as u64;
                    record.meta.cap = capacity_for(record.meta.size, self.layout.meta_bucket);
                    return Ok(());
                }
                IndexEntry::Empty => {
                    record.index = IndexLocation { start, partitions, depth };
                    record.meta = MetaLocation::default();
                    return Ok(());
                }
            }
        }
        Err(Error::corruption(format!("index chain deeper than {} levels", MAX_INDEX_DEPTH)))
    }

    /// Binary search by `(hash64, key length)`, then full key comparison
    /// across the run of items sharing that pair.
    fn search(&self, record: &mut Record) -> Result<()> {
        let list = &record.meta.buffer;
        let count = list.len() / META_ITEM_SIZE;
        let target = (record.hash, record.key.len() as u8);

        let (mut lo, mut hi) = (0usize, count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if meta_at(list, mid).sort_key() < target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        let mut idx = lo;
        while idx < count {
            let item = meta_at(list, idx);
            if item.sort_key() != target {
                break;
            }
            let start = item.data_offset * self.layout.data_bucket;
            let size = item.data_size();
            let bytes = self.data.read_at(start, size as usize)?;
            let key_len = item.key_len as usize;
            if bytes[0] as usize == key_len && bytes[1..1 + key_len] == record.key[..] {
                record.meta.found = MetaMatch::Equal(idx);
                record.data = DataLocation {
                    start,
                    size,
                    cap: capacity_for(size, self.layout.data_bucket),
                };
                record.value = Some(bytes[1 + key_len..].to_vec());
                return Ok(());
            }
            // Hash collision: same (hash64, length), different key.
            idx += 1;
        }
        record.meta.found = MetaMatch::Insert(idx);
        Ok(())
    }

    /// Writes `value` for a located record and returns the replaced blocks
    /// to the allocators once the index points at the new ones.
    pub(crate) fn insert(&self, space: &mut TableSpace, record: &mut Record, value: &[u8]) -> Result<()> {
        let data_size = 1 + record.key.len() as u64 + value.len() as u64;
        let data_cap = capacity_for(data_size, self.layout.data_bucket);
        let data_start = space.data.allocate(data_cap);
        let data_offset = data_start / self.layout.data_bucket;
        if data_offset > DATA_OFFSET_MAX {
            space.data.free(data_start, data_cap);
            return Err(Error::capacity_exceeded(format!(
                "data file offset {} is beyond the addressable range",
                data_start
            )));
        }
        let buf = encode_data_record(&record.key, value, data_cap as usize);
        if let Err(e) = self.data.write_at(data_start, &buf) {
            space.data.free(data_start, data_cap);
            return Err(e);
        }

        let item = MetaItem {
            hash: record.hash,
            key_len: record.key.len() as u8,
            value_len: value.len() as u32,
            data_offset,
        };
        let mut list = record.meta.buffer.clone();
        let idx = match item.encode() {
            Ok(encoded) => match record.meta.found {
                MetaMatch::Equal(i) => {
                    list[i * META_ITEM_SIZE..(i + 1) * META_ITEM_SIZE].copy_from_slice(&encoded);
                    i
                }
                MetaMatch::Insert(i) => {
                    let at = i * META_ITEM_SIZE;
                    list.splice(at..at, encoded);
                    i
                }
                MetaMatch::NoList => {
                    list = encoded.to_vec();
                    0
                }
            },
            Err(e) => {
                space.data.free(data_start, data_cap);
                return Err(e);
            }
        };

        let (meta_start, meta_cap) = match self.write_meta_list(space, &list) {
            Ok(block) => block,
            Err(e) => {
                space.data.free(data_start, data_cap);
                return Err(e);
            }
        };
        if let Err(e) = self.write_leaf(record.index.start, meta_start, list.len()) {
            space.meta.free(meta_start, meta_cap);
            space.data.free(data_start, data_cap);
            return Err(e);
        }

        if record.meta.size > 0 {
            space.meta.free(record.meta.start, record.meta.cap);
        }
        if let MetaMatch::Equal(_) = record.meta.found {
            space.data.free(record.data.start, record.data.cap);
        }

        record.meta = MetaLocation {
            start: meta_start,
            size: list.len() as u64,
            cap: meta_cap,
            buffer: list,
            found: MetaMatch::Equal(idx),
        };
        record.data = DataLocation { start: data_start, size: data_size, cap: data_cap };
        record.value = Some(value.to_vec());

        self.check_deep_rehash(space, record)
    }

    /// Deletes a located record. Returns `false` if the key was absent.
    pub(crate) fn remove(&self, space: &mut TableSpace, record: &Record) -> Result<bool> {
        let idx = match record.meta.found {
            MetaMatch::Equal(i) => i,
            _ => return Ok(false),
        };
        let mut list = record.meta.buffer.clone();
        list.drain(idx * META_ITEM_SIZE..(idx + 1) * META_ITEM_SIZE);

        if list.is_empty() {
            self.write_entry(record.index.start, IndexEntry::Empty)?;
        } else {
            let (meta_start, meta_cap) = self.write_meta_list(space, &list)?;
            if let Err(e) = self.write_leaf(record.index.start, meta_start, list.len()) {
                space.meta.free(meta_start, meta_cap);
                return Err(e);
            }
        }

        space.meta.free(record.meta.start, record.meta.cap);
        space.data.free(record.data.start, record.data.cap);
        Ok(true)
    }

    /// Splits the record's list into a new sub-index region once it holds
    /// `max_meta_list_items` items.
    fn check_deep_rehash(&self, space: &mut TableSpace, record: &Record) -> Result<()> {
        let count = record.items();
        if count < self.layout.max_items {
            return Ok(());
        }
        if record.index.depth + 1 >= MAX_INDEX_DEPTH {
            log::warn!(
                "Slot {} is already {} levels deep, keeping {} items in one list",
                record.index.start,
                record.index.depth,
                count
            );
            return Ok(());
        }

        let hashes: Vec<u64> = (0..count).map(|i| meta_at(&record.meta.buffer, i).hash).collect();
        let mut partitions = record.index.partitions + 1;
        let mut attempts = 0;
        loop {
            if partitions > COUNT_FIELD_MAX || attempts >= MAX_REHASH_ATTEMPTS {
                log::warn!(
                    "Deep rehash of slot {} found no usable partition count, keeping {} items in one list",
                    record.index.start,
                    count
                );
                return Ok(());
            }
            let mut buckets = vec![0usize; partitions as usize];
            for &hash in &hashes {
                buckets[(hash % partitions) as usize] += 1;
            }
            if buckets.iter().all(|&c| c < self.layout.max_items) {
                break;
            }
            partitions += 1;
            attempts += 1;
        }

        // Items are visited in list order, so every sub-list stays sorted.
        let mut lists = vec![Vec::new(); partitions as usize];
        for (i, &hash) in hashes.iter().enumerate() {
            let chunk = &record.meta.buffer[i * META_ITEM_SIZE..(i + 1) * META_ITEM_SIZE];
            lists[(hash % partitions) as usize].extend_from_slice(chunk);
        }

        let meta_bucket = self.layout.meta_bucket;
        let total_cap: u64 = lists.iter().map(|l| capacity_for(l.len() as u64, meta_bucket)).sum();
        let meta_start = space.meta.allocate(total_cap);

        let encoded = (|| -> Result<(Vec<u8>, Vec<u8>)> {
            let mut meta_buf = Vec::with_capacity(total_cap as usize);
            let mut index_buf = Vec::with_capacity(lists.len() * INDEX_ENTRY_SIZE);
            let mut offset = meta_start;
            for list in &lists {
                if list.is_empty() {
                    index_buf.extend_from_slice(&IndexEntry::Empty.encode()?);
                    continue;
                }
                let cap = capacity_for(list.len() as u64, meta_bucket);
                let entry = IndexEntry::Leaf {
                    meta_offset: offset / meta_bucket,
                    items: (list.len() / META_ITEM_SIZE) as u32,
                };
                index_buf.extend_from_slice(&entry.encode()?);
                meta_buf.extend_from_slice(list);
                meta_buf.resize(meta_buf.len() + (cap as usize - list.len()), 0);
                offset += cap;
            }
            Ok((meta_buf, index_buf))
        })();
        let (meta_buf, index_buf) = match encoded {
            Ok(bufs) => bufs,
            Err(e) => {
                space.meta.free(meta_start, total_cap);
                return Err(e);
            }
        };

        if let Err(e) = self.meta.write_at(meta_start, &meta_buf) {
            space.meta.free(meta_start, total_cap);
            return Err(e);
        }
        let index_start = space.index_len;
        if let Err(e) = self.index.write_at(index_start, &index_buf) {
            space.meta.free(meta_start, total_cap);
            return Err(e);
        }
        let origin = IndexEntry::Split {
            sub_index: index_start / INDEX_ENTRY_SIZE as u64,
            partitions: partitions as u32,
        };
        if let Err(e) = self.write_entry(record.index.start, origin) {
            space.meta.free(meta_start, total_cap);
            return Err(e);
        }
        space.index_len += index_buf.len() as u64;
        space.meta.free(record.meta.start, record.meta.cap);

        log::debug!(
            "Deep rehash: slot {} split {} items into {} partitions at index offset {}",
            record.index.start,
            count,
            partitions,
            index_start
        );
        Ok(())
    }

    /// Allocates and writes a metadata list, returning its block.
    pub(crate) fn write_meta_list(&self, space: &mut TableSpace, list: &[u8]) -> Result<(u64, u64)> {
        let cap = capacity_for(list.len() as u64, self.layout.meta_bucket);
        let start = space.meta.allocate(cap);
        let mut buf = Vec::with_capacity(cap as usize);
        buf.extend_from_slice(list);
        buf.resize(cap as usize, 0);
        if let Err(e) = self.meta.write_at(start, &buf) {
            space.meta.free(start, cap);
            return Err(e);
        }
        Ok((start, cap))
    }

    /// Points the slot at `start` as a leaf holding `list_len` bytes of items.
    pub(crate) fn write_leaf(&self, slot: u64, start: u64, list_len: usize) -> Result<()> {
        let entry = IndexEntry::Leaf {
            meta_offset: start / self.layout.meta_bucket,
            items: (list_len / META_ITEM_SIZE) as u32,
        };
        self.write_entry(slot, entry)
    }

    pub(crate) fn write_entry(&self, slot: u64, entry: IndexEntry) -> Result<()> {
        let bytes = entry.encode()?;
        self.index.write_at(slot, &bytes)
    }
}
