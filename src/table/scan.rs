//! Whole-table walks: free-space recount, item scan and integrity check.

use super::resolver::{meta_at, MAX_INDEX_DEPTH};
use super::{TableSpace, TableStore};
use crate::codec::{capacity_for, IndexEntry, INDEX_ENTRY_SIZE, META_ITEM_SIZE};
use crate::error::{Error, Result};
use crate::filespace::FileSpace;
use std::collections::BTreeMap;
use std::thread;

/// Number of concurrent shards of the free-space recount.
const RECOUNT_SHARDS: u64 = 7;

/// Blocks referenced from one part of the index.
#[derive(Debug, Default)]
struct UsedBlocks {
    meta: Vec<(u64, u64)>,
    data: Vec<(u64, u64)>,
}

impl TableStore {
    /// Rebuilds both allocators by marking every block reachable from the
    /// index as used; the rest of each file is free.
    ///
    /// The top-level partitions are cut into contiguous shards that are
    /// walked on separate threads.
    pub(crate) fn recount_space(&self) -> Result<TableSpace> {
        let index = self.index.read_all()?;
        let partitions = self.layout.partitions;
        let shard_len = partitions.div_ceil(RECOUNT_SHARDS).max(1);

        let shards: Vec<Result<UsedBlocks>> = thread::scope(|s| {
            let handles: Vec<_> = (0..RECOUNT_SHARDS)
                .map(|i| {
                    let index = &index;
                    let lo = (i * shard_len).min(partitions);
                    let hi = ((i + 1) * shard_len).min(partitions);
                    s.spawn(move || -> Result<UsedBlocks> {
                        let mut used = UsedBlocks::default();
                        for slot in lo..hi {
                            self.mark_used(index, slot * INDEX_ENTRY_SIZE as u64, 0, &mut used)?;
                        }
                        Ok(used)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|_| Err(Error::internal("free-space recount thread panicked"))))
                .collect()
        });

        let mut meta_used = Vec::new();
        let mut data_used = Vec::new();
        for shard in shards {
            let used = shard?;
            meta_used.extend(used.meta);
            data_used.extend(used.data);
        }

        let meta_len = self.meta.len()?;
        let data_len = self.data.len()?;
        Ok(TableSpace {
            meta: FileSpace::from_used(meta_len, meta_used),
            data: FileSpace::from_used(data_len, data_used),
            index_len: index.len() as u64,
        })
    }

    fn mark_used(&self, index: &[u8], pos: u64, depth: u32, used: &mut UsedBlocks) -> Result<()> {
        match entry_at(index, pos)? {
            IndexEntry::Empty => {}
            IndexEntry::Split { sub_index, partitions } => {
                if depth + 1 >= MAX_INDEX_DEPTH {
                    return Err(Error::corruption(format!("index chain below {} too deep", pos)));
                }
                for i in 0..partitions as u64 {
                    self.mark_used(index, (sub_index + i) * INDEX_ENTRY_SIZE as u64, depth + 1, used)?;
                }
            }
            IndexEntry::Leaf { meta_offset, items } => {
                let start = meta_offset * self.layout.meta_bucket;
                let size = items as u64 * META_ITEM_SIZE as u64;
                used.meta.push((start, capacity_for(size, self.layout.meta_bucket)));

                let list = self.meta.read_at(start, size as usize)?;
                for i in 0..items as usize {
                    let item = meta_at(&list, i);
                    used.data.push((
                        item.data_offset * self.layout.data_bucket,
                        capacity_for(item.data_size(), self.layout.data_bucket),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Walks the index file front to back and resolves up to `max` items
    /// into `out`, skipping keys rejected by `skip`.
    ///
    /// Split entries are passed over: their sub-regions lie further down the
    /// same file. Lists and records inside free blocks are fragments and are
    /// ignored, as are records whose data cannot be read back consistently.
    pub(crate) fn scan_into(
        &self,
        space: &TableSpace,
        max: Option<usize>,
        skip: &dyn Fn(&[u8]) -> bool,
        out: &mut BTreeMap<Vec<u8>, Vec<u8>>,
    ) -> Result<()> {
        let full = |out: &BTreeMap<Vec<u8>, Vec<u8>>| max.is_some_and(|m| out.len() >= m);
        if full(out) {
            return Ok(());
        }

        let index = self.index.read_all()?;
        for chunk in index.chunks_exact(INDEX_ENTRY_SIZE) {
            let (meta_offset, items) = match IndexEntry::decode(chunk) {
                IndexEntry::Leaf { meta_offset, items } => (meta_offset, items),
                _ => continue,
            };
            let start = meta_offset * self.layout.meta_bucket;
            let size = items as u64 * META_ITEM_SIZE as u64;
            if space.meta.contains(start, size) {
                continue;
            }
            let list = match self.meta.read_at(start, size as usize) {
                Ok(list) => list,
                Err(_) => continue,
            };

            for i in 0..items as usize {
                let item = meta_at(&list, i);
                let data_start = item.data_offset * self.layout.data_bucket;
                let data_size = item.data_size();
                if space.data.contains(data_start, data_size) {
                    continue;
                }
                let bytes = match self.data.read_at(data_start, data_size as usize) {
                    Ok(bytes) => bytes,
                    Err(_) => continue,
                };
                let key_len = item.key_len as usize;
                if bytes[0] as usize != key_len {
                    continue;
                }
                let key = &bytes[1..1 + key_len];
                if skip(key) || out.contains_key(key) {
                    continue;
                }
                out.insert(key.to_vec(), bytes[1 + key_len..].to_vec());
                if full(out) {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Walks every list reachable from the top-level partitions and checks
    /// ordering and record consistency.
    pub(crate) fn verify(&self) -> Result<IntegrityReport> {
        let index = self.index.read_all()?;
        let mut report = IntegrityReport::default();
        for slot in 0..self.layout.partitions {
            self.verify_entry(&index, slot * INDEX_ENTRY_SIZE as u64, 0, &mut report)?;
        }
        Ok(report)
    }

    fn verify_entry(&self, index: &[u8], pos: u64, depth: u32, report: &mut IntegrityReport) -> Result<()> {
        match entry_at(index, pos)? {
            IndexEntry::Empty => {}
            IndexEntry::Split { sub_index, partitions } => {
                if depth + 1 >= MAX_INDEX_DEPTH {
                    return Err(Error::corruption(format!("index chain below {} too deep", pos)));
                }
                report.splits += 1;
                for i in 0..partitions as u64 {
                    self.verify_entry(index, (sub_index + i) * INDEX_ENTRY_SIZE as u64, depth + 1, report)?;
                }
            }
            IndexEntry::Leaf { meta_offset, items } => {
                let start = meta_offset * self.layout.meta_bucket;
                let size = items as u64 * META_ITEM_SIZE as u64;
                let list = self.meta.read_at(start, size as usize)?;
                for i in 1..items as usize {
                    if meta_at(&list, i - 1).sort_key() > meta_at(&list, i).sort_key() {
                        return Err(Error::corruption(format!(
                            "metadata list at offset {} is out of order at item {}",
                            start, i
                        )));
                    }
                }
                for i in 0..items as usize {
                    let item = meta_at(&list, i);
                    let data_start = item.data_offset * self.layout.data_bucket;
                    if self.data.read_at(data_start, 1)?[0] != item.key_len {
                        return Err(Error::corruption(format!(
                            "data record at offset {} does not match its metadata",
                            data_start
                        )));
                    }
                    report.data_bytes += capacity_for(item.data_size(), self.layout.data_bucket);
                }
                report.lists += 1;
                report.items += items as u64;
                report.largest_list = report.largest_list.max(items as usize);
                report.max_depth = report.max_depth.max(depth);
                report.meta_bytes += capacity_for(size, self.layout.meta_bucket);
            }
        }
        Ok(())
    }
}

fn entry_at(index: &[u8], pos: u64) -> Result<IndexEntry> {
    let pos = pos as usize;
    match index.get(pos..pos + INDEX_ENTRY_SIZE) {
        Some(bytes) => Ok(IndexEntry::decode(bytes)),
        None => Err(Error::corruption(format!("index entry at {} is past the end of the index", pos))),
    }
}

/// Result of a table integrity check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    /// Non-empty metadata lists.
    pub lists: u64,
    /// Items across all lists.
    pub items: u64,
    /// Split index entries.
    pub splits: u64,
    /// Deepest leaf below the top level.
    pub max_depth: u32,
    /// Item count of the longest list.
    pub largest_list: usize,
    /// Allocated bytes of live metadata lists.
    pub meta_bytes: u64,
    /// Allocated bytes of live data records.
    pub data_bytes: u64,
}
