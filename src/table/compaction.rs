//! Incremental compaction of the metadata and data files.
//!
//! Each pass takes the largest free block of one file. A block at the end of
//! the file is truncated away. Otherwise the record right behind it is moved
//! to the block's start and the hole moves forward by one record, so repeated
//! passes walk free space towards the end of the file.
//!
//! A move never overwrites bytes the index still references: if the record
//! is larger than the hole, it is first copied to a scratch allocation and
//! only then into place.

use super::resolver::{meta_at, MetaMatch, Record};
use super::{TableSpace, TableStore};
use crate::codec::{INDEX_ENTRY_SIZE, META_ITEM_SIZE};
use crate::error::{Error, Result};

impl TableStore {
    /// One compaction step on the data file. Returns whether it did anything.
    pub(crate) fn compact_data(&self, space: &mut TableSpace, min_size: u64) -> Result<bool> {
        if space.data.max_block_size() < min_size.max(1) {
            return Ok(false);
        }
        let (start, size) = match space.data.take_largest() {
            Some(block) => block,
            None => return Ok(false),
        };
        if let Err(e) = self.move_data_into(space, start, size) {
            space.data.free(start, size);
            return Err(e);
        }
        Ok(true)
    }

    /// One compaction step on the metadata file. Returns whether it did anything.
    pub(crate) fn compact_meta(&self, space: &mut TableSpace, min_size: u64) -> Result<bool> {
        if space.meta.max_block_size() < min_size.max(1) {
            return Ok(false);
        }
        let (start, size) = match space.meta.take_largest() {
            Some(block) => block,
            None => return Ok(false),
        };
        if let Err(e) = self.move_meta_into(space, start, size) {
            space.meta.free(start, size);
            return Err(e);
        }
        Ok(true)
    }

    fn move_data_into(&self, space: &mut TableSpace, start: u64, size: u64) -> Result<()> {
        let next = start + size;
        if next >= space.data.end() {
            self.data.set_len(start)?;
            space.data.truncate(start);
            return Ok(());
        }

        let key_len = self.data.read_at(next, 1)?[0] as usize;
        if key_len == 0 {
            return Err(Error::corruption(format!("no data record at offset {}", next)));
        }
        let key = self.data.read_at(next + 1, key_len)?;
        let mut record = self.locate(&key)?;
        if !matches!(record.meta.found, MetaMatch::Equal(_)) || record.data.start != next {
            return Err(Error::corruption(format!(
                "data record at offset {} is not referenced by its index",
                next
            )));
        }

        let cap = record.data.cap;
        if cap <= size {
            self.relocate_data(space, &mut record, start)?;
        } else {
            let scratch = space.data.allocate(cap);
            if let Err(e) = self.relocate_data(space, &mut record, scratch) {
                space.data.free(scratch, cap);
                return Err(e);
            }
            if let Err(e) = self.relocate_data(space, &mut record, start) {
                // The record stays at the scratch block; its old place is free.
                space.data.free(next, cap);
                return Err(e);
            }
            space.data.free(scratch, cap);
        }
        space.data.free(start + cap, size);
        Ok(())
    }

    /// Copies a record's data block to `target` and repoints its metadata.
    fn relocate_data(&self, space: &mut TableSpace, record: &mut Record, target: u64) -> Result<()> {
        let idx = match record.meta.found {
            MetaMatch::Equal(i) => i,
            _ => return Err(Error::internal("relocating a record that was not found")),
        };
        let mut bytes = self.data.read_at(record.data.start, record.data.size as usize)?;
        bytes.resize(record.data.cap as usize, 0);
        self.data.write_at(target, &bytes)?;

        let mut item = meta_at(&record.meta.buffer, idx);
        item.data_offset = target / self.layout.data_bucket;
        let mut list = record.meta.buffer.clone();
        list[idx * META_ITEM_SIZE..(idx + 1) * META_ITEM_SIZE].copy_from_slice(&item.encode()?);

        let (meta_start, meta_cap) = self.write_meta_list(space, &list)?;
        if let Err(e) = self.write_leaf(record.index.start, meta_start, list.len()) {
            space.meta.free(meta_start, meta_cap);
            return Err(e);
        }
        space.meta.free(record.meta.start, record.meta.cap);

        record.meta.start = meta_start;
        record.meta.cap = meta_cap;
        record.meta.buffer = list;
        record.data.start = target;
        Ok(())
    }

    fn move_meta_into(&self, space: &mut TableSpace, start: u64, size: u64) -> Result<()> {
        let next = start + size;
        if next >= space.meta.end() {
            self.meta.set_len(start)?;
            space.meta.truncate(start);
            if start == 0 {
                self.reset_index(space)?;
            }
            return Ok(());
        }

        let first = meta_at(&self.meta.read_at(next, META_ITEM_SIZE)?, 0);
        let mut record = Record::for_hash(first.hash);
        self.resolve_index(&mut record)?;
        if record.meta.size == 0 || record.meta.start != next {
            return Err(Error::corruption(format!(
                "metadata list at offset {} is not referenced by its index",
                next
            )));
        }
        record.meta.buffer = self.meta.read_at(next, record.meta.size as usize)?;

        let cap = record.meta.cap;
        if cap <= size {
            self.relocate_meta(&mut record, start)?;
        } else {
            let scratch = space.meta.allocate(cap);
            if let Err(e) = self.relocate_meta(&mut record, scratch) {
                space.meta.free(scratch, cap);
                return Err(e);
            }
            if let Err(e) = self.relocate_meta(&mut record, start) {
                space.meta.free(next, cap);
                return Err(e);
            }
            space.meta.free(scratch, cap);
        }
        space.meta.free(start + cap, size);
        Ok(())
    }

    fn relocate_meta(&self, record: &mut Record, target: u64) -> Result<()> {
        let mut buf = record.meta.buffer.clone();
        buf.resize(record.meta.cap as usize, 0);
        self.meta.write_at(target, &buf)?;
        self.write_leaf(record.index.start, target, record.meta.buffer.len())?;
        record.meta.start = target;
        Ok(())
    }

    /// Zeroes the index once the metadata file holds no list at all.
    fn reset_index(&self, space: &mut TableSpace) -> Result<()> {
        let len = self.layout.partitions * INDEX_ENTRY_SIZE as u64;
        self.index.set_len(0)?;
        self.index.set_len(len)?;
        space.index_len = len;
        log::debug!("Index reset to {} bytes after the metadata file emptied", len);
        Ok(())
    }
}
