//! Free-space tracking for the metadata and data files.
//!
//! A [`FileSpace`] keeps the set of disjoint free `(offset, size)` blocks of
//! one file together with the file's logical length. Allocation is best-fit;
//! when nothing fits, the file grows at its end. Released blocks are merged
//! with their free neighbours so the set never holds two adjacent blocks.

mod snapshot;

pub use snapshot::SpaceSnapshot;

use std::collections::{BTreeMap, BTreeSet};

/// Free-block allocator for one file.
#[derive(Debug, Clone, Default)]
pub struct FileSpace {
    /// offset -> size
    blocks: BTreeMap<u64, u64>,
    /// (size, offset), for best-fit and largest-block queries
    by_size: BTreeSet<(u64, u64)>,
    /// Logical file length: every byte below it is either free or in use.
    end: u64,
}

impl FileSpace {
    /// Creates an allocator for a file of `end` bytes that has no free space.
    pub fn new(end: u64) -> Self {
        Self { blocks: BTreeMap::new(), by_size: BTreeSet::new(), end }
    }

    /// Creates an allocator from a list of free blocks.
    pub fn from_blocks(end: u64, blocks: impl IntoIterator<Item = (u64, u64)>) -> Self {
        let mut space = Self::new(end);
        for (offset, size) in blocks {
            space.free(offset, size);
        }
        space
    }

    /// Creates an allocator whose free set is the complement of `used` in
    /// `[0, end)`. Overlapping used ranges are tolerated.
    pub fn from_used(end: u64, mut used: Vec<(u64, u64)>) -> Self {
        used.sort_unstable();
        let mut space = Self::new(end);
        let mut cursor = 0u64;
        for (offset, size) in used {
            if size == 0 {
                continue;
            }
            if offset > cursor {
                space.insert(cursor, offset.min(end) - cursor.min(end));
            }
            cursor = cursor.max(offset + size);
        }
        if cursor < end {
            space.insert(cursor, end - cursor);
        }
        space.end = space.end.max(cursor);
        space
    }

    /// Allocates `size` bytes and returns their offset.
    ///
    /// The smallest free block that fits is used and its remainder stays
    /// free. Without a fitting block the file grows by `size` bytes.
    pub fn allocate(&mut self, size: u64) -> u64 {
        if size == 0 {
            return self.end;
        }
        let found = self.by_size.range((size, 0)..).next().copied();
        match found {
            Some((block_size, offset)) => {
                self.remove(offset, block_size);
                if block_size > size {
                    self.insert(offset + size, block_size - size);
                }
                offset
            }
            None => {
                let offset = self.end;
                self.end += size;
                offset
            }
        }
    }

    /// Returns `[offset, offset + size)` to the free set.
    pub fn free(&mut self, offset: u64, size: u64) {
        if size == 0 {
            return;
        }
        let mut start = offset;
        let mut len = size;

        if let Some((&prev, &prev_size)) = self.blocks.range(..offset).next_back() {
            if prev + prev_size >= offset {
                // Adjacent or overlapping predecessor.
                self.remove(prev, prev_size);
                len = (offset + size).max(prev + prev_size) - prev;
                start = prev;
            }
        }
        loop {
            let next = self.blocks.range(start..).next().map(|(&o, &s)| (o, s));
            match next {
                Some((next, next_size)) if next <= start + len => {
                    self.remove(next, next_size);
                    len = (next + next_size).max(start + len) - start;
                }
                _ => break,
            }
        }
        self.insert(start, len);
        self.end = self.end.max(start + len);
    }

    /// Removes and returns the largest free block.
    pub fn take_largest(&mut self) -> Option<(u64, u64)> {
        let (size, offset) = self.by_size.iter().next_back().copied()?;
        self.remove(offset, size);
        Some((offset, size))
    }

    /// Size of the largest free block, 0 if there is none.
    pub fn max_block_size(&self) -> u64 {
        self.by_size.iter().next_back().map(|&(size, _)| size).unwrap_or(0)
    }

    /// Whether `[offset, offset + size)` lies entirely inside one free block.
    pub fn contains(&self, offset: u64, size: u64) -> bool {
        match self.blocks.range(..=offset).next_back() {
            Some((&start, &len)) => offset + size <= start + len,
            None => false,
        }
    }

    /// Total free bytes.
    pub fn free_bytes(&self) -> u64 {
        self.blocks.values().sum()
    }

    /// All free blocks ordered by offset.
    pub fn blocks(&self) -> Vec<(u64, u64)> {
        self.blocks.iter().map(|(&o, &s)| (o, s)).collect()
    }

    /// Number of free blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether there is no free block.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Logical length of the file.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Shrinks the logical length after the file was truncated to `end`.
    /// Free space at or beyond the new end is dropped.
    pub fn truncate(&mut self, end: u64) {
        let tail: Vec<(u64, u64)> =
            self.blocks.iter().filter(|&(&o, &s)| o + s > end).map(|(&o, &s)| (o, s)).collect();
        for (offset, size) in tail {
            self.remove(offset, size);
            if offset < end {
                self.insert(offset, end - offset);
            }
        }
        self.end = end;
    }

    fn insert(&mut self, offset: u64, size: u64) {
        if size == 0 {
            return;
        }
        self.blocks.insert(offset, size);
        self.by_size.insert((size, offset));
    }

    fn remove(&mut self, offset: u64, size: u64) {
        self.blocks.remove(&offset);
        self.by_size.remove(&(size, offset));
    }
}
