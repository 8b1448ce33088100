//! Bit-packed binary layouts of the hashed files.
//!
//! All multi-field records are packed most-significant-field-first:
//!
//! ```text
//! index entry  (7 bytes):  meta offset / sub-index base (36) | item count / partitions (19) | split flag (1)
//! meta item   (17 bytes):  hash64 (64) | key length (8) | value length (24) | data offset (40)
//! data record (variable):  key length (1 byte) | key | value | zero padding up to capacity
//! ```
//!
//! Offsets stored in index entries and metadata items are multiples of the
//! corresponding bucket size, which is what lets 36/40-bit fields address
//! files far larger than 2^36/2^40 bytes.

use crate::error::{Error, Result};

/// Size of one index entry in bytes.
pub const INDEX_ENTRY_SIZE: usize = 7;

/// Size of one metadata item in bytes.
pub const META_ITEM_SIZE: usize = 17;

/// Maximum key length in bytes.
pub const MAX_KEY_SIZE: usize = 0xFF;

/// Maximum value length in bytes (24-bit length field).
pub const MAX_VALUE_SIZE: usize = 0xFF_FFFF;

/// Maximum table name length in bytes.
pub const MAX_TABLE_NAME_SIZE: usize = 0xFF;

/// Width of the metadata offset / sub-index base field.
pub const OFFSET_FIELD_BITS: u32 = 36;

/// Width of the item count / partition count field.
pub const COUNT_FIELD_BITS: u32 = 19;

/// Width of the data offset field of a metadata item.
pub const DATA_OFFSET_BITS: u32 = 40;

/// Largest value of the 36-bit offset field.
pub const OFFSET_FIELD_MAX: u64 = (1 << OFFSET_FIELD_BITS) - 1;

/// Largest value of the 19-bit count field.
pub const COUNT_FIELD_MAX: u64 = (1 << COUNT_FIELD_BITS) - 1;

/// Largest value of the 40-bit data offset field.
pub const DATA_OFFSET_MAX: u64 = (1 << DATA_OFFSET_BITS) - 1;

/// 64-bit BKDR hash (seed 131) with the top bit cleared.
pub fn bkdr_hash64(key: &[u8]) -> u64 {
    let mut hash: u64 = 0;
    for &b in key {
        hash = hash.wrapping_mul(131).wrapping_add(b as u64);
    }
    hash & 0x7FFF_FFFF_FFFF_FFFF
}

/// Rounds `size` up to the next multiple of `bucket`.
pub fn capacity_for(size: u64, bucket: u64) -> u64 {
    if size > 0 && size % bucket != 0 {
        size + bucket - size % bucket
    } else {
        size
    }
}

/// Packs fields MSB-first into a byte buffer.
#[derive(Debug, Default)]
pub struct BitWriter {
    buf: Vec<u8>,
    acc: u128,
    bits: u32,
}

impl BitWriter {
    /// Creates a writer with room for `bytes` output bytes.
    pub fn with_capacity(bytes: usize) -> Self {
        Self { buf: Vec::with_capacity(bytes), acc: 0, bits: 0 }
    }

    /// Appends the low `width` bits of `value`.
    pub fn put(&mut self, value: u64, width: u32) {
        debug_assert!(width > 0 && width <= 64);
        debug_assert!(width == 64 || value >> width == 0, "{} does not fit {} bits", value, width);
        let value = if width == 64 { value } else { value & ((1u64 << width) - 1) };

        self.acc = (self.acc << width) | value as u128;
        self.bits += width;
        while self.bits >= 8 {
            self.buf.push((self.acc >> (self.bits - 8)) as u8);
            self.bits -= 8;
        }
        self.acc &= (1u128 << self.bits) - 1;
    }

    /// Returns the packed bytes. The total width must be a multiple of 8.
    pub fn finish(self) -> Vec<u8> {
        debug_assert_eq!(self.bits, 0, "bit stream is not byte aligned");
        self.buf
    }
}

/// Reads MSB-first packed fields back out of a byte slice.
#[derive(Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
    acc: u128,
    bits: u32,
}

impl<'a> BitReader<'a> {
    /// Creates a reader over `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0, acc: 0, bits: 0 }
    }

    /// Reads the next `width` bits. Missing input bits read as zero.
    pub fn get(&mut self, width: u32) -> u64 {
        debug_assert!(width > 0 && width <= 64);
        while self.bits < width {
            let byte = self.data.get(self.pos).copied().unwrap_or(0);
            self.pos += 1;
            self.acc = (self.acc << 8) | byte as u128;
            self.bits += 8;
        }
        let value = (self.acc >> (self.bits - width)) as u64;
        self.bits -= width;
        self.acc &= (1u128 << self.bits) - 1;
        if width == 64 {
            value
        } else {
            value & ((1u64 << width) - 1)
        }
    }
}

/// One slot of an index region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexEntry {
    /// The partition holds no data.
    Empty,
    /// Points at a metadata list.
    Leaf {
        /// Offset of the list in metadata buckets.
        meta_offset: u64,
        /// Number of items in the list.
        items: u32,
    },
    /// Points at a sub-index region created by deep rehash.
    Split {
        /// Offset of the sub-index region in index entries.
        sub_index: u64,
        /// Number of entries in the sub-index region.
        partitions: u32,
    },
}

impl IndexEntry {
    /// Decodes an entry from the first [`INDEX_ENTRY_SIZE`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Self {
        let mut reader = BitReader::new(buf);
        let offset = reader.get(OFFSET_FIELD_BITS);
        let count = reader.get(COUNT_FIELD_BITS) as u32;
        let split = reader.get(1) == 1;

        if split {
            IndexEntry::Split { sub_index: offset, partitions: count }
        } else if count == 0 {
            IndexEntry::Empty
        } else {
            IndexEntry::Leaf { meta_offset: offset, items: count }
        }
    }

    /// Encodes the entry, failing if a field does not fit its width.
    pub fn encode(&self) -> Result<[u8; INDEX_ENTRY_SIZE]> {
        let (offset, count, flag) = match *self {
            IndexEntry::Empty => (0, 0, 0),
            IndexEntry::Leaf { meta_offset, items } => (meta_offset, items as u64, 0),
            IndexEntry::Split { sub_index, partitions } => (sub_index, partitions as u64, 1),
        };
        if offset > OFFSET_FIELD_MAX {
            return Err(Error::capacity_exceeded(format!(
                "index offset field {} exceeds {} bits",
                offset, OFFSET_FIELD_BITS
            )));
        }
        if count > COUNT_FIELD_MAX {
            return Err(Error::capacity_exceeded(format!(
                "index count field {} exceeds {} bits",
                count, COUNT_FIELD_BITS
            )));
        }

        let mut writer = BitWriter::with_capacity(INDEX_ENTRY_SIZE);
        writer.put(offset, OFFSET_FIELD_BITS);
        writer.put(count, COUNT_FIELD_BITS);
        writer.put(flag, 1);

        let mut out = [0u8; INDEX_ENTRY_SIZE];
        out.copy_from_slice(&writer.finish());
        Ok(out)
    }
}

/// One entry of a sorted metadata list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaItem {
    /// BKDR64 hash of the key.
    pub hash: u64,
    /// Key length in bytes.
    pub key_len: u8,
    /// Value length in bytes.
    pub value_len: u32,
    /// Offset of the data record in data buckets.
    pub data_offset: u64,
}

impl MetaItem {
    /// Decodes an item from the first [`META_ITEM_SIZE`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Self {
        let mut reader = BitReader::new(buf);
        MetaItem {
            hash: reader.get(64),
            key_len: reader.get(8) as u8,
            value_len: reader.get(24) as u32,
            data_offset: reader.get(DATA_OFFSET_BITS),
        }
    }

    /// Encodes the item, failing if the data offset does not fit 40 bits.
    pub fn encode(&self) -> Result<[u8; META_ITEM_SIZE]> {
        if self.data_offset > DATA_OFFSET_MAX {
            return Err(Error::capacity_exceeded(format!(
                "data offset {} exceeds {} bits",
                self.data_offset, DATA_OFFSET_BITS
            )));
        }
        if self.value_len as usize > MAX_VALUE_SIZE {
            return Err(Error::invalid_argument(format!("value length {}", self.value_len)));
        }

        let mut writer = BitWriter::with_capacity(META_ITEM_SIZE);
        writer.put(self.hash, 64);
        writer.put(self.key_len as u64, 8);
        writer.put(self.value_len as u64, 24);
        writer.put(self.data_offset, DATA_OFFSET_BITS);

        let mut out = [0u8; META_ITEM_SIZE];
        out.copy_from_slice(&writer.finish());
        Ok(out)
    }

    /// The ordering key of metadata lists.
    pub fn sort_key(&self) -> (u64, u8) {
        (self.hash, self.key_len)
    }

    /// Bytes used by the data record this item points at.
    pub fn data_size(&self) -> u64 {
        1 + self.key_len as u64 + self.value_len as u64
    }
}

/// Builds a data record padded with zeros to `cap` bytes.
pub fn encode_data_record(key: &[u8], value: &[u8], cap: usize) -> Vec<u8> {
    debug_assert!(key.len() <= MAX_KEY_SIZE);
    let mut buf = Vec::with_capacity(cap);
    buf.push(key.len() as u8);
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    buf.resize(cap.max(buf.len()), 0);
    buf
}

/// Checks key length bounds.
pub fn check_key(key: &[u8]) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_SIZE {
        return Err(Error::invalid_argument(format!(
            "invalid key size {}, should be in 1 and {} bytes",
            key.len(),
            MAX_KEY_SIZE
        )));
    }
    Ok(())
}

/// Checks value length bounds.
pub fn check_value(value: &[u8]) -> Result<()> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(Error::invalid_argument(format!(
            "too large value size {}, max allowed: {} bytes",
            value.len(),
            MAX_VALUE_SIZE
        )));
    }
    Ok(())
}

/// Checks table name length bounds and rejects path separators.
pub fn check_table_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_TABLE_NAME_SIZE {
        return Err(Error::invalid_argument(format!(
            "invalid table name size {}, should be in 1 and {} bytes",
            name.len(),
            MAX_TABLE_NAME_SIZE
        )));
    }
    if name.contains(['/', '\\', '\0']) || name == "." || name == ".." {
        return Err(Error::invalid_argument(format!("invalid table name {:?}", name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_entry_bit_layout() {
        let entry = IndexEntry::Leaf { meta_offset: 1, items: 1 };
        // offset=1 lands on bit 35 of the stream, count=1 on bit 54.
        assert_eq!(entry.encode().unwrap(), [0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x02]);

        let split = IndexEntry::Split { sub_index: OFFSET_FIELD_MAX, partitions: 3 };
        let bytes = split.encode().unwrap();
        assert_eq!(bytes[0], 0xFF);
        assert_eq!(bytes[6] & 0x01, 1);
        assert_eq!(IndexEntry::decode(&bytes), split);
    }

    #[test]
    fn test_index_entry_empty_is_zero() {
        assert_eq!(IndexEntry::Empty.encode().unwrap(), [0u8; INDEX_ENTRY_SIZE]);
        assert_eq!(IndexEntry::decode(&[0u8; INDEX_ENTRY_SIZE]), IndexEntry::Empty);
    }

    #[test]
    fn test_index_entry_overflow() {
        let entry = IndexEntry::Leaf { meta_offset: OFFSET_FIELD_MAX + 1, items: 1 };
        assert!(matches!(entry.encode(), Err(Error::CapacityExceeded(_))));

        let entry = IndexEntry::Split { sub_index: 1, partitions: COUNT_FIELD_MAX as u32 + 1 };
        assert!(matches!(entry.encode(), Err(Error::CapacityExceeded(_))));
    }

    #[test]
    fn test_meta_item_layout() {
        let item = MetaItem {
            hash: 0x0102_0304_0506_0708,
            key_len: 0x09,
            value_len: 0x0A0B0C,
            data_offset: 0x0D_0E0F_1011,
        };
        let bytes = item.encode().unwrap();
        assert_eq!(
            bytes,
            [
                0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D,
                0x0E, 0x0F, 0x10, 0x11
            ]
        );
        assert_eq!(MetaItem::decode(&bytes), item);
    }

    #[test]
    fn test_meta_item_data_offset_overflow() {
        let item = MetaItem { hash: 1, key_len: 1, value_len: 1, data_offset: DATA_OFFSET_MAX + 1 };
        assert!(matches!(item.encode(), Err(Error::CapacityExceeded(_))));
    }

    #[test]
    fn test_bit_writer_mixed_widths() {
        let mut writer = BitWriter::default();
        writer.put(0b101, 3);
        writer.put(0b00001, 5);
        writer.put(0xABCD, 16);
        let bytes = writer.finish();
        assert_eq!(bytes, vec![0b1010_0001, 0xAB, 0xCD]);

        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.get(3), 0b101);
        assert_eq!(reader.get(5), 1);
        assert_eq!(reader.get(16), 0xABCD);
    }

    #[test]
    fn test_capacity_rounding() {
        assert_eq!(capacity_for(0, 32), 0);
        assert_eq!(capacity_for(1, 32), 32);
        assert_eq!(capacity_for(32, 32), 32);
        assert_eq!(capacity_for(33, 32), 64);
        assert_eq!(capacity_for(17, 85), 85);
        assert_eq!(capacity_for(86, 85), 170);
    }

    #[test]
    fn test_bkdr_hash64() {
        assert_eq!(bkdr_hash64(b""), 0);
        assert_eq!(bkdr_hash64(b"a"), 97);
        assert_eq!(bkdr_hash64(b"ab"), 97 * 131 + 98);
        // Top bit is always cleared.
        let long = vec![0xFFu8; 64];
        assert_eq!(bkdr_hash64(&long) >> 63, 0);
    }

    #[test]
    fn test_data_record_padding() {
        let record = encode_data_record(b"key", b"value", 32);
        assert_eq!(record.len(), 32);
        assert_eq!(record[0], 3);
        assert_eq!(&record[1..4], b"key");
        assert_eq!(&record[4..9], b"value");
        assert!(record[9..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_argument_checks() {
        assert!(check_key(b"").is_err());
        assert!(check_key(&[1u8; 256]).is_err());
        assert!(check_key(&[1u8; 255]).is_ok());
        assert!(check_value(&vec![0u8; MAX_VALUE_SIZE + 1]).is_err());
        assert!(check_value(b"").is_ok());
        assert!(check_table_name("").is_err());
        assert!(check_table_name("a/b").is_err());
        assert!(check_table_name("users").is_ok());
    }
}
