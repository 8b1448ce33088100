//! Side-file persistence of a table's free-space allocators.
//!
//! Format: `[bincode(SpaceSnapshot)][crc32: u32 LE]`.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;

/// Free blocks of the metadata and data files of one table, plus the file
/// lengths they were computed against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceSnapshot {
    /// Length of the index file.
    pub index_len: u64,
    /// Logical length of the metadata file.
    pub meta_len: u64,
    /// Logical length of the data file.
    pub data_len: u64,
    /// Free blocks of the metadata file.
    pub meta_blocks: Vec<(u64, u64)>,
    /// Free blocks of the data file.
    pub data_blocks: Vec<(u64, u64)>,
}

impl SpaceSnapshot {
    /// Writes the snapshot to `path` through a temporary file and a rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let encoded = bincode::serialize(self)?;
        let mut buf = BytesMut::with_capacity(encoded.len() + 4);
        buf.put_slice(&encoded);
        buf.put_u32_le(crc32fast::hash(&encoded));

        let tmp = path.with_extension("fs.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Loads a snapshot. Returns `Ok(None)` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if data.len() < 4 {
            return Err(Error::corruption(format!("free-space snapshot too short: {:?}", path)));
        }

        let (body, mut trailer) = data.split_at(data.len() - 4);
        let expected = trailer.get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(Error::corruption(format!(
                "free-space snapshot checksum mismatch: expected {:#x}, got {:#x}",
                expected, actual
            )));
        }
        Ok(Some(bincode::deserialize(body)?))
    }

    /// Removes the snapshot file if it exists.
    pub fn remove(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
