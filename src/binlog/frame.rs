//! Binlog frame format.
//!
//! Each committed transaction is one frame:
//! - Synced (1 byte): 0 until the frame has been applied to its tables
//! - Payload length (4 bytes, LE)
//! - Transaction id (8 bytes, LE)
//! - Payload (variable): per-key records
//! - Transaction id again (8 bytes, LE)
//!
//! A record is a 5-byte bit-packed header `[tableLen:8][keyLen:8][valueLen:24]`
//! followed by table name, key and value. An empty value is a delete.

use crate::codec::{check_key, check_table_name, BitReader, BitWriter, MAX_VALUE_SIZE};
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::collections::BTreeMap;

/// Bytes in front of the payload: synced flag, payload length, txid.
pub const FRAME_HEADER_SIZE: usize = 13;

/// Trailing txid copy.
pub const FRAME_TRAILER_SIZE: usize = 8;

/// Bit-packed header of one per-key record.
pub const RECORD_HEADER_SIZE: usize = 5;

/// Offset of the synced flag inside a frame.
pub const SYNCED_FLAG_OFFSET: u64 = 0;

/// Pending writes of one table, `None` meaning delete.
pub type TableWrites = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// Pending writes of a transaction, grouped by table.
pub type WriteSet = BTreeMap<String, TableWrites>;

/// A frame decoded during recovery.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Offset of the frame in the log.
    pub start: u64,
    /// Encoded length, header and trailer included.
    pub size: u64,
    /// Whether the frame has already been applied.
    pub synced: bool,
    /// Transaction id.
    pub txid: u64,
    /// Decoded writes.
    pub writes: WriteSet,
}

/// Encodes the per-key records of a write set.
pub fn encode_payload(writes: &WriteSet) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for (table, entries) in writes {
        check_table_name(table)?;
        for (key, value) in entries {
            check_key(key)?;
            let value: &[u8] = value.as_deref().unwrap_or_default();
            if value.len() > MAX_VALUE_SIZE {
                return Err(Error::invalid_argument(format!(
                    "too large value size {}, max allowed: {} bytes",
                    value.len(),
                    MAX_VALUE_SIZE
                )));
            }

            let mut header = BitWriter::with_capacity(RECORD_HEADER_SIZE);
            header.put(table.len() as u64, 8);
            header.put(key.len() as u64, 8);
            header.put(value.len() as u64, 24);
            buf.extend_from_slice(&header.finish());
            buf.extend_from_slice(table.as_bytes());
            buf.extend_from_slice(key);
            buf.extend_from_slice(value);
        }
    }
    Ok(buf)
}

/// Decodes the per-key records of a payload.
pub fn decode_payload(mut data: &[u8]) -> Result<WriteSet> {
    let mut writes = WriteSet::new();
    while !data.is_empty() {
        if data.len() < RECORD_HEADER_SIZE {
            return Err(Error::corruption("truncated binlog record header"));
        }
        let mut header = BitReader::new(&data[..RECORD_HEADER_SIZE]);
        let table_len = header.get(8) as usize;
        let key_len = header.get(8) as usize;
        let value_len = header.get(24) as usize;
        data.advance(RECORD_HEADER_SIZE);

        if table_len == 0 || key_len == 0 {
            return Err(Error::corruption("binlog record with empty table name or key"));
        }
        if data.len() < table_len + key_len + value_len {
            return Err(Error::corruption("binlog record runs past its payload"));
        }
        let table = std::str::from_utf8(&data[..table_len])
            .map_err(|_| Error::corruption("binlog table name is not UTF-8"))?
            .to_string();
        data.advance(table_len);
        let key = data[..key_len].to_vec();
        data.advance(key_len);
        let value = (value_len > 0).then(|| data[..value_len].to_vec());
        data.advance(value_len);

        writes.entry(table).or_default().insert(key, value);
    }
    Ok(writes)
}

/// Wraps a payload into a frame with the synced flag cleared.
pub fn encode_frame(txid: u64, payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        Error::capacity_exceeded(format!("transaction payload of {} bytes is too large", payload.len()))
    })?;
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len() + FRAME_TRAILER_SIZE);
    buf.put_u8(0);
    buf.put_u32_le(len);
    buf.put_u64_le(txid);
    buf.put_slice(payload);
    buf.put_u64_le(txid);
    Ok(buf.to_vec())
}

/// Tries to decode one frame at the front of `data`.
///
/// Returns `None` when the bytes at this position are not a complete,
/// consistent frame.
fn decode_frame(mut data: &[u8]) -> Option<(bool, u64, WriteSet, usize)> {
    if data.len() < FRAME_HEADER_SIZE + FRAME_TRAILER_SIZE {
        return None;
    }
    let synced = match data.get_u8() {
        0 => false,
        1 => true,
        _ => return None,
    };
    let len = data.get_u32_le() as usize;
    let txid = data.get_u64_le();
    // Empty transactions are never logged.
    if len == 0 || data.len() < len + FRAME_TRAILER_SIZE {
        return None;
    }
    let payload = &data[..len];
    data.advance(len);
    if data.get_u64_le() != txid {
        return None;
    }
    let writes = decode_payload(payload).ok()?;
    Some((synced, txid, writes, FRAME_HEADER_SIZE + len + FRAME_TRAILER_SIZE))
}

/// Decodes every frame of a log image.
///
/// Bytes that do not start a valid frame are skipped one at a time until
/// the scan realigns; each skipped run is reported with `log::warn!`.
pub fn scan_frames(data: &[u8]) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut pos = 0usize;
    let mut corrupt_from: Option<usize> = None;

    while pos < data.len() {
        match decode_frame(&data[pos..]) {
            Some((synced, txid, writes, size)) => {
                if let Some(from) = corrupt_from.take() {
                    log::warn!("Skipped {} corrupt binlog bytes at offset {}", pos - from, from);
                }
                frames.push(Frame { start: pos as u64, size: size as u64, synced, txid, writes });
                pos += size;
            }
            None => {
                corrupt_from.get_or_insert(pos);
                pos += 1;
            }
        }
    }
    if let Some(from) = corrupt_from {
        log::warn!("Ignored {} trailing binlog bytes at offset {}", data.len() - from, from);
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_set(entries: &[(&str, &str, Option<&str>)]) -> WriteSet {
        let mut writes = WriteSet::new();
        for &(table, key, value) in entries {
            writes
                .entry(table.to_string())
                .or_default()
                .insert(key.as_bytes().to_vec(), value.map(|v| v.as_bytes().to_vec()));
        }
        writes
    }

    #[test]
    fn test_record_header_layout() {
        let writes = write_set(&[("t", "ab", Some("\x09\x09\x09"))]);
        let payload = encode_payload(&writes).unwrap();
        // tableLen=1, keyLen=2, valueLen=3 packed MSB-first.
        assert_eq!(&payload[..RECORD_HEADER_SIZE], &[1, 2, 0, 0, 3]);
        assert_eq!(&payload[RECORD_HEADER_SIZE..], b"tab\x09\x09\x09");
    }

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(0x0102, b"xyz").unwrap();
        assert_eq!(frame.len(), FRAME_HEADER_SIZE + 3 + FRAME_TRAILER_SIZE);
        assert_eq!(frame[0], 0);
        assert_eq!(&frame[1..5], &3u32.to_le_bytes());
        assert_eq!(&frame[5..13], &0x0102u64.to_le_bytes());
        assert_eq!(&frame[13..16], b"xyz");
        assert_eq!(&frame[16..], &0x0102u64.to_le_bytes());
    }

    #[test]
    fn test_tombstone_decodes_as_none() {
        let writes = write_set(&[("default", "gone", None), ("default", "kept", Some("v"))]);
        let decoded = decode_payload(&encode_payload(&writes).unwrap()).unwrap();
        assert_eq!(decoded, writes);
        assert_eq!(decoded["default"][&b"gone".to_vec()], None);
    }

    #[test]
    fn test_payload_rejects_bad_arguments() {
        assert!(encode_payload(&write_set(&[("", "k", Some("v"))])).is_err());
        assert!(encode_payload(&write_set(&[("t", "", Some("v"))])).is_err());
    }

    #[test]
    fn test_scan_stops_at_truncated_frame() {
        let mut log = Vec::new();
        for i in 0..3u64 {
            let writes = write_set(&[("t", &format!("k{}", i), Some("v"))]);
            log.extend(encode_frame(i + 1, &encode_payload(&writes).unwrap()).unwrap());
        }
        let partial = encode_frame(9, &encode_payload(&write_set(&[("t", "k9", Some("v"))])).unwrap()).unwrap();
        log.extend_from_slice(&partial[..partial.len() - 3]);

        let frames = scan_frames(&log);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames.iter().map(|f| f.txid).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(frames.iter().all(|f| !f.synced));
    }

    #[test]
    fn test_scan_resyncs_after_corruption() {
        let first = encode_frame(1, &encode_payload(&write_set(&[("t", "a", Some("1"))])).unwrap()).unwrap();
        let second = encode_frame(2, &encode_payload(&write_set(&[("t", "b", Some("2"))])).unwrap()).unwrap();

        let mut log = first.clone();
        // Break the trailing txid of the first frame.
        let last = log.len() - 1;
        log[last] ^= 0xFF;
        log.extend_from_slice(&[0xEE, 0xEE]);
        log.extend_from_slice(&second);

        let frames = scan_frames(&log);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].txid, 2);
        assert_eq!(frames[0].start, (first.len() + 2) as u64);
    }

    #[test]
    fn test_scan_reports_synced_flag() {
        let payload = encode_payload(&write_set(&[("t", "a", Some("1"))])).unwrap();
        let mut log = encode_frame(7, &payload).unwrap();
        log[0] = 1;
        let frames = scan_frames(&log);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].synced);
    }
}
