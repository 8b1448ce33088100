//! Binlog: the database-wide write-ahead log.
//!
//! Every committed transaction is appended as one frame before its writes
//! become visible in the memtables. A single flush pass later applies the
//! queued frames to their tables oldest-first, marks each frame synced in
//! place, and once nothing is left truncates the log back to zero.
//!
//! ## Recovery
//!
//! On open the whole log is scanned. Frames whose synced flag is still 0
//! are queued again and must be replayed into the memtables by the caller.
//! Corrupt or truncated bytes are skipped.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use drhdb::binlog::{Binlog, WriteSet};
//!
//! # fn main() -> Result<(), drhdb::Error> {
//! let binlog = Binlog::open("db/binlog", false, 1 << 20)?;
//!
//! let mut writes = WriteSet::new();
//! writes.entry("default".to_string()).or_default().insert(b"key".to_vec(), Some(b"value".to_vec()));
//! binlog.append(binlog.next_txid(), writes, |_| {})?;
//!
//! binlog.flush(true, |_writes| Ok(()), || {})?;
//! # Ok(())
//! # }
//! ```

mod frame;

pub use frame::{
    decode_payload, encode_frame, encode_payload, scan_frames, Frame, TableWrites, WriteSet,
    FRAME_HEADER_SIZE, FRAME_TRAILER_SIZE, RECORD_HEADER_SIZE,
};

use crate::error::{Error, Result};
use crate::file::FileHandle;
use frame::SYNCED_FLAG_OFFSET;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// How long a blocked committer sleeps before re-checking for shutdown.
const BACKPRESSURE_WAIT: Duration = Duration::from_millis(100);

/// A logged transaction waiting to be applied to its tables.
#[derive(Debug, Clone)]
pub struct BinlogItem {
    /// Offset of the frame in the log.
    pub start: u64,
    /// Encoded frame length.
    pub size: u64,
    /// Transaction id.
    pub txid: u64,
    /// Writes of the transaction.
    pub writes: WriteSet,
}

#[derive(Debug, Default)]
struct Queue {
    items: VecDeque<BinlogItem>,
    /// Encoded bytes of all queued frames.
    bytes: usize,
}

/// Append-only transaction log with an in-memory queue of unsynced frames.
#[derive(Debug)]
pub struct Binlog {
    file: FileHandle,
    /// Logical end of the log. Held for the whole of an append and of the
    /// final truncation, so the two never interleave.
    end: Mutex<u64>,
    queue: Mutex<Queue>,
    /// Signalled whenever queued bytes go down.
    room: Condvar,
    /// Held by the running flush pass.
    flush_lock: Mutex<()>,
    last_txid: AtomicU64,
    closed: AtomicBool,
    sync_on_append: bool,
    queue_limit: usize,
}

impl Binlog {
    /// Opens or creates the log at `path` and queues every unsynced frame.
    ///
    /// # Arguments
    ///
    /// * `sync_on_append` - fsync after every appended frame
    /// * `queue_limit` - queued bytes above which committers block
    pub fn open<P: AsRef<Path>>(path: P, sync_on_append: bool, queue_limit: usize) -> Result<Self> {
        let file = FileHandle::open(path)?;
        let image = file.read_all()?;
        let frames = scan_frames(&image);

        let mut queue = Queue::default();
        let mut last_txid = 0;
        let mut synced = 0;
        for frame in frames {
            last_txid = last_txid.max(frame.txid);
            if frame.synced {
                synced += 1;
                continue;
            }
            queue.bytes += frame.size as usize;
            queue.items.push_back(BinlogItem {
                start: frame.start,
                size: frame.size,
                txid: frame.txid,
                writes: frame.writes,
            });
        }
        log::info!(
            "Opened binlog {}: {} bytes, {} unsynced transactions, {} already synced",
            file.path().display(),
            image.len(),
            queue.items.len(),
            synced
        );

        Ok(Self {
            file,
            end: Mutex::new(image.len() as u64),
            queue: Mutex::new(queue),
            room: Condvar::new(),
            flush_lock: Mutex::new(()),
            last_txid: AtomicU64::new(last_txid),
            closed: AtomicBool::new(false),
            sync_on_append,
            queue_limit,
        })
    }

    /// Returns a fresh transaction id: nanoseconds since the epoch, bumped
    /// past the last id handed out.
    pub fn next_txid(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let prev = self
            .last_txid
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| Some(now.max(last + 1)))
            .unwrap_or_else(|last| last);
        now.max(prev + 1)
    }

    /// Calls `f` with the writes of every queued frame, oldest first.
    pub fn replay<F: FnMut(&WriteSet)>(&self, mut f: F) {
        let queue = self.queue.lock();
        for item in &queue.items {
            f(&item.writes);
        }
    }

    /// Appends a transaction and returns the offset of its frame.
    ///
    /// `publish` runs after the frame is written and before any later frame
    /// can be appended, so memtable order matches log order. On a write
    /// failure the log is cut back to its previous length and `publish` is
    /// not called.
    ///
    /// Blocks while the queue holds more than the configured limit.
    ///
    /// # Errors
    ///
    /// Returns an error if the writes are invalid, the frame cannot be
    /// written, or the log is closed while waiting for room.
    pub fn append<F>(&self, txid: u64, writes: WriteSet, publish: F) -> Result<u64>
    where
        F: FnOnce(&WriteSet),
    {
        self.append_with(txid, writes, || self.wait_for_room(), publish)
    }

    /// Like [`Binlog::append`], but a full queue is emptied by calling
    /// `drain` on the committing thread instead of waiting for a flusher.
    ///
    /// `drain` is retried until the queue has room, since other committers
    /// may refill it in between.
    pub fn append_draining<R, F>(&self, txid: u64, writes: WriteSet, mut drain: R, publish: F) -> Result<u64>
    where
        R: FnMut() -> Result<()>,
        F: FnOnce(&WriteSet),
    {
        let make_room = || -> Result<()> {
            while self.is_full() {
                if self.closed.load(Ordering::Acquire) {
                    return Err(Error::invalid_state("binlog is closed"));
                }
                drain()?;
            }
            Ok(())
        };
        self.append_with(txid, writes, make_room, publish)
    }

    fn append_with<R, F>(&self, txid: u64, writes: WriteSet, make_room: R, publish: F) -> Result<u64>
    where
        R: FnOnce() -> Result<()>,
        F: FnOnce(&WriteSet),
    {
        let payload = encode_payload(&writes)?;
        let frame = encode_frame(txid, &payload)?;
        make_room()?;

        let mut end = self.end.lock();
        let start = *end;
        if let Err(e) = self.write_frame(start, &frame) {
            if let Err(truncate_err) = self.file.set_len(start) {
                log::error!("Failed to cut binlog back to {} bytes: {}", start, truncate_err);
            }
            return Err(e);
        }
        *end += frame.len() as u64;

        publish(&writes);
        let mut queue = self.queue.lock();
        queue.bytes += frame.len();
        queue.items.push_back(BinlogItem { start, size: frame.len() as u64, txid, writes });
        Ok(start)
    }

    fn write_frame(&self, start: u64, frame: &[u8]) -> Result<()> {
        self.file.write_at(start, frame)?;
        if self.sync_on_append {
            self.file.sync()?;
        }
        Ok(())
    }

    fn wait_for_room(&self) -> Result<()> {
        let mut queue = self.queue.lock();
        while queue.bytes >= self.queue_limit {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::invalid_state("binlog is closed"));
            }
            self.room.wait_for(&mut queue, BACKPRESSURE_WAIT);
        }
        Ok(())
    }

    /// Applies queued frames oldest-first.
    ///
    /// Each frame is handed to `apply` and then marked synced. A failing
    /// frame goes back to the front of the queue and the pass stops with
    /// the error. Once the queue is empty, `on_drained` runs and the log is
    /// truncated, both while appends are held off.
    ///
    /// With `wait` unset, a pass that finds another pass running returns
    /// `Ok(0)` immediately. Returns the number of frames applied.
    pub fn flush<A, D>(&self, wait: bool, mut apply: A, on_drained: D) -> Result<usize>
    where
        A: FnMut(&WriteSet) -> Result<()>,
        D: FnOnce(),
    {
        let _guard = if wait {
            self.flush_lock.lock()
        } else {
            match self.flush_lock.try_lock() {
                Some(guard) => guard,
                None => return Ok(0),
            }
        };

        let mut flushed = 0;
        loop {
            let item = match self.queue.lock().items.pop_front() {
                Some(item) => item,
                None => break,
            };
            if let Err(e) = apply(&item.writes).and_then(|_| self.mark_synced(item.start)) {
                self.queue.lock().items.push_front(item);
                return Err(e);
            }
            self.queue.lock().bytes -= item.size as usize;
            self.room.notify_all();
            flushed += 1;
        }

        self.truncate_if_drained(on_drained)?;
        Ok(flushed)
    }

    /// Sets the synced flag of the frame at `start`.
    pub fn mark_synced(&self, start: u64) -> Result<()> {
        self.file.write_at(start + SYNCED_FLAG_OFFSET, &[1])
    }

    fn truncate_if_drained<D: FnOnce()>(&self, on_drained: D) -> Result<()> {
        let mut end = self.end.lock();
        let queue = self.queue.lock();
        if !queue.items.is_empty() || *end == 0 {
            return Ok(());
        }
        on_drained();
        self.file.set_len(0)?;
        if self.sync_on_append {
            self.file.sync()?;
        }
        log::debug!("Binlog drained, truncated {} bytes", *end);
        *end = 0;
        Ok(())
    }

    /// Number of queued frames.
    pub fn len(&self) -> usize {
        self.queue.lock().items.len()
    }

    /// Whether no frame is waiting to be applied.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().items.is_empty()
    }

    /// Encoded bytes of the queued frames.
    pub fn queued_bytes(&self) -> usize {
        self.queue.lock().bytes
    }

    /// Whether the queue has reached its limit.
    pub fn is_full(&self) -> bool {
        self.queued_bytes() >= self.queue_limit
    }

    /// Logical length of the log file.
    pub fn size(&self) -> u64 {
        *self.end.lock()
    }

    /// Flushes the log to stable storage.
    pub fn sync(&self) -> Result<()> {
        let _end = self.end.lock();
        self.file.sync()
    }

    /// Wakes and fails every committer blocked on backpressure.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.room.notify_all();
    }
}
