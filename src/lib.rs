//! # drhdb - An Embedded Deep-Re-Hash Key-Value Engine
//!
//! drhdb stores byte-string keys and values in named tables. Each table is a
//! persistent hash index whose overflowing buckets are split into new
//! sub-indexes on demand ("deep rehash"), so lookups stay a short chain of
//! positional reads no matter how large a table grows.
//!
//! ## Architecture
//!
//! - **Binlog**: database-wide write-ahead log of committed transactions
//! - **MemTable**: per-table overlay of writes not yet flushed to disk
//! - **Tables**: index, metadata and data files plus free-space allocators
//! - **Background tasks**: a flush thread draining the binlog into the
//!   tables, and a compaction thread reclaiming free space
//! - **Value cache**: per-table TTL cache of recently read values
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use drhdb::{DB, Options};
//!
//! # fn main() -> Result<(), drhdb::Error> {
//! // Open or create a database
//! let db = DB::open("./data", Options::default())?;
//!
//! // Write operations on the default table
//! db.set(b"key1", b"value1")?;
//! db.set(b"key2", b"value2")?;
//!
//! // Read operations
//! if let Some(value) = db.get(b"key1")? {
//!     println!("Found: {:?}", value);
//! }
//!
//! // Named tables
//! let users = db.table("users")?;
//! users.set(b"alice", b"admin")?;
//!
//! // Delete operations
//! db.remove(b"key1")?;
//! db.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Module declarations
pub mod binlog;
pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
mod file;
pub mod filespace;
pub mod memtable;
mod table;
pub mod transaction;

// Re-exports
pub use cache::CacheStats;
pub use config::Options;
pub use error::{Error, Result};
pub use table::{IntegrityReport, SpaceInfo};
pub use transaction::Transaction;

use binlog::{Binlog, WriteSet};
use codec::{check_key, check_table_name};
use crossbeam::channel::{bounded, select, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use table::DiskTable;

/// Name of the table used by the `DB` shortcuts.
pub const DEFAULT_TABLE: &str = "default";

/// Name of the binlog file inside the database directory.
pub const BINLOG_FILE_NAME: &str = "binlog";

/// Compaction steps one background tick may run on a single table.
const COMPACTION_STEPS_PER_TICK: usize = 64;

/// State shared by the database handle, table handles, transactions and
/// background threads.
pub(crate) struct Core {
    path: PathBuf,
    options: Options,
    tables: RwLock<HashMap<String, Arc<DiskTable>>>,
    binlog: Binlog,
    /// Wakes the flush thread after a commit.
    flush_wake: Sender<()>,
    closed: AtomicBool,
    /// A logged transaction could not be applied to its table.
    poisoned: AtomicBool,
}

impl Core {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::invalid_state("database is closed"));
        }
        if self.poisoned.load(Ordering::Acquire) {
            return Err(Error::invalid_state("database is poisoned by a failed flush"));
        }
        Ok(())
    }

    pub(crate) fn next_txid(&self) -> u64 {
        self.binlog.next_txid()
    }

    /// Returns table `name`, opening it on first use.
    fn open_table(&self, name: &str) -> Result<Arc<DiskTable>> {
        if let Some(table) = self.tables.read().get(name) {
            return Ok(Arc::clone(table));
        }
        let mut tables = self.tables.write();
        if let Some(table) = tables.get(name) {
            return Ok(Arc::clone(table));
        }
        let table = Arc::new(DiskTable::open(&self.path, name, &self.options)?);
        tables.insert(name.to_string(), Arc::clone(&table));
        Ok(table)
    }

    fn table(&self, name: &str) -> Result<Arc<DiskTable>> {
        check_table_name(name)?;
        self.check_open()?;
        self.open_table(name)
    }

    fn all_tables(&self) -> Vec<Arc<DiskTable>> {
        self.tables.read().values().cloned().collect()
    }

    pub(crate) fn get(&self, key: &[u8], table: &str) -> Result<Option<Vec<u8>>> {
        check_key(key)?;
        self.table(table)?.get(key)
    }

    /// Logs a transaction and publishes it to the memtables.
    pub(crate) fn commit(&self, txid: u64, writes: WriteSet) -> Result<()> {
        self.check_open()?;
        let mut handles = HashMap::with_capacity(writes.len());
        for name in writes.keys() {
            handles.insert(name.clone(), self.table(name)?);
        }

        let publish = |writes: &WriteSet| {
            for (name, entries) in writes {
                if let Some(table) = handles.get(name) {
                    table.memtable().apply(entries);
                }
            }
        };
        if self.options.auto_sync {
            self.binlog.append(txid, writes, publish)?;
        } else {
            // Without a flush thread nobody else would make room.
            self.binlog.append_draining(txid, writes, || self.flush(true).map(|_| ()), publish)?;
        }
        let _ = self.flush_wake.try_send(());
        Ok(())
    }

    /// Drains the binlog into the tables. Returns the number of applied
    /// transactions.
    fn flush(&self, wait: bool) -> Result<usize> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(Error::invalid_state("database is poisoned by a failed flush"));
        }
        self.binlog.flush(
            wait,
            |writes| self.apply_writes(writes),
            || {
                for table in self.tables.read().values() {
                    table.memtable().clear();
                }
            },
        )
    }

    fn apply_writes(&self, writes: &WriteSet) -> Result<()> {
        for (name, entries) in writes {
            let table = match self.open_table(name) {
                Ok(table) => table,
                Err(e) => {
                    self.poisoned.store(true, Ordering::Release);
                    log::error!("Table {} of a logged transaction cannot be opened: {}", name, e);
                    return Err(Error::internal(format!("table {} cannot be opened: {}", name, e)));
                }
            };
            for (key, value) in entries {
                match value {
                    Some(value) => table.apply_set(key, value)?,
                    None => table.apply_remove(key)?,
                }
            }
            if self.options.sync_binlog {
                table.sync_files()?;
            }
        }
        Ok(())
    }

    /// Runs bounded compaction on every table and saves the free-space
    /// snapshot of tables with nothing left to do.
    fn compact_tick(&self) {
        let quiet = self.binlog.is_empty();
        for table in self.all_tables() {
            if table.is_compacting() {
                continue;
            }
            let mut settled = false;
            for _ in 0..COMPACTION_STEPS_PER_TICK {
                match table.compact_step() {
                    Ok(true) => {}
                    Ok(false) => {
                        settled = true;
                        break;
                    }
                    Err(e) => {
                        log::error!("Compaction of table {} failed, retrying next tick: {}", table.name(), e);
                        break;
                    }
                }
            }
            if settled && quiet {
                if let Err(e) = table.persist_space() {
                    log::warn!("Failed to save free space of table {}: {}", table.name(), e);
                }
            }
        }
    }
}

/// Handles of the background threads.
/// Taken on close so the threads are joined once.
struct BackgroundTasks {
    shutdown: Sender<()>,
    workers: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    fn spawn(core: &Arc<Core>, wake: Receiver<()>) -> Result<Self> {
        // Never sent on: dropping the sender wakes every select below.
        let (shutdown, stop) = bounded::<()>(0);
        let mut workers = Vec::with_capacity(2);

        let flush_core = Arc::clone(core);
        let flush_stop = stop.clone();
        let interval = core.options.flush_interval;
        workers.push(thread::Builder::new().name("drhdb-flush".into()).spawn(move || loop {
            select! {
                recv(flush_stop) -> _ => break,
                recv(wake) -> _ => {},
                default(interval) => {},
            }
            if flush_core.poisoned.load(Ordering::Acquire) {
                log::error!("Flush task stopped: database is poisoned");
                break;
            }
            if let Err(e) = flush_core.flush(false) {
                log::error!("Background flush failed, retrying next tick: {}", e);
            }
        })?);

        let compact_core = Arc::clone(core);
        let interval = core.options.compaction_interval;
        workers.push(thread::Builder::new().name("drhdb-compact".into()).spawn(move || loop {
            select! {
                recv(stop) -> _ => break,
                default(interval) => compact_core.compact_tick(),
            }
        })?);

        Ok(Self { shutdown, workers })
    }

    fn stop(self) {
        drop(self.shutdown);
        for worker in self.workers {
            if worker.join().is_err() {
                log::error!("A background thread panicked");
            }
        }
    }
}

/// The main database handle.
///
/// Tables are opened lazily on first use. Writes go through the binlog and
/// become visible immediately via the memtables; the flush thread later
/// applies them to the table files.
///
/// # Thread Safety
///
/// `DB` is `Send + Sync` and can be shared across threads using `Arc<DB>`.
pub struct DB {
    core: Arc<Core>,
    tasks: Mutex<Option<BackgroundTasks>>,
}

impl std::fmt::Debug for DB {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DB")
            .field("path", &self.core.path)
            .field("closed", &self.core.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl DB {
    /// Opens a database at the specified path with the given options.
    ///
    /// Unsynced transactions found in the binlog are replayed into the
    /// memtables; they reach the table files on the next flush.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory holding the binlog and the table files
    /// * `options` - Configuration options for the database
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The options are invalid
    /// - The directory is missing and `create_if_missing` is unset
    /// - A table named in the binlog cannot be opened
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use drhdb::{DB, Options};
    ///
    /// # fn main() -> Result<(), drhdb::Error> {
    /// let db = DB::open("./my_database", Options::default())?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn open<P: AsRef<Path>>(path: P, options: Options) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        options.validate()?;

        if !path.exists() {
            if options.create_if_missing {
                std::fs::create_dir_all(&path)?;
            } else {
                return Err(Error::not_found(format!("Database directory does not exist: {:?}", path)));
            }
        }

        let binlog = Binlog::open(
            path.join(BINLOG_FILE_NAME),
            options.sync_binlog,
            options.binlog_queue_limit,
        )?;
        let (flush_wake, wake) = bounded(1);
        let core = Arc::new(Core {
            path,
            options,
            tables: RwLock::new(HashMap::new()),
            binlog,
            flush_wake,
            closed: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
        });

        let mut recovered = Vec::new();
        core.binlog.replay(|writes| recovered.push(writes.clone()));
        for writes in &recovered {
            for (name, entries) in writes {
                core.open_table(name)?.memtable().apply(entries);
            }
        }

        let tasks = if core.options.auto_sync {
            Some(BackgroundTasks::spawn(&core, wake)?)
        } else {
            None
        };

        log::info!(
            "Opened database at {:?}: {} transactions replayed",
            core.path,
            recovered.len()
        );
        Ok(Self { core, tasks: Mutex::new(tasks) })
    }

    /// Returns a handle to table `name`, creating its files on first use.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty, oversized or path-like name.
    pub fn table(&self, name: &str) -> Result<Table> {
        let table = self.core.table(name)?;
        Ok(Table { core: Arc::clone(&self.core), table })
    }

    /// Starts a transaction.
    pub fn begin(&self) -> Transaction {
        Transaction::new(Arc::clone(&self.core))
    }

    /// Reads `key` from the default table.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use drhdb::{DB, Options};
    /// # fn main() -> Result<(), drhdb::Error> {
    /// # let db = DB::open("./data", Options::default())?;
    /// if let Some(value) = db.get(b"key")? {
    ///     println!("{:?}", value);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.core.get(key, DEFAULT_TABLE)
    }

    /// Writes `key` to the default table. An empty value removes the key.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use drhdb::{DB, Options};
    /// # fn main() -> Result<(), drhdb::Error> {
    /// # let db = DB::open("./data", Options::default())?;
    /// db.set(b"key", b"value")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.set_to(key, value, DEFAULT_TABLE)
    }

    /// Removes `key` from the default table.
    pub fn remove(&self, key: &[u8]) -> Result<()> {
        self.remove_from(key, DEFAULT_TABLE)
    }

    /// Reads `key` from `table`.
    pub fn get_from(&self, key: &[u8], table: &str) -> Result<Option<Vec<u8>>> {
        self.core.get(key, table)
    }

    /// Writes `key` to `table` as a single-operation transaction.
    pub fn set_to(&self, key: &[u8], value: &[u8], table: &str) -> Result<()> {
        let mut tx = self.begin();
        tx.set_to(key, value, table)?;
        tx.commit()
    }

    /// Removes `key` from `table` as a single-operation transaction.
    pub fn remove_from(&self, key: &[u8], table: &str) -> Result<()> {
        let mut tx = self.begin();
        tx.remove_from(key, table)?;
        tx.commit()
    }

    /// Up to `max` items of the default table (`None` = all).
    pub fn items(&self, max: Option<usize>) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        self.table(DEFAULT_TABLE)?.items(max)
    }

    /// Up to `max` keys of the default table (`None` = all).
    pub fn keys(&self, max: Option<usize>) -> Result<Vec<Vec<u8>>> {
        self.table(DEFAULT_TABLE)?.keys(max)
    }

    /// Up to `max` values of the default table (`None` = all).
    pub fn values(&self, max: Option<usize>) -> Result<Vec<Vec<u8>>> {
        self.table(DEFAULT_TABLE)?.values(max)
    }

    /// Applies every logged transaction to the table files and truncates
    /// the binlog, waiting for a running background flush first.
    pub fn sync(&self) -> Result<()> {
        self.core.check_open()?;
        self.core.flush(true)?;
        Ok(())
    }

    /// Directory of the database.
    pub fn path(&self) -> &Path {
        &self.core.path
    }

    /// Options the database was opened with.
    pub fn options(&self) -> &Options {
        &self.core.options
    }

    /// Closes the database.
    ///
    /// Stops the background threads, applies whatever is left in the
    /// binlog and saves the free-space snapshots. Later operations on this
    /// handle, its tables and its transactions fail with `InvalidState`.
    /// Calling `close` more than once is harmless.
    pub fn close(&self) -> Result<()> {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        log::info!("Closing database at {:?}", self.core.path);

        if let Some(tasks) = self.tasks.lock().take() {
            tasks.stop();
        }
        self.core.binlog.close();

        if !self.core.poisoned.load(Ordering::Acquire) {
            self.core.flush(true)?;
        }
        if self.core.binlog.is_empty() {
            for table in self.core.all_tables() {
                table.persist_space()?;
            }
        }
        self.core.binlog.sync()?;

        log::info!("Database closed");
        Ok(())
    }
}

impl Drop for DB {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("Error closing database: {}", e);
        }
    }
}

/// Handle to one table of a database.
///
/// Cheap to clone; all handles of a table share its files, memtable and
/// value cache.
#[derive(Clone)]
pub struct Table {
    core: Arc<Core>,
    table: Arc<DiskTable>,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table").field("name", &self.table.name()).finish_non_exhaustive()
    }
}

impl Table {
    /// Table name.
    pub fn name(&self) -> &str {
        self.table.name()
    }

    /// Reads `key`, pending writes included.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        check_key(key)?;
        self.core.check_open()?;
        self.table.get(key)
    }

    /// Writes `key`. An empty value removes the key.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut tx = Transaction::new(Arc::clone(&self.core));
        tx.set_to(key, value, self.name())?;
        tx.commit()
    }

    /// Removes `key`.
    pub fn remove(&self, key: &[u8]) -> Result<()> {
        let mut tx = Transaction::new(Arc::clone(&self.core));
        tx.remove_from(key, self.name())?;
        tx.commit()
    }

    /// Up to `max` items (`None` = all), pending writes included.
    ///
    /// Item order follows the index layout, not key order; the map only
    /// sorts what was collected.
    pub fn items(&self, max: Option<usize>) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        self.core.check_open()?;
        self.table.items(max)
    }

    /// Up to `max` keys (`None` = all).
    pub fn keys(&self, max: Option<usize>) -> Result<Vec<Vec<u8>>> {
        Ok(self.items(max)?.into_keys().collect())
    }

    /// Up to `max` values (`None` = all).
    pub fn values(&self, max: Option<usize>) -> Result<Vec<Vec<u8>>> {
        Ok(self.items(max)?.into_values().collect())
    }

    /// Runs compaction passes until no free block is left to reclaim.
    /// Returns the number of passes that moved or truncated something.
    pub fn compact(&self) -> Result<usize> {
        self.core.check_open()?;
        let mut passes = 0;
        while self.table.compact_step()? {
            passes += 1;
        }
        log::debug!("Compacted table {} in {} passes", self.name(), passes);
        Ok(passes)
    }

    /// Free-space report of the table files.
    pub fn space(&self) -> SpaceInfo {
        self.table.space_info()
    }

    /// Walks every reachable metadata list and checks its ordering and
    /// its data records.
    ///
    /// # Errors
    ///
    /// Returns `Corruption` at the first inconsistency found.
    pub fn verify(&self) -> Result<IntegrityReport> {
        self.table.verify()
    }

    /// Value cache statistics, `None` if the cache is disabled.
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.table.cache().map(|cache| cache.stats())
    }

    /// Number of writes waiting in the memtable.
    pub fn pending(&self) -> usize {
        self.table.memtable().len()
    }

    /// Key and value bytes of the writes waiting in the memtable.
    pub fn pending_bytes(&self) -> usize {
        self.table.memtable().approximate_size()
    }
}
